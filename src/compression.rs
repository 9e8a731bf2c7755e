//! The `permessage-deflate` pipeline, per
//! [RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692).
//!
//! Compression is applied per message: the deflator runs the payload through
//! a raw DEFLATE stream with a `Sync` flush and strips the trailing
//! `00 00 FF FF` before transmission; the inflator appends that tail back
//! before inflating the reassembled payload. Context takeover (keeping the
//! LZ77 dictionary across messages) is controlled by the negotiated extension
//! parameters; this server always advertises `server_no_context_takeover` and
//! resets its deflator after every message.

use std::io;

use bytes::BytesMut;

use nom::{
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::{digit1, space0},
    combinator::opt,
    sequence::{pair, preceded},
    IResult,
};

use crate::options::{CompressionLevel, DeflateOptions};

static PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// The 4-byte tail every DEFLATE block flushed with `Sync` ends in; stripped
/// on send and re-appended on receive (RFC 7692 §7.2.1/§7.2.2).
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Parsed parameters of a `permessage-deflate` offer or response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DeflateExtension {
    pub(crate) server_no_context_takeover: bool,
    pub(crate) client_no_context_takeover: bool,
    pub(crate) server_max_window_bits: Option<u8>,
    pub(crate) client_max_window_bits: Option<u8>,
}

impl DeflateExtension {
    /// The parameter set a server answers with once it accepts the
    /// extension: its own compressor resets after every message and the
    /// client may use the full LZ77 window.
    pub(crate) fn server_response() -> Self {
        Self {
            server_no_context_takeover: true,
            client_max_window_bits: Some(15),
            ..Self::default()
        }
    }

    /// The offer a client includes in its Upgrade request.
    pub(crate) fn client_offer(opts: &DeflateOptions) -> Self {
        Self {
            client_max_window_bits: Some(opts.window_bits),
            ..Self::default()
        }
    }

    /// Parses one element of a `Sec-WebSocket-Extensions` header.
    ///
    /// Unknown parameter keys are ignored; a malformed parameter list is an
    /// error so a garbled offer is treated as no offer at all.
    fn parse(input: &str) -> Result<Self, nom::Err<nom::error::Error<&str>>> {
        let mut this = Self::default();
        let (remaining, _) = tag_no_case(PERMESSAGE_DEFLATE)(input)?;
        this.parse_params(remaining)?;
        Ok(this)
    }

    fn parse_params<'a>(
        &mut self,
        mut input: &'a str,
    ) -> Result<(), nom::Err<nom::error::Error<&'a str>>> {
        while !input.trim_end().is_empty() {
            let (remaining, (key, value)) = Self::parse_param(input)?;
            match key {
                "client_no_context_takeover" => self.client_no_context_takeover = true,
                "server_no_context_takeover" => self.server_no_context_takeover = true,
                "server_max_window_bits" => {
                    self.server_max_window_bits =
                        Some(value.and_then(|v| v.parse().ok()).unwrap_or(0));
                }
                "client_max_window_bits" => {
                    self.client_max_window_bits =
                        Some(value.and_then(|v| v.parse().ok()).unwrap_or(0));
                }
                _ => {}
            }

            input = remaining;
        }

        Ok(())
    }

    /// Parses a single `; key[=value]` parameter.
    fn parse_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
        preceded(
            pair(space0, tag(";")),
            preceded(
                space0,
                pair(
                    take_while1(|c: char| c.is_alphanumeric() || c == '_'),
                    opt(preceded(tag("="), digit1)),
                ),
            ),
        )(input)
    }
}

impl std::fmt::Display for DeflateExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", PERMESSAGE_DEFLATE)?;

        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        if let Some(bits) = self.server_max_window_bits {
            if (9..=15).contains(&bits) {
                write!(f, "; server_max_window_bits={}", bits)?;
            } else {
                write!(f, "; server_max_window_bits")?;
            }
        }
        if let Some(bits) = self.client_max_window_bits {
            if (9..=15).contains(&bits) {
                write!(f, "; client_max_window_bits={}", bits)?;
            } else {
                write!(f, "; client_max_window_bits")?;
            }
        }

        Ok(())
    }
}

/// Looks for a `permessage-deflate` element in a `Sec-WebSocket-Extensions`
/// header value. The header may list several extensions separated by commas;
/// the first matching element wins.
pub(crate) fn parse_offer(header: &str) -> Option<DeflateExtension> {
    header
        .split(',')
        .filter_map(|element| DeflateExtension::parse(element.trim()).ok())
        .next()
}

/// Builds the compressor/decompressor pair for one endpoint of a connection
/// with negotiated parameters `ext`.
///
/// Window bits offered by the peer are honored when they fall in the valid
/// 9-15 range; a parameter without a value means the peer may use the full
/// 15-bit window, so the local inflator sizes for that. The server deflator
/// always resets per message because the response advertises
/// `server_no_context_takeover`.
pub(crate) fn negotiated_pipelines(
    role: crate::codec::Role,
    opts: &DeflateOptions,
    ext: &DeflateExtension,
) -> (Deflator, Inflator) {
    fn window(param: Option<u8>) -> u8 {
        match param {
            Some(bits) if (9..=15).contains(&bits) => bits,
            _ => 15,
        }
    }

    log::debug!(
        "deflate negotiated for {role}: server_no_context_takeover={} \
         client_no_context_takeover={} server_max_window_bits={:?} \
         client_max_window_bits={:?}",
        ext.server_no_context_takeover,
        ext.client_no_context_takeover,
        ext.server_max_window_bits,
        ext.client_max_window_bits,
    );

    match role {
        crate::codec::Role::Server => {
            let deflator = Deflator::new(
                opts.level,
                opts.window_bits.min(window(ext.server_max_window_bits)),
                true,
            );
            let inflator = Inflator::new(
                window(ext.client_max_window_bits),
                ext.client_no_context_takeover,
            );
            (deflator, inflator)
        }
        crate::codec::Role::Client => {
            let deflator = Deflator::new(
                opts.level,
                opts.window_bits.min(window(ext.client_max_window_bits)),
                ext.client_no_context_takeover,
            );
            let inflator = Inflator::new(
                window(ext.server_max_window_bits),
                ext.server_no_context_takeover,
            );
            (deflator, inflator)
        }
    }
}

fn deflate_error(err: flate2::CompressError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("deflate: {}", err))
}

fn inflate_error(err: flate2::DecompressError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("inflate: {}", err))
}

fn corrupt_stream() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "corrupt deflate stream")
}

/// Stack scratch buffer size for one (de)compression call.
const SCRATCH: usize = 4096;

/// Shared driver for both directions of the pipeline.
///
/// Feeds `input` through `step` one scratch buffer at a time and appends
/// whatever the stream produces to `out`. `step` performs a single flate2
/// call and reports `(consumed, produced)` for it. The loop keeps going
/// while there is input left or the scratch buffer filled completely (more
/// output is pending); a call that moves neither counter while input
/// remains means the stream ended early or is stuck, which on these
/// sync-flushed message streams is corruption.
fn pump<F>(
    mut input: &[u8],
    out: &mut BytesMut,
    mut step: F,
) -> io::Result<()>
where
    F: FnMut(&[u8], &mut [u8]) -> io::Result<(usize, usize)>,
{
    let mut scratch = [0u8; SCRATCH];

    loop {
        let (consumed, produced) = step(input, &mut scratch)?;
        out.extend_from_slice(&scratch[..produced]);
        input = &input[consumed..];

        if input.is_empty() && produced < scratch.len() {
            return Ok(());
        }
        if consumed == 0 && produced == 0 {
            return Err(corrupt_stream());
        }
    }
}

/// Streaming compressor for outbound messages.
pub(crate) struct Deflator {
    compress: flate2::Compress,
    /// Reset the dictionary after every message (`no_context_takeover`).
    reset_per_message: bool,
}

impl Deflator {
    pub(crate) fn new(level: CompressionLevel, window_bits: u8, reset_per_message: bool) -> Self {
        Self {
            compress: flate2::Compress::new_with_window_bits(level, false, window_bits),
            reset_per_message,
        }
    }

    /// Compresses one complete message payload, returning the raw DEFLATE
    /// bytes with the trailing `00 00 FF FF` removed.
    pub(crate) fn compress(&mut self, input: &[u8]) -> io::Result<BytesMut> {
        let mut out = BytesMut::new();
        let compress = &mut self.compress;

        pump(input, &mut out, |chunk, scratch| {
            let (in0, out0) = (compress.total_in(), compress.total_out());
            compress
                .compress(chunk, scratch, flate2::FlushCompress::None)
                .map_err(deflate_error)?;
            Ok((
                (compress.total_in() - in0) as usize,
                (compress.total_out() - out0) as usize,
            ))
        })?;

        // one sync flush terminates the block; follow-up calls only drain
        // output that did not fit the scratch buffer
        let mut flush = flate2::FlushCompress::Sync;
        pump(&[], &mut out, |_, scratch| {
            let out0 = compress.total_out();
            compress.compress(&[], scratch, flush).map_err(deflate_error)?;
            flush = flate2::FlushCompress::None;
            Ok((0, (compress.total_out() - out0) as usize))
        })?;

        if out.ends_with(&DEFLATE_TAIL) {
            out.truncate(out.len() - DEFLATE_TAIL.len());
        }
        if self.reset_per_message {
            compress.reset();
        }
        Ok(out)
    }
}

/// Streaming decompressor for inbound messages.
pub(crate) struct Inflator {
    decompress: flate2::Decompress,
    reset_per_message: bool,
}

impl Inflator {
    pub(crate) fn new(window_bits: u8, reset_per_message: bool) -> Self {
        Self {
            decompress: flate2::Decompress::new_with_window_bits(false, window_bits),
            reset_per_message,
        }
    }

    /// Inflates one complete message payload, appending the 4-byte tail the
    /// sender stripped.
    pub(crate) fn decompress(&mut self, input: &[u8]) -> io::Result<BytesMut> {
        let mut out = BytesMut::new();
        let decompress = &mut self.decompress;

        let mut step = |chunk: &[u8], scratch: &mut [u8]| {
            let (in0, out0) = (decompress.total_in(), decompress.total_out());
            decompress
                .decompress(chunk, scratch, flate2::FlushDecompress::None)
                .map_err(inflate_error)?;
            Ok((
                (decompress.total_in() - in0) as usize,
                (decompress.total_out() - out0) as usize,
            ))
        };

        pump(input, &mut out, &mut step)?;
        pump(&DEFLATE_TAIL, &mut out, &mut step)?;

        if self.reset_per_message {
            decompress.reset(false);
        }
        Ok(out)
    }
}
