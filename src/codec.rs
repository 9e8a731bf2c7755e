//! Incremental frame codec for use with Tokio's framed streams.
//!
//! The [`Decoder`] consumes a growing byte buffer in three stages (fixed
//! header, extended length + masking key, payload) and never removes bytes
//! from the buffer until a full stage is available. This makes the parse
//! insensitive to how the transport chunks the stream: feeding it one byte at
//! a time produces the same frames as feeding it the whole stream at once.
//!
//! Protocol validation happens as early as the necessary bytes are parsed:
//! reserved bits, opcode range, control frame constraints, the role-dependent
//! masking policy and payload size limits are all checked before any payload
//! is buffered.

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_HEAD_SIZE},
    WsError,
};

/// The role an endpoint takes on a connection.
///
/// The role decides the masking policy in both directions: clients mask every
/// outgoing frame and must receive unmasked frames, servers never mask and
/// must receive masked frames.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Parsing state between calls to [`Decoder::decode`].
enum ReadState {
    /// Fixed two bytes consumed; waiting for extended length and mask key.
    Header(Header),
    /// Full header consumed; waiting for the payload.
    Payload(HeaderAndMask),
}

/// Fields of the fixed frame header.
struct Header {
    fin: bool,
    rsv1: bool,
    masked: bool,
    opcode: OpCode,
    /// Bytes of extended length encoding still to read (0, 2 or 8).
    extra: usize,
    /// The raw 7-bit length code.
    length_code: u8,
    /// Total remaining header size: extended length plus mask key.
    header_size: usize,
}

/// Header plus resolved payload length and masking key.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Stateful frame parser over a byte buffer.
pub struct Decoder {
    role: Role,
    state: Option<ReadState>,
    /// Whether `permessage-deflate` was negotiated; gates the RSV1 bit.
    deflate_negotiated: bool,
    /// Maximum accepted payload length for a single frame.
    max_payload_len: usize,
}

impl Decoder {
    pub fn new(role: Role, deflate_negotiated: bool, max_payload_len: usize) -> Self {
        Self {
            role,
            state: None,
            deflate_negotiated,
            max_payload_len,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    let rsv1 = src[0] & 0b0100_0000 != 0;

                    if src[0] & 0b0011_0000 != 0 {
                        return Err(WsError::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;

                    if rsv1 && !self.deflate_negotiated {
                        return Err(WsError::CompressionNotNegotiated);
                    }
                    if rsv1 && (opcode.is_control() || opcode == OpCode::Continuation) {
                        // RSV1 only marks the first frame of a data message.
                        return Err(WsError::ReservedBitsNotZero);
                    }
                    if opcode.is_control() && !fin {
                        return Err(WsError::ControlFrameFragmented);
                    }

                    let masked = src[1] & 0b1000_0000 != 0;
                    match self.role {
                        Role::Server if !masked => return Err(WsError::BadFrameMask),
                        Role::Client if masked => return Err(WsError::BadFrameMask),
                        _ => {}
                    }

                    let length_code = src[1] & 0x7F;
                    if opcode.is_control() && length_code > 125 {
                        return Err(WsError::ControlFrameTooLarge);
                    }

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        rsv1,
                        masked,
                        opcode,
                        length_code,
                        extra,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len: usize = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        8 => {
                            let len = src.get_u64();
                            if len & (1 << 63) != 0 {
                                return Err(WsError::FrameTooLarge);
                            }
                            match usize::try_from(len) {
                                Ok(len) => len,
                                Err(_) => return Err(WsError::FrameTooLarge),
                            }
                        }
                        _ => unreachable!(),
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if payload_len > self.max_payload_len {
                        return Err(WsError::FrameTooLarge);
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let header = header_and_mask.header;
                    let mut payload = src.split_to(header_and_mask.payload_len);

                    // Unmasking happens here so every layer above sees plain
                    // payload bytes.
                    if let Some(mask) = header_and_mask.mask {
                        crate::mask::apply_mask(&mut payload, mask);
                    }

                    let mut frame = Frame::new(header.fin, header.opcode, None, payload);
                    frame.is_compressed = header.rsv1;

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// Frame serializer. Client-role encoders mask every frame with a fresh
/// random key.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WsError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.role == Role::Client {
            frame.mask();
        }

        let mut head = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head);

        dst.extend_from_slice(&head[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

/// Combined [`Decoder`] and [`Encoder`] for use with
/// [`tokio_util::codec::Framed`].
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    pub fn new(role: Role, deflate_negotiated: bool, max_payload_len: usize) -> Self {
        Self {
            decoder: Decoder::new(role, deflate_negotiated, max_payload_len),
            encoder: Encoder::new(role),
        }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}
