//! Connection configuration.

use std::time::Duration;

/// Compression level for the deflate pipeline, re-exported from `flate2`.
pub use flate2::Compression as CompressionLevel;

/// Default cap on a single frame payload and on a reassembled message.
pub const MAX_PAYLOAD_READ: usize = 16 * 1024 * 1024;

/// Default deadline for the dial + Upgrade exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tuning knobs of the `permessage-deflate` extension.
#[derive(Debug, Clone)]
pub struct DeflateOptions {
    /// Compression level used by the local deflator.
    pub(crate) level: CompressionLevel,
    /// LZ77 window bits for both local pipelines (9-15).
    pub(crate) window_bits: u8,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            level: CompressionLevel::default(),
            window_bits: 9,
        }
    }
}

impl DeflateOptions {
    /// Sets the compression level.
    pub fn with_level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    /// Sets the LZ77 window size in bits; clamped to the 9-15 range RFC 7692
    /// permits.
    pub fn with_window_bits(mut self, bits: u8) -> Self {
        self.window_bits = bits.clamp(9, 15);
        self
    }
}

/// Per-endpoint configuration, shared by every connection the endpoint
/// creates.
#[derive(Debug, Clone)]
pub struct Options {
    /// Accept (server) or offer (client) `permessage-deflate`.
    pub(crate) deflate: Option<DeflateOptions>,
    /// Answer incoming pings with a pong carrying the same payload.
    pub(crate) ping_pong: bool,
    /// Validate that text messages are well-formed UTF-8.
    pub(crate) check_utf8: bool,
    /// Cap on a single frame payload.
    pub(crate) max_payload_read: usize,
    /// Cap on the reassembly buffer for fragmented messages.
    pub(crate) max_read_buffer: usize,
    /// Deadline for the dial + Upgrade exchange.
    pub(crate) handshake_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            deflate: None,
            ping_pong: true,
            check_utf8: false,
            max_payload_read: MAX_PAYLOAD_READ,
            max_read_buffer: MAX_PAYLOAD_READ * 2,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

impl Options {
    /// Enables `permessage-deflate` with default settings.
    pub fn with_deflate(mut self) -> Self {
        self.deflate = Some(DeflateOptions::default());
        self
    }

    /// Enables `permessage-deflate` with explicit settings.
    pub fn with_deflate_options(mut self, opts: DeflateOptions) -> Self {
        self.deflate = Some(opts);
        self
    }

    /// Controls whether pings are answered automatically (default: `true`).
    /// When disabled, incoming pings are dropped.
    pub fn with_ping_pong(mut self, enabled: bool) -> Self {
        self.ping_pong = enabled;
        self
    }

    /// Enables UTF-8 validation of text messages.
    pub fn with_utf8(mut self) -> Self {
        self.check_utf8 = true;
        self
    }

    /// Sets the cap on a single frame payload. The reassembly buffer cap
    /// follows at twice this value.
    pub fn with_max_payload_read(mut self, max: usize) -> Self {
        self.max_payload_read = max;
        self.max_read_buffer = max.saturating_mul(2);
        self
    }

    /// Sets the handshake deadline.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}
