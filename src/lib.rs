//! Asynchronous WebSocket client and server engine.
//!
//! `wavesock` implements the WebSocket protocol as defined in
//! [RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455) over plain TCP or
//! TLS, together with the `permessage-deflate` compression extension from
//! [RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692).
//!
//! The crate is organized in three layers:
//!
//! - **Codec layer** ([`codec`], [`frame`]): incremental frame parsing and
//!   serialization over a byte stream, including masking and protocol
//!   validation.
//! - **Connection layer**: one task per connection that drives the HTTP
//!   Upgrade handshake, reassembles fragmented messages, answers control
//!   frames and delivers complete messages to application callbacks.
//! - **Endpoint layer** ([`Server`], [`Client`]): TCP listener and dialer that
//!   construct connections and manage their lifecycle.
//!
//! # Server
//!
//! ```no_run
//! use wavesock::{Options, Server};
//!
//! #[tokio::main]
//! async fn main() -> wavesock::Result<()> {
//!     let server = Server::new("127.0.0.1:8001", Options::default())
//!         .on_message(|conn, msg| {
//!             conn.send(msg);
//!         });
//!     server.listen().await
//! }
//! ```
//!
//! # Client
//!
//! ```no_run
//! use wavesock::{Client, Message};
//!
//! #[tokio::main]
//! async fn main() -> wavesock::Result<()> {
//!     let client = Client::new("ws://127.0.0.1:8001/")?
//!         .on_message(|_conn, msg| {
//!             println!("received: {:?}", msg.as_text());
//!         });
//!     let conn = client.connect().await?;
//!     conn.send(Message::text("hello"));
//!     Ok(())
//! }
//! ```

pub mod close;
pub mod codec;
mod compression;
mod connection;
pub mod frame;
mod handshake;
mod mask;
mod options;
mod stream;

mod client;
mod server;

pub use client::Client;
pub use close::CloseCode;
pub use codec::Role;
pub use connection::{ConnectionHandle, ConnectionState};
pub use frame::{Frame, Message, OpCode};
pub use handshake::Request;
pub use options::{CompressionLevel, DeflateOptions, Options};
pub use server::Server;
pub use stream::MaybeTlsStream;

use thiserror::Error;

/// A result type for WebSocket operations, using `WsError` as the error type.
pub type Result<T> = std::result::Result<T, WsError>;

/// Errors that can occur while establishing or driving a WebSocket
/// connection.
///
/// Variants group into the failure domains of the protocol:
///
/// - Configuration errors (bad URL, unsupported scheme) surface synchronously
///   from constructors.
/// - Handshake errors (missing headers, bad status, accept-key mismatch)
///   terminate the connection before it opens.
/// - Protocol errors (reserved bits, bad opcodes, masking violations,
///   oversized frames) fail an open connection.
/// - I/O and compression errors wrap the underlying transport or DEFLATE
///   stream failure.
/// - Peer-initiated closure has its own kind (`ClosedByPeer`) so endpoints
///   can tell a clean shutdown from a failure.
#[derive(Error, Debug)]
pub enum WsError {
    /// The URL has a scheme other than `ws` or `wss`.
    #[error("Invalid url scheme, expected ws or wss")]
    InvalidScheme,

    /// The URL is missing a host component.
    #[error("Url has no host")]
    MissingHost,

    /// Wraps errors from URL parsing.
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),

    /// Wraps I/O errors from the transport or the DEFLATE streams.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The handshake did not complete within the configured timeout.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// The HTTP request or response could not be parsed.
    #[error("Malformed http message")]
    BadHttpMessage,

    /// The Upgrade request grew past the handshake buffer limit.
    #[error("Handshake request too large")]
    HandshakeTooLarge,

    /// The peer answered the Upgrade request with a status other than 101.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// A header required by the Upgrade exchange is absent.
    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    /// The `Sec-WebSocket-Version` header is not 13.
    #[error("Sec-WebSocket-Version must be 13")]
    InvalidVersion,

    /// The server's `Sec-WebSocket-Accept` does not match the sent key.
    #[error("Sec-WebSocket-Accept mismatch")]
    InvalidAcceptKey,

    /// A frame carried an opcode outside the set defined by RFC 6455.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// The reserved bits rsv2/rsv3 were set, or rsv1 was set on a control
    /// frame.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A compressed frame arrived on a connection that never negotiated
    /// `permessage-deflate`, or rsv1 was set on a continuation frame.
    #[error("Compressed frame without negotiated compression")]
    CompressionNotNegotiated,

    /// A control frame had the FIN bit clear.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame carried more than 125 payload bytes.
    #[error("Control frame payload too large")]
    ControlFrameTooLarge,

    /// A client-to-server frame was unmasked, or a server-to-client frame
    /// was masked.
    #[error("Frame masking violates role policy")]
    BadFrameMask,

    /// A frame or reassembled message exceeded the configured size limits.
    #[error("Frame too large")]
    FrameTooLarge,

    /// A data frame with a non-continuation opcode arrived while a
    /// fragmented message was still open.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// A continuation frame arrived with no fragmented message in progress.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// A text message payload is not valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUtf8,

    /// A close frame carried a 1-byte payload.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close frame carried a code that must not appear on the wire.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// The peer initiated the close handshake; its close frame was received
    /// and answered before the transport went down.
    #[error("Closed by peer")]
    ClosedByPeer,

    /// The connection is closed; no further frames can be sent or received.
    #[error("Connection is closed")]
    ConnectionClosed,
}

impl WsError {
    /// Close code transmitted to the peer when this error fails an open
    /// connection.
    pub(crate) fn close_code(&self) -> CloseCode {
        match self {
            WsError::FrameTooLarge => CloseCode::Size,
            WsError::InvalidUtf8 => CloseCode::Invalid,
            WsError::InvalidOpCode(_)
            | WsError::ReservedBitsNotZero
            | WsError::CompressionNotNegotiated
            | WsError::ControlFrameFragmented
            | WsError::ControlFrameTooLarge
            | WsError::BadFrameMask
            | WsError::InvalidFragment
            | WsError::InvalidContinuationFrame
            | WsError::InvalidCloseFrame
            | WsError::InvalidCloseCode => CloseCode::Protocol,
            _ => CloseCode::Error,
        }
    }
}
