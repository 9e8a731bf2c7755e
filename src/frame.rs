//! WebSocket frames as defined in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! Two representations exist side by side:
//!
//! - [`Frame`]: the wire-level unit, carrying the FIN flag, the compression
//!   bit (RSV1), an optional masking key and a mutable payload. Produced and
//!   consumed by the codec.
//! - [`Message`]: the application-level unit delivered to callbacks after
//!   fragmentation reassembly and decompression, carrying only an opcode and
//!   an immutable payload.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |     Extended payload length continued, if payload len == 127  |
//! +---------------------------------------------------------------+
//! |                               |  Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |    Masking-key (continued)    |          Payload Data         |
//! +-------------------------------+ - - - - - - - - - - - - - - - +
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```

use bytes::{Bytes, BytesMut};

use crate::{close::CloseCode, WsError};

/// WebSocket operation code identifying the semantic of a frame.
///
/// Data frames: `Continuation` (0x0), `Text` (0x1), `Binary` (0x2).
/// Control frames: `Close` (0x8), `Ping` (0x9), `Pong` (0xA).
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected during decode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames must not be fragmented and carry at most 125 payload
    /// bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WsError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A complete message delivered to (or sent by) the application.
///
/// Payloads are immutable [`Bytes`]; masking and compression never appear at
/// this level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Frame type the message was assembled from (`Text` or `Binary` for
    /// data, or one of the control opcodes when sent explicitly).
    pub opcode: OpCode,
    /// The message payload, already reassembled and decompressed.
    pub payload: Bytes,
}

impl Message {
    /// Creates a text message.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Text,
            payload: payload.into(),
        }
    }

    /// Creates a binary message.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Binary,
            payload: payload.into(),
        }
    }

    /// Creates a ping with the given payload (at most 125 bytes on the wire).
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Ping,
            payload: payload.into(),
        }
    }

    /// Creates a pong answering a ping.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Pong,
            payload: payload.into(),
        }
    }

    /// Creates a close message from a status code and a UTF-8 reason.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);

        Self {
            opcode: OpCode::Close,
            payload: payload.into(),
        }
    }

    /// `true` when the message is a text message.
    pub fn is_text(&self) -> bool {
        self.opcode == OpCode::Text
    }

    /// `true` when the message is a binary message.
    pub fn is_binary(&self) -> bool {
        self.opcode == OpCode::Binary
    }

    /// The payload as a string slice, when it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Message::text(value.to_owned())
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Message::text(value)
    }
}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self {
        Message::binary(value)
    }
}

/// Largest possible frame header: 2 fixed bytes, 8 extended-length bytes and
/// a 4-byte masking key.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// A single wire-level frame.
///
/// Constructed by the decoder for inbound traffic and by the connection task
/// for outbound traffic. The masking key is applied by the codec according to
/// the connection role; application code never sees masked payloads.
#[derive(Debug)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Frame type.
    pub opcode: OpCode,
    /// RSV1: set when the message payload is (still) compressed.
    pub(crate) is_compressed: bool,
    /// Masking key, present on client-to-server frames.
    pub(crate) mask: Option<[u8; 4]>,
    /// Payload bytes, unmasked.
    pub payload: BytesMut,
}

impl From<Message> for Frame {
    fn from(value: Message) -> Self {
        Frame::new(true, value.opcode, None, value.payload.as_ref())
    }
}

impl Frame {
    /// Creates an uncompressed frame.
    pub fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload: impl Into<BytesMut>) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
            is_compressed: false,
        }
    }

    /// Creates a frame whose payload already went through the deflate
    /// pipeline; RSV1 will be set on the wire.
    pub(crate) fn compressed(fin: bool, opcode: OpCode, payload: impl Into<BytesMut>) -> Self {
        Self {
            fin,
            opcode,
            mask: None,
            payload: payload.into(),
            is_compressed: true,
        }
    }

    /// Status code of a close frame, when the payload carries one.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?);
        Some(CloseCode::from(code))
    }

    /// UTF-8 reason of a close frame.
    ///
    /// Returns an error when the reason bytes are not valid UTF-8, which is
    /// itself a protocol violation.
    pub fn close_reason(&self) -> crate::Result<Option<&str>> {
        if self.payload.len() <= 2 {
            return Ok(None);
        }
        std::str::from_utf8(&self.payload[2..])
            .map(Some)
            .map_err(|_| WsError::InvalidUtf8)
    }

    /// Applies the masking key to the payload, generating a fresh random key
    /// when none is present.
    pub(crate) fn mask(&mut self) {
        let mask = self.mask.unwrap_or_else(rand::random);
        crate::mask::apply_mask(&mut self.payload, mask);
        self.mask = Some(mask);
    }

    /// Writes the frame header into `head`, returning the header length.
    ///
    /// The shortest of the three length encodings is always chosen.
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | (self.is_compressed as u8) << 6 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_control_predicate() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(!OpCode::Continuation.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
    }

    #[test]
    fn opcode_rejects_reserved_values() {
        for byte in [0x3u8, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
            assert!(OpCode::try_from(byte).is_err());
        }
    }

    #[test]
    fn opcode_byte_round_trip() {
        for byte in [0x0u8, 0x1, 0x2, 0x8, 0x9, 0xA] {
            assert_eq!(u8::from(OpCode::try_from(byte).unwrap()), byte);
        }
    }

    #[test]
    fn close_message_layout() {
        let msg = Message::close(CloseCode::Normal, "done");
        assert_eq!(&msg.payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&msg.payload[2..], b"done");
    }

    #[test]
    fn close_frame_accessors() {
        let frame = Frame::from(Message::close(CloseCode::Away, "moving"));
        assert_eq!(frame.close_code(), Some(CloseCode::Away));
        assert_eq!(frame.close_reason().unwrap(), Some("moving"));

        let empty = Frame::new(true, OpCode::Close, None, &[][..]);
        assert_eq!(empty.close_code(), None);
        assert_eq!(empty.close_reason().unwrap(), None);
    }

    #[test]
    fn head_uses_shortest_length_encoding() {
        let mut head = [0u8; MAX_HEAD_SIZE];

        let frame = Frame::new(true, OpCode::Binary, None, bytes::Bytes::from(vec![0u8; 125]));
        assert_eq!(frame.fmt_head(&mut head), 2);
        assert_eq!(head[1], 125);

        let frame = Frame::new(true, OpCode::Binary, None, bytes::Bytes::from(vec![0u8; 126]));
        assert_eq!(frame.fmt_head(&mut head), 4);
        assert_eq!(head[1], 126);
        assert_eq!(u16::from_be_bytes([head[2], head[3]]), 126);

        let frame = Frame::new(true, OpCode::Binary, None, bytes::Bytes::from(vec![0u8; 65535]));
        assert_eq!(frame.fmt_head(&mut head), 4);
        assert_eq!(u16::from_be_bytes([head[2], head[3]]), 65535);

        let frame = Frame::new(true, OpCode::Binary, None, bytes::Bytes::from(vec![0u8; 65536]));
        assert_eq!(frame.fmt_head(&mut head), 10);
        assert_eq!(head[1], 127);
        let mut len = [0u8; 8];
        len.copy_from_slice(&head[2..10]);
        assert_eq!(u64::from_be_bytes(len), 65536);
    }

    #[test]
    fn head_sets_mask_bit_and_key() {
        let key = [0xAA, 0xBB, 0xCC, 0xDD];
        let frame = Frame::new(true, OpCode::Text, Some(key), &b"hello world"[..]);

        let mut head = [0u8; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head);

        assert_eq!(size, 6);
        assert_eq!(head[0], 0x81);
        assert_eq!(head[1], 0x80 | 11);
        assert_eq!(&head[2..6], &key);
    }

    #[test]
    fn compressed_frame_sets_rsv1() {
        let frame = Frame::compressed(true, OpCode::Text, &b"x"[..]);
        let mut head = [0u8; MAX_HEAD_SIZE];
        frame.fmt_head(&mut head);
        assert_eq!(head[0] & 0x40, 0x40);
    }

    #[test]
    fn mask_round_trip() {
        let mut frame = Frame::new(true, OpCode::Binary, Some([1, 2, 3, 4]), &b"mask me"[..]);
        let original = frame.payload.clone();

        frame.mask();
        assert_ne!(frame.payload, original);

        // applying the same key twice restores the payload
        frame.mask();
        assert_eq!(frame.payload, original);
    }
}
