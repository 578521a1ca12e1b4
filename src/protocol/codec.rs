//! Protocol codec for framing messages
//!
//! Handles the fixed message header and splits the byte stream into frames.
//! Payload layouts are command specific and handled by the handlers.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;

use super::{Command, FLAG_FROM_SERVER, MAGIC, PROTOCOL_REVISION};

/// Default maximum payload size (16 MB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Header size: magic(1) + version(1) + flags(1) + command(1) + length(4) = 8 bytes
pub const HEADER_SIZE: usize = 8;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid magic byte: {0:#04x}")]
    InvalidMagic(u8),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Buffer underflow: need {needed} bytes, have {remaining}")]
    Underflow { needed: usize, remaining: usize },

    #[error("Unknown command code: {0:#04x}")]
    UnknownCommand(u8),

    #[error("Unknown type code: {0:#04x}")]
    UnknownTypeCode(u8),

    #[error("Unknown type id: {0}")]
    UnknownTypeId(u16),

    #[error("Invalid UTF-8 string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Value does not match its type: {0}")]
    TypeMismatch(String),

    #[error("Invalid data: {0}")]
    Invalid(String),
}

/// A complete message as read from the wire
#[derive(Debug, Clone)]
pub struct Frame {
    /// Protocol revision of the sender
    pub version: u8,
    /// Header flags
    pub flags: u8,
    /// Raw command code
    pub command: u8,
    /// Message payload
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: Command, flags: u8, payload: Bytes) -> Self {
        Self {
            version: PROTOCOL_REVISION,
            flags,
            command: command.code(),
            payload,
        }
    }

    /// Decoded command, if known
    pub fn command(&self) -> Result<Command, CodecError> {
        Command::try_from(self.command)
    }

    /// Whether the sender marked itself as a server
    pub fn is_from_server(&self) -> bool {
        self.flags & FLAG_FROM_SERVER != 0
    }
}

/// Encodes messages into the wire format
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    flags: u8,
    max_payload_size: usize,
}

impl Encoder {
    /// Encoder for a client-side connection
    pub fn client() -> Self {
        Self {
            flags: 0,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Encoder for a server-side connection
    pub fn server() -> Self {
        Self {
            flags: FLAG_FROM_SERVER,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Refuse to produce payloads larger than `max_payload_size`
    pub fn with_max_payload(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Encode a complete message into a buffer
    pub fn encode(
        &self,
        command: Command,
        payload: &[u8],
        buf: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let start = self.begin_message(command, buf);
        buf.put_slice(payload);
        self.end_message(start, buf)
    }

    /// Write a header with a placeholder length and return its position.
    ///
    /// The payload is appended by the caller; [`Encoder::end_message`] patches the length.
    pub fn begin_message(&self, command: Command, buf: &mut BytesMut) -> usize {
        let start = buf.len();
        buf.put_u8(MAGIC);
        buf.put_u8(PROTOCOL_REVISION);
        buf.put_u8(self.flags);
        buf.put_u8(command.code());
        buf.put_u32(0);
        start
    }

    /// Patch the payload length of the message started at `start`
    pub fn end_message(&self, start: usize, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload_len = buf.len() - start - HEADER_SIZE;
        if payload_len > self.max_payload_size {
            buf.truncate(start);
            return Err(CodecError::MessageTooLarge(
                payload_len,
                self.max_payload_size,
            ));
        }
        buf[start + 4..start + HEADER_SIZE].copy_from_slice(&(payload_len as u32).to_be_bytes());
        Ok(())
    }
}

/// Decodes frames from the wire format
pub struct Decoder {
    state: DecodeState,
    max_payload_size: usize,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Payload {
        version: u8,
        flags: u8,
        command: u8,
        length: usize,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(max_payload_size: usize) -> Self {
        Self {
            state: DecodeState::Header,
            max_payload_size,
        }
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    if buf[0] != MAGIC {
                        return Err(CodecError::InvalidMagic(buf[0]));
                    }

                    let version = buf[1];
                    let flags = buf[2];
                    let command = buf[3];
                    let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;

                    if length > self.max_payload_size {
                        return Err(CodecError::MessageTooLarge(length, self.max_payload_size));
                    }

                    buf.advance(HEADER_SIZE);

                    self.state = DecodeState::Payload {
                        version,
                        flags,
                        command,
                        length,
                    };
                }
                DecodeState::Payload {
                    version,
                    flags,
                    command,
                    length,
                } => {
                    if buf.len() < *length {
                        return Ok(None);
                    }

                    let frame = Frame {
                        version: *version,
                        flags: *flags,
                        command: *command,
                        payload: buf.split_to(*length).freeze(),
                    };

                    self.state = DecodeState::Header;

                    return Ok(Some(frame));
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
