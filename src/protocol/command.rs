//! Protocol command codes
//!
//! Unknown codes decode to `CodecError::UnknownCommand`.

use std::fmt;

use super::CodecError;

/// All command codes understood by this stack.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Connection validation (handshake, both directions)
    ConnectionValidation = 0x01,
    /// Echo request / response, used as a liveness probe
    Echo = 0x02,
    /// Create a channel by name
    CreateChannel = 0x07,
    /// Destroy a channel and all operations on it
    DestroyChannel = 0x08,
    /// Final handshake status from the server
    ConnectionValidated = 0x09,
    /// Put-get operation (all phases)
    PutGet = 0x0C,
    /// Destroy one operation by ioid
    DestroyRequest = 0x0F,
}

impl Command {
    /// Raw command code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Commands that are answered with a response message
    pub fn expects_response(&self) -> bool {
        !matches!(self, Command::DestroyRequest | Command::DestroyChannel)
    }
}

impl TryFrom<u8> for Command {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::ConnectionValidation),
            0x02 => Ok(Command::Echo),
            0x07 => Ok(Command::CreateChannel),
            0x08 => Ok(Command::DestroyChannel),
            0x09 => Ok(Command::ConnectionValidated),
            0x0C => Ok(Command::PutGet),
            0x0F => Ok(Command::DestroyRequest),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
