//! Operation completion status
//!
//! Carried by every response. A plain OK status is a single `0xFF` byte;
//! anything else carries its type, a message and an optional nested cause.

use bytes::{Buf, BufMut};
use std::fmt;

use super::{get_u8, read_string, write_string, CodecError};

const OK_SHORTCUT: u8 = 0xFF;

/// Severity of a status
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusType {
    Ok = 0,
    Warning = 1,
    Error = 2,
    Fatal = 3,
}

impl TryFrom<u8> for StatusType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(StatusType::Ok),
            1 => Ok(StatusType::Warning),
            2 => Ok(StatusType::Error),
            3 => Ok(StatusType::Fatal),
            other => Err(CodecError::Invalid(format!("status type {other}"))),
        }
    }
}

/// Result of one protocol operation or phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub kind: StatusType,
    pub message: String,
    pub cause: Option<Box<Status>>,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            kind: StatusType::Ok,
            message: String::new(),
            cause: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(StatusType::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(StatusType::Error, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(StatusType::Fatal, message)
    }

    pub fn new(kind: StatusType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: Status) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Unknown channel id
    pub fn bad_cid() -> Self {
        Self::fatal("bad channel id")
    }

    /// Unknown request id
    pub fn bad_ioid() -> Self {
        Self::fatal("bad request id")
    }

    /// A phase arrived while the previous one is still in flight
    pub fn other_request_pending() -> Self {
        Self::fatal("other request pending")
    }

    /// INIT for an ioid that is already registered
    pub fn ioid_in_use() -> Self {
        Self::fatal("request id already in use")
    }

    /// OK and WARNING count as success
    pub fn is_success(&self) -> bool {
        matches!(self.kind, StatusType::Ok | StatusType::Warning)
    }

    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        if self.kind == StatusType::Ok && self.message.is_empty() && self.cause.is_none() {
            buf.put_u8(OK_SHORTCUT);
            return;
        }
        buf.put_u8(self.kind as u8);
        write_string(buf, &self.message);
        match &self.cause {
            Some(cause) => {
                buf.put_u8(1);
                cause.serialize(buf);
            }
            None => buf.put_u8(0),
        }
    }

    pub fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let kind = get_u8(buf)?;
        if kind == OK_SHORTCUT {
            return Ok(Self::ok());
        }
        let kind = StatusType::try_from(kind)?;
        let message = read_string(buf)?;
        let cause = match get_u8(buf)? {
            0 => None,
            _ => Some(Box::new(Status::deserialize(buf)?)),
        };
        Ok(Self {
            kind,
            message,
            cause,
        })
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {})", cause)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_ok_is_one_byte() {
        let mut buf = BytesMut::new();
        Status::ok().serialize(&mut buf);
        assert_eq!(&buf[..], &[0xFF]);
        assert_eq!(Status::deserialize(&mut buf.freeze()).unwrap(), Status::ok());
    }

    #[test]
    fn test_nested_cause() {
        let status = Status::fatal("connect failed")
            .with_cause(Status::error("record locked"));
        let mut buf = BytesMut::new();
        status.serialize(&mut buf);

        let decoded = Status::deserialize(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, status);
        assert!(!decoded.is_success());
        assert_eq!(
            decoded.to_string(),
            "Fatal: connect failed (caused by Error: record locked)"
        );
    }

    #[test]
    fn test_warning_is_success() {
        assert!(Status::warning("clamped").is_success());
        assert!(!Status::bad_ioid().is_success());
    }
}
