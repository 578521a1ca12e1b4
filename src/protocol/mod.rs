//! Protocol module - Defines the wire protocol for pvAccess communication
//!
//! Every message is framed by a fixed 8-byte header:
//! - 1 byte magic (`0xCA`)
//! - 1 byte protocol revision
//! - 1 byte flags
//! - 1 byte command code
//! - 4 bytes payload length (big-endian)
//!
//! followed by the command-specific payload.

mod codec;
mod command;
mod qos;
mod serialize;
mod status;
mod validation;

pub use codec::*;
pub use command::*;
pub use qos::*;
pub use serialize::*;
pub use status::*;
pub use validation::*;

/// Protocol revision spoken by this implementation
pub const PROTOCOL_REVISION: u8 = 1;

/// Default TCP port for pvAccess servers
pub const DEFAULT_PORT: u16 = 5075;

/// Magic byte opening every message header
pub const MAGIC: u8 = 0xCA;

/// Header flag set on messages sent by a server
pub const FLAG_FROM_SERVER: u8 = 0x40;
