//! Request phase flags
//!
//! Every operation message carries one byte selecting the lifecycle step and
//! whether it is the last message of the operation. The byte is decoded once
//! into [`RequestFlags`] at the protocol boundary.

/// First message of an operation; creates it
pub const QOS_INIT: u8 = 0x08;
/// Last message of an operation; destroys it after the response
pub const QOS_DESTROY: u8 = 0x10;
/// Fetch the get side
pub const QOS_GET: u8 = 0x40;
/// Fetch the current put side
pub const QOS_GET_PUT: u8 = 0x80;

/// Lifecycle step requested by one operation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Init,
    Get,
    GetPut,
    /// Default when neither GET nor GET_PUT is set
    PutGet,
}

/// Decoded phase flag byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFlags {
    pub phase: Phase,
    /// The operation is destroyed once this phase completes
    pub last: bool,
}

impl RequestFlags {
    pub fn new(phase: Phase) -> Self {
        Self { phase, last: false }
    }

    pub fn last(phase: Phase) -> Self {
        Self { phase, last: true }
    }

    pub fn decode(bits: u8) -> Self {
        let phase = if bits & QOS_INIT != 0 {
            Phase::Init
        } else if bits & QOS_GET != 0 {
            Phase::Get
        } else if bits & QOS_GET_PUT != 0 {
            Phase::GetPut
        } else {
            Phase::PutGet
        };
        Self {
            phase,
            last: bits & QOS_DESTROY != 0,
        }
    }

    pub fn encode(&self) -> u8 {
        let phase_bits = match self.phase {
            Phase::Init => QOS_INIT,
            Phase::Get => QOS_GET,
            Phase::GetPut => QOS_GET_PUT,
            Phase::PutGet => 0,
        };
        if self.last {
            phase_bits | QOS_DESTROY
        } else {
            phase_bits
        }
    }
}
