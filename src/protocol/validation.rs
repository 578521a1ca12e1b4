//! Connection validation payloads exchanged during the handshake

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::{ensure, get_i16, get_u16, get_u32, CodecError};

/// Server → client: first message on a new connection.
///
/// Re-sent later on the same connection when the server wants the client to
/// drop cached state; a different `server_guid` means the peer restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerValidation {
    pub receive_buffer_size: u32,
    pub registry_max_size: u16,
    pub server_guid: Uuid,
}

impl ServerValidation {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(22);
        buf.put_u32(self.receive_buffer_size);
        buf.put_u16(self.registry_max_size);
        buf.put_slice(self.server_guid.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, CodecError> {
        let receive_buffer_size = get_u32(&mut payload)?;
        let registry_max_size = get_u16(&mut payload)?;
        ensure(&payload, 16)?;
        let mut guid = [0u8; 16];
        payload.copy_to_slice(&mut guid);
        Ok(Self {
            receive_buffer_size,
            registry_max_size,
            server_guid: Uuid::from_bytes(guid),
        })
    }
}

/// Client → server: answer to [`ServerValidation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientValidation {
    pub receive_buffer_size: u32,
    pub registry_max_size: u16,
    pub priority: i16,
}

impl ClientValidation {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32(self.receive_buffer_size);
        buf.put_u16(self.registry_max_size);
        buf.put_i16(self.priority);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            receive_buffer_size: get_u32(&mut payload)?,
            registry_max_size: get_u16(&mut payload)?,
            priority: get_i16(&mut payload)?,
        })
    }
}
