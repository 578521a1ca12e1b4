//! Channel lifecycle commands

use bytes::{BufMut, Bytes};
use std::sync::Arc;

use super::{CommandHandler, HandlerResult};
use crate::network::{SendControl, ServerConnection};
use crate::protocol::{get_u32, read_string, CodecError, Command, Status};

/// CREATE_CHANNEL: `cid u32, name string` answered with `cid u32, sid u32, status`
pub struct CreateChannelHandler;

impl CommandHandler for CreateChannelHandler {
    fn handle(&self, connection: &Arc<ServerConnection>, mut payload: Bytes) -> HandlerResult<()> {
        let cid = get_u32(&mut payload)?;
        let name = read_string(&mut payload)?;
        tracing::debug!("Create channel '{}' (cid {}) from {}", name, cid, connection.remote_addr());

        let connection = connection.clone();
        tokio::spawn(async move {
            let (sid, status) = match connection.provider().create_channel(&name).await {
                Ok(channel) => match connection.register_channel(cid, name.clone(), channel) {
                    Some(sid) => (sid, Status::ok()),
                    None => (0, Status::error("connection closed")),
                },
                Err(status) => {
                    tracing::info!("Channel '{}' not created: {}", name, status);
                    (0, status)
                }
            };
            let sent = connection.transport().enqueue_send_nowait(
                move |control: &mut SendControl<'_>| -> Result<(), CodecError> {
                    control.start_message(Command::CreateChannel)?;
                    let buf = control.buffer();
                    buf.put_u32(cid);
                    buf.put_u32(sid);
                    status.serialize(buf);
                    control.flush();
                    Ok(())
                },
            );
            if sent.is_err() && sid != 0 {
                connection.destroy_channel(sid);
            }
        });
        Ok(())
    }
}

/// DESTROY_CHANNEL: `sid u32, cid u32`; destroys every operation on the channel
pub struct DestroyChannelHandler;

impl CommandHandler for DestroyChannelHandler {
    fn handle(&self, connection: &Arc<ServerConnection>, mut payload: Bytes) -> HandlerResult<()> {
        let sid = get_u32(&mut payload)?;
        let cid = get_u32(&mut payload)?;
        if !connection.destroy_channel(sid) {
            tracing::debug!("Destroy of unknown channel sid={} cid={}", sid, cid);
        }
        Ok(())
    }
}

/// DESTROY_REQUEST: `sid u32, ioid u32`; destroys one operation, no response
pub struct DestroyRequestHandler;

impl CommandHandler for DestroyRequestHandler {
    fn handle(&self, connection: &Arc<ServerConnection>, mut payload: Bytes) -> HandlerResult<()> {
        let sid = get_u32(&mut payload)?;
        let ioid = get_u32(&mut payload)?;
        match connection.channel(sid).and_then(|c| c.request(ioid)) {
            Some(request) => request.destroy(),
            None => tracing::debug!("Destroy of unknown request sid={} ioid={}", sid, ioid),
        }
        Ok(())
    }
}
