use bytes::{BufMut, Bytes};
use std::sync::Arc;

use super::{CommandHandler, HandlerError, HandlerResult};
use crate::network::{SendControl, ServerConnection};
use crate::protocol::{CodecError, Command};

/// Answers an echo request with the same payload
pub struct EchoHandler;

impl CommandHandler for EchoHandler {
    fn handle(&self, connection: &Arc<ServerConnection>, payload: Bytes) -> HandlerResult<()> {
        connection
            .transport()
            .enqueue_send_nowait(move |control: &mut SendControl<'_>| -> Result<(), CodecError> {
                control.start_message(Command::Echo)?;
                control.buffer().put_slice(&payload);
                control.flush();
                Ok(())
            })
            .map_err(|_| HandlerError::Closed)
    }
}
