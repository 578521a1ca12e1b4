//! Server-side request handling
//!
//! The [`Dispatcher`] maps each command code to a [`CommandHandler`].
//! Handlers run on the connection's reader task, so they decode in stream
//! order and hand anything slow to spawned tasks. A handler error only
//! concerns the one message; the connection stays open.

mod channel;
mod echo;
mod put_get;

pub use channel::*;
pub use echo::*;
pub use put_get::*;

use bytes::{BufMut, Bytes};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::network::{SendControl, ServerConnection, Transport};
use crate::protocol::{CodecError, Command, Frame, Status};

/// Handler errors
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Malformed payload: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection closed")]
    Closed,
}

pub type HandlerResult<T> = Result<T, HandlerError>;

/// Handles one command for a server connection
pub trait CommandHandler: Send + Sync {
    fn handle(&self, connection: &Arc<ServerConnection>, payload: Bytes) -> HandlerResult<()>;
}

/// Command code to handler table
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<Command, Box<dyn CommandHandler>>,
}

impl Dispatcher {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// The table every server connection uses
    pub fn server() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(Command::Echo, EchoHandler);
        dispatcher.register(Command::CreateChannel, CreateChannelHandler);
        dispatcher.register(Command::DestroyChannel, DestroyChannelHandler);
        dispatcher.register(Command::PutGet, PutGetHandler);
        dispatcher.register(Command::DestroyRequest, DestroyRequestHandler);
        dispatcher
    }

    pub fn register(&mut self, command: Command, handler: impl CommandHandler + 'static) {
        self.handlers.insert(command, Box::new(handler));
    }

    pub fn dispatch(&self, connection: &Arc<ServerConnection>, frame: Frame) {
        let command = match frame.command() {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(
                    "Ignoring message from {}: {}",
                    connection.remote_addr(),
                    e
                );
                return;
            }
        };
        let Some(handler) = self.handlers.get(&command) else {
            tracing::debug!(
                "No handler for {} from {}",
                command,
                connection.remote_addr()
            );
            return;
        };
        if let Err(e) = handler.handle(connection, frame.payload) {
            tracing::warn!(
                "{} from {} failed: {}",
                command,
                connection.remote_addr(),
                e
            );
        }
    }
}

/// Queue a response carrying only a request id, the phase byte and a status
pub(crate) fn send_status_response(
    transport: &Transport,
    command: Command,
    ioid: u32,
    qos: u8,
    status: Status,
) {
    tracing::debug!("{} {} rejected: {}", command, ioid, status);
    let result = transport.enqueue_send_nowait(
        move |control: &mut SendControl<'_>| -> Result<(), CodecError> {
            control.start_message(command)?;
            let buf = control.buffer();
            buf.put_u32(ioid);
            buf.put_u8(qos);
            status.serialize(buf);
            control.flush();
            Ok(())
        },
    );
    if result.is_err() {
        tracing::debug!("Response for {} dropped, connection closed", ioid);
    }
}
