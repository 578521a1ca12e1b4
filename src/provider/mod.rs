//! Operation backends
//!
//! The protocol engine does not know where values live. A server is given a
//! [`ChannelProvider`] that resolves channel names; each [`Channel`] builds
//! [`ChannelPutGet`] operations whose phases complete asynchronously.

mod memory;

pub use memory::*;

use async_trait::async_trait;
use std::sync::Arc;

use crate::protocol::Status;
use crate::pvdata::{BitSet, PvStructure, Structure};

/// A value handed back by a backend, with the fields it changed
#[derive(Debug, Clone, PartialEq)]
pub struct FieldData {
    pub value: PvStructure,
    pub changed: BitSet,
}

impl FieldData {
    /// Data where every field counts as changed
    pub fn full(value: PvStructure) -> Self {
        Self {
            value,
            changed: BitSet::from_iter([0]),
        }
    }
}

/// Outcome of one operation phase
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: Status,
    pub data: Option<FieldData>,
}

impl Completion {
    pub fn ok(data: FieldData) -> Self {
        Self {
            status: Status::ok(),
            data: Some(data),
        }
    }

    /// Success with nothing to return
    pub fn done() -> Self {
        Self {
            status: Status::ok(),
            data: None,
        }
    }

    pub fn failed(status: Status) -> Self {
        Self { status, data: None }
    }
}

/// Outcome of connecting a put-get operation: the shapes both sides agree on
#[derive(Debug, Clone, PartialEq)]
pub struct PutGetConnection {
    pub status: Status,
    pub put_structure: Option<Arc<Structure>>,
    pub get_structure: Option<Arc<Structure>>,
}

impl PutGetConnection {
    pub fn ok(put_structure: Arc<Structure>, get_structure: Arc<Structure>) -> Self {
        Self {
            status: Status::ok(),
            put_structure: Some(put_structure),
            get_structure: Some(get_structure),
        }
    }

    pub fn failed(status: Status) -> Self {
        Self {
            status,
            put_structure: None,
            get_structure: None,
        }
    }
}

/// Backend side of one put-get operation.
///
/// The engine runs at most one phase at a time and moves the operation into
/// the task running it, so implementations need `Send` but not `Sync`.
#[async_trait]
pub trait ChannelPutGet: Send {
    async fn connect(&mut self) -> PutGetConnection;

    /// Read the get side
    async fn get(&mut self) -> Completion;

    /// Read back the current put side
    async fn get_put(&mut self) -> Completion;

    /// Write the put side without reading anything back
    async fn put(&mut self, value: &PvStructure, changed: &BitSet) -> Completion;

    /// Write the put side, then read the get side
    async fn put_get(&mut self, value: &PvStructure, changed: &BitSet) -> Completion;

    /// The next phase is the last one for this operation
    fn last_request(&mut self) {}

    fn destroy(&mut self);
}

/// A named resource hosted by a provider
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Build a put-get operation for a request descriptor
    fn create_put_get(&self, request: &PvStructure) -> Result<Box<dyn ChannelPutGet>, Status>;

    fn destroy(&self) {}
}

/// Resolves channel names for a server
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn create_channel(&self, name: &str) -> Result<Arc<dyn Channel>, Status>;

    /// Names this provider can serve, if it can list them
    fn channel_names(&self) -> Vec<String> {
        Vec::new()
    }
}
