//! In-memory record provider
//!
//! Each record is a named [`PvStructure`]. A put-get operation sees the
//! top-level fields its request selects (`putField`, `getField`, or `field`
//! for both sides), and the whole record when the request names none.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use super::{Channel, ChannelProvider, ChannelPutGet, Completion, FieldData, PutGetConnection};
use crate::protocol::Status;
use crate::pvdata::{BitSet, PvCopy, PvStructure, ScalarValue, Structure};

/// Request section selecting the fields a put writes
pub const PUT_SECTION: &str = "putField";
/// Request section selecting the fields a get returns
pub const GET_SECTION: &str = "getField";

/// A named value held in memory
#[derive(Debug)]
pub struct Record {
    name: String,
    structure: Arc<Structure>,
    value: Mutex<PvStructure>,
}

impl Record {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn structure(&self) -> &Arc<Structure> {
        &self.structure
    }

    pub async fn snapshot(&self) -> PvStructure {
        self.value.lock().await.clone()
    }

    /// Apply the changed fields of `update` and stamp the record
    pub async fn apply(&self, update: &PvStructure, changed: &BitSet) -> Result<(), Status> {
        let mut current = self.value.lock().await;
        current
            .copy_masked_from(update, changed)
            .map_err(|e| Status::error(e.to_string()))?;
        stamp(&mut current);
        Ok(())
    }
}

/// Update `timeStamp` fields when the record has them
fn stamp(value: &mut PvStructure) {
    let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return;
    };
    let _ = value.set(
        "timeStamp.secondsPastEpoch",
        ScalarValue::Long(now.as_secs() as i64),
    );
    let _ = value.set(
        "timeStamp.nanoseconds",
        ScalarValue::Int(now.subsec_nanos() as i32),
    );
}

/// Provider serving a fixed set of records
#[derive(Debug, Default)]
pub struct MemoryProvider {
    records: RwLock<HashMap<String, Arc<Record>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a record
    pub fn add_record(&self, name: impl Into<String>, value: PvStructure) -> Arc<Record> {
        let name = name.into();
        let record = Arc::new(Record {
            name: name.clone(),
            structure: value.structure().clone(),
            value: Mutex::new(value),
        });
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, record.clone());
        record
    }

    pub fn record(&self, name: &str) -> Option<Arc<Record>> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl ChannelProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_channel(&self, name: &str) -> Result<Arc<dyn Channel>, Status> {
        match self.record(name) {
            Some(record) => Ok(Arc::new(MemoryChannel { record })),
            None => Err(Status::error(format!("channel '{}' not found", name))),
        }
    }

    fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

pub struct MemoryChannel {
    record: Arc<Record>,
}

impl Channel for MemoryChannel {
    fn name(&self) -> &str {
        self.record.name()
    }

    fn create_put_get(&self, request: &PvStructure) -> Result<Box<dyn ChannelPutGet>, Status> {
        let structure = self.record.structure();
        let select = |section| {
            PvCopy::from_request(structure, request, section)
                .map_err(|e| Status::error(format!("invalid request: {}", e)))
        };
        Ok(Box::new(MemoryPutGet {
            record: self.record.clone(),
            put_copy: select(PUT_SECTION)?,
            get_copy: select(GET_SECTION)?,
            destroyed: false,
        }))
    }
}

pub struct MemoryPutGet {
    record: Arc<Record>,
    put_copy: PvCopy,
    get_copy: PvCopy,
    destroyed: bool,
}

impl MemoryPutGet {
    fn check(&self) -> Result<(), Status> {
        if self.destroyed {
            return Err(Status::error("operation destroyed"));
        }
        Ok(())
    }

    async fn read(&self, copy: &PvCopy) -> Completion {
        match self.check() {
            Ok(()) => Completion::ok(FieldData::full(copy.view_of(&self.record.snapshot().await))),
            Err(status) => Completion::failed(status),
        }
    }
}

#[async_trait]
impl ChannelPutGet for MemoryPutGet {
    async fn connect(&mut self) -> PutGetConnection {
        if let Err(status) = self.check() {
            return PutGetConnection::failed(status);
        }
        PutGetConnection::ok(
            self.put_copy.structure().clone(),
            self.get_copy.structure().clone(),
        )
    }

    async fn get(&mut self) -> Completion {
        self.read(&self.get_copy).await
    }

    async fn get_put(&mut self) -> Completion {
        self.read(&self.put_copy).await
    }

    async fn put(&mut self, value: &PvStructure, changed: &BitSet) -> Completion {
        if let Err(status) = self.check() {
            return Completion::failed(status);
        }
        let (update, mask) = match self.put_copy.expand(value, changed) {
            Ok(expanded) => expanded,
            Err(e) => return Completion::failed(Status::error(e.to_string())),
        };
        match self.record.apply(&update, &mask).await {
            Ok(()) => Completion::done(),
            Err(status) => Completion::failed(status),
        }
    }

    async fn put_get(&mut self, value: &PvStructure, changed: &BitSet) -> Completion {
        let put = self.put(value, changed).await;
        if !put.status.is_success() {
            return put;
        }
        self.read(&self.get_copy).await
    }

    fn destroy(&mut self) {
        self.destroyed = true;
    }
}
