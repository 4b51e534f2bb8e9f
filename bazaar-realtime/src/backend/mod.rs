//! Query/write interface of the backing store.
//!
//! Writes go through [`Backend::commit`]; their effect reaches clients as
//! change events on the realtime provider, not through the return value.
//!
//! - [`memory`]: table store that publishes committed writes on a
//!   [`MemoryProvider`](crate::provider::MemoryProvider)

use async_trait::async_trait;

use crate::error::BackendError;
use crate::protocol::{EventFilter, Record};

pub mod memory;

pub use memory::MemoryBackend;

/// Snapshot request for one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotQuery {
    pub table: String,
    pub filter: Option<EventFilter>,
    /// Field to sort by, ascending. Store order when `None`.
    pub order_by: Option<String>,
}

impl SnapshotQuery {
    pub fn new(table: impl Into<String>, filter: Option<EventFilter>) -> Self {
        Self {
            table: table.into(),
            filter,
            order_by: None,
        }
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert(Record),
    Update { id: String, patch: Record },
    Delete { id: String },
}

/// A write on behalf of `actor`.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub table: String,
    pub actor: String,
    pub op: WriteOp,
}

impl WriteRequest {
    pub fn new(table: impl Into<String>, actor: impl Into<String>, op: WriteOp) -> Self {
        Self {
            table: table.into(),
            actor: actor.into(),
            op,
        }
    }

    /// Id of the row the write touches.
    pub fn entity_id(&self) -> Option<&str> {
        match &self.op {
            WriteOp::Insert(record) => crate::protocol::record_id(record),
            WriteOp::Update { id, .. } | WriteOp::Delete { id } => Some(id.as_str()),
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Fetch the current rows matching `query`.
    async fn fetch(&self, query: &SnapshotQuery) -> Result<Vec<Record>, BackendError>;

    /// Apply a write. Returns the row as stored, `None` for deletes.
    async fn commit(&self, request: &WriteRequest) -> Result<Option<Record>, BackendError>;
}
