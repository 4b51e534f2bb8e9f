//! In-memory table store.
//!
//! Committed writes are published on a [`MemoryProvider`] as row changes,
//! the way a database change feed would. Owner checks follow the usual
//! row-level rule: a row carrying `author_id` or `user_id` may only be
//! changed by that user.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{Backend, SnapshotQuery, WriteOp, WriteRequest};
use crate::collection::CollectionItem;
use crate::error::BackendError;
use crate::protocol::{record_id, record_str, RawChange, Record};
use crate::provider::MemoryProvider;

const OWNER_FIELDS: [&str; 2] = ["author_id", "user_id"];

#[derive(Default)]
struct BackendState {
    tables: HashMap<String, Vec<Record>>,
    commit_failures: VecDeque<BackendError>,
    fetch_failures: VecDeque<BackendError>,
    latency: Duration,
    fetch_calls: usize,
    commits: usize,
}

/// Shared in-memory backend. Clones share state.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
    feed: Option<MemoryProvider>,
}

impl MemoryBackend {
    /// Backend whose writes are published on `feed`.
    pub fn new(feed: MemoryProvider) -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState::default())),
            feed: Some(feed),
        }
    }

    /// Backend without a change feed.
    pub fn detached() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState::default())),
            feed: None,
        }
    }

    /// Load rows without publishing anything.
    pub async fn seed(&self, table: &str, rows: impl IntoIterator<Item = Record>) {
        let mut state = self.state.lock().await;
        state.tables.entry(table.to_string()).or_default().extend(rows);
    }

    /// Make the next commit fail with `error`.
    pub async fn fail_next(&self, error: BackendError) {
        self.state.lock().await.commit_failures.push_back(error);
    }

    /// Make the next fetch fail with `error`.
    pub async fn fail_next_fetch(&self, error: BackendError) {
        self.state.lock().await.fetch_failures.push_back(error);
    }

    /// Delay every fetch and commit by `latency`.
    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = latency;
    }

    pub async fn rows(&self, table: &str) -> Vec<Record> {
        let state = self.state.lock().await;
        state.tables.get(table).cloned().unwrap_or_default()
    }

    pub async fn fetch_calls(&self) -> usize {
        self.state.lock().await.fetch_calls
    }

    pub async fn commits(&self) -> usize {
        self.state.lock().await.commits
    }

    async fn latency(&self) {
        let latency = self.state.lock().await.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

fn check_owner(row: &Record, actor: &str) -> Result<(), BackendError> {
    for field in OWNER_FIELDS {
        if let Some(owner) = record_str(row, field) {
            if owner != actor {
                return Err(BackendError::Unauthorized(format!(
                    "{actor} does not own {}",
                    record_id(row).unwrap_or("row")
                )));
            }
        }
    }
    Ok(())
}

/// Numbers compare numerically, everything else by its text.
fn compare_field(a: &Record, b: &Record, field: &str) -> Ordering {
    fn text(value: Option<&Value>) -> String {
        match value {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
    match (a.get(field), b.get(field)) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (x, y) => text(x).cmp(&text(y)),
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn fetch(&self, query: &SnapshotQuery) -> Result<Vec<Record>, BackendError> {
        self.latency().await;
        let mut state = self.state.lock().await;
        state.fetch_calls += 1;
        if let Some(error) = state.fetch_failures.pop_front() {
            return Err(error);
        }

        let mut rows: Vec<Record> = state
            .tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| query.filter.as_ref().map_or(true, |f| f.matches(r)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some(field) = &query.order_by {
            rows.sort_by(|a, b| compare_field(a, b, field));
        }
        Ok(rows)
    }

    async fn commit(&self, request: &WriteRequest) -> Result<Option<Record>, BackendError> {
        self.latency().await;
        // Held until the change is published so feed order matches commit
        // order.
        let mut state = self.state.lock().await;
        if let Some(error) = state.commit_failures.pop_front() {
            log::debug!(
                "memory backend: failing write to {}/{} as scripted",
                request.table,
                request.entity_id().unwrap_or("?")
            );
            return Err(error);
        }

        let rows = state.tables.entry(request.table.clone()).or_default();
        let (stored, change) = match &request.op {
            WriteOp::Insert(record) => {
                let id = record_id(record)
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| BackendError::Rejected("row has no id".into()))?;
                if rows.iter().any(|r| r.id() == id) {
                    return Err(BackendError::Rejected(format!("duplicate id {id}")));
                }
                check_owner(record, &request.actor)?;
                rows.push(record.clone());
                (Some(record.clone()), RawChange::insert(record.clone()))
            }
            WriteOp::Update { id, patch } => {
                let row = rows
                    .iter_mut()
                    .find(|r| r.id() == id.as_str())
                    .ok_or_else(|| BackendError::Rejected(format!("no row {id}")))?;
                check_owner(row, &request.actor)?;
                row.merge(patch);
                (Some(row.clone()), RawChange::update(row.clone()))
            }
            WriteOp::Delete { id } => {
                let idx = rows
                    .iter()
                    .position(|r| r.id() == id.as_str())
                    .ok_or_else(|| BackendError::Rejected(format!("no row {id}")))?;
                check_owner(&rows[idx], &request.actor)?;
                let old = rows.remove(idx);
                (None, RawChange::delete(old))
            }
        };
        state.commits += 1;

        if let Some(feed) = &self.feed {
            let delivered = feed.publish(&request.table, change).await;
            log::trace!("memory backend: {} change delivered to {delivered} topics", request.table);
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EventFilter, ProviderFrame};
    use crate::provider::RealtimeProvider;
    use futures_util::StreamExt;
    use serde_json::json;

    fn row(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn test_fetch_filters_and_orders() {
        let backend = MemoryBackend::detached();
        backend
            .seed(
                "posts",
                vec![
                    row(json!({"id": "b", "thread_id": "t1", "created_at": "2"})),
                    row(json!({"id": "x", "thread_id": "t2", "created_at": "0"})),
                    row(json!({"id": "a", "thread_id": "t1", "created_at": "1"})),
                ],
            )
            .await;

        let query = SnapshotQuery::new("posts", Some(EventFilter::eq("thread_id", "t1"))).order_by("created_at");
        let rows = backend.fetch(&query).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_only_owner_may_update_or_delete() {
        let backend = MemoryBackend::detached();
        backend
            .seed("posts", vec![row(json!({"id": "p1", "author_id": "alice", "body": "hi"}))])
            .await;

        let mut patch = Record::new();
        patch.insert("body".into(), json!("hacked"));
        let update = WriteRequest::new("posts", "mallory", WriteOp::Update { id: "p1".into(), patch });
        assert!(matches!(backend.commit(&update).await, Err(BackendError::Unauthorized(_))));

        let delete = WriteRequest::new("posts", "alice", WriteOp::Delete { id: "p1".into() });
        assert_eq!(backend.commit(&delete).await, Ok(None));
        assert!(backend.rows("posts").await.is_empty());
    }

    #[tokio::test]
    async fn test_commit_publishes_change() {
        let feed = MemoryProvider::new();
        let backend = MemoryBackend::new(feed.clone());
        let filter = EventFilter::eq("thread_id", "t1");
        let mut frames = feed.subscribe("posts:thread_id=eq.t1", Some(&filter)).await.unwrap();
        let _ = frames.next().await;

        let insert = WriteRequest::new(
            "posts",
            "alice",
            WriteOp::Insert(row(json!({"id": "p1", "thread_id": "t1", "author_id": "alice"}))),
        );
        backend.commit(&insert).await.unwrap();

        match frames.next().await {
            Some(ProviderFrame::Change(change)) => assert_eq!(change.entity_id, "p1"),
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(backend.commits().await, 1);
    }

    #[tokio::test]
    async fn test_scripted_failure_leaves_store_untouched() {
        let backend = MemoryBackend::detached();
        backend.fail_next(BackendError::Timeout).await;
        let insert = WriteRequest::new("posts", "alice", WriteOp::Insert(row(json!({"id": "p1"}))));

        assert_eq!(backend.commit(&insert).await, Err(BackendError::Timeout));
        assert!(backend.rows("posts").await.is_empty());
        assert!(backend.commit(&insert).await.is_ok());
        assert!(matches!(
            backend.commit(&insert).await,
            Err(BackendError::Rejected(_))
        ));
    }

    #[test]
    fn test_write_request_names_its_row() {
        let insert = WriteRequest::new("posts", "alice", WriteOp::Insert(row(json!({"id": "p1"}))));
        let update = WriteRequest::new(
            "posts",
            "alice",
            WriteOp::Update {
                id: "p2".into(),
                patch: Record::new(),
            },
        );
        let anonymous = WriteRequest::new("posts", "alice", WriteOp::Insert(Record::new()));

        assert_eq!(insert.entity_id(), Some("p1"));
        assert_eq!(update.entity_id(), Some("p2"));
        assert_eq!(anonymous.entity_id(), None);
    }
}
