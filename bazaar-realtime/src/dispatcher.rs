//! Applies change events to a local collection.
//!
//! Events are merged one at a time in delivery order. Correctness under
//! reconnect replays comes from idempotent merging, not from sequence
//! numbers: an Insert for a present id is treated as an update, an Update
//! for a missing id as an insert, a Delete for a missing id as a no-op.
//!
//! Observers read [`CollectionChange`]s from a queue that is filled after
//! the collection has been mutated.

use std::collections::HashSet;

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::collection::{CollectionItem, LocalCollection, SharedCollection};
use crate::error::SyncError;
use crate::protocol::{ChangeEvent, ChangeKind, EventFilter, Record};

/// What a dispatcher is currently listening to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub topic: String,
    pub filter: Option<EventFilter>,
}

impl Binding {
    pub fn new(topic: impl Into<String>, filter: Option<EventFilter>) -> Self {
        Self {
            topic: topic.into(),
            filter,
        }
    }

    /// Whether `event` belongs to this binding. A shared physical channel
    /// can carry rows for other filters, so both topic and filter are
    /// checked.
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        if event.topic != self.topic {
            return false;
        }
        match &self.filter {
            None => true,
            Some(filter) => {
                event.new_record.as_ref().is_some_and(|r| filter.matches(r))
                    || event.old_record.as_ref().is_some_and(|r| filter.matches(r))
            }
        }
    }
}

/// Notification emitted after the collection changed.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionChange<T> {
    Added(T),
    Updated(T),
    Deleted(String),
}

/// Merge one event into `collection`.
///
/// Returns the resulting change, or `None` when the event was a no-op.
pub fn merge_event<T: CollectionItem>(
    collection: &mut LocalCollection<T>,
    event: &ChangeEvent,
) -> Result<Option<CollectionChange<T>>, SyncError> {
    match event.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let record = event.new_record.as_ref().ok_or_else(|| {
                SyncError::InvalidRecord(format!("{:?} for {} has no record", event.kind, event.entity_id))
            })?;
            let item = T::from_record(record)?;
            let id = item.id().to_string();
            let added = collection.merge(item);
            let current = collection
                .get(&id)
                .cloned()
                .ok_or_else(|| SyncError::UnknownEntity(id.clone()))?;
            if added {
                Ok(Some(CollectionChange::Added(current)))
            } else {
                Ok(Some(CollectionChange::Updated(current)))
            }
        }
        ChangeKind::Delete => {
            let id = if event.entity_id.is_empty() {
                event
                    .old_record
                    .as_ref()
                    .and_then(crate::protocol::record_id)
                    .unwrap_or_default()
            } else {
                event.entity_id.as_str()
            };
            Ok(collection
                .remove(id)
                .map(|_| CollectionChange::Deleted(id.to_string())))
        }
    }
}

/// Feeds channel events for one binding into a shared collection.
pub struct ChangeDispatcher<T: CollectionItem> {
    name: String,
    collection: SharedCollection<T>,
    binding: RwLock<Binding>,
    changes_tx: mpsc::UnboundedSender<CollectionChange<T>>,
    changes_rx: Mutex<Option<mpsc::UnboundedReceiver<CollectionChange<T>>>>,
}

impl<T: CollectionItem> ChangeDispatcher<T> {
    pub fn new(name: impl Into<String>, collection: SharedCollection<T>, binding: Binding) -> Self {
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            collection,
            binding: RwLock::new(binding),
            changes_tx,
            changes_rx: Mutex::new(Some(changes_rx)),
        }
    }

    pub fn collection(&self) -> &SharedCollection<T> {
        &self.collection
    }

    pub async fn binding(&self) -> Binding {
        self.binding.read().await.clone()
    }

    /// Point the dispatcher at a different topic; events for the old one
    /// are dropped from now on.
    pub async fn rebind(&self, binding: Binding) {
        log::debug!("{}: rebinding to {}", self.name, binding.topic);
        *self.binding.write().await = binding;
    }

    /// Take the change queue (can only be called once).
    pub async fn take_changes(&self) -> Option<mpsc::UnboundedReceiver<CollectionChange<T>>> {
        self.changes_rx.lock().await.take()
    }

    /// Apply one event. Returns whether the collection changed.
    pub async fn on_event(&self, event: &ChangeEvent) -> bool {
        if !self.binding.read().await.accepts(event) {
            log::debug!(
                "{}: dropping {:?} for {} from foreign topic {}",
                self.name,
                event.kind,
                event.entity_id,
                event.topic
            );
            return false;
        }

        let change = {
            let mut collection = self.collection.write().await;
            merge_event(&mut collection, event)
        };
        match change {
            Ok(Some(change)) => {
                log::trace!("{}: applied #{} {:?} {}", self.name, event.sequence, event.kind, event.entity_id);
                self.notify(change);
                true
            }
            Ok(None) => false,
            Err(e) => {
                log::warn!("{}: ignoring malformed event #{}: {e}", self.name, event.sequence);
                false
            }
        }
    }

    /// Bring the collection in line with a fresh snapshot.
    ///
    /// Every snapshot row replaces its local copy; local rows missing from
    /// the snapshot are deleted. Ids in `pending` are left alone since
    /// their optimistic state has not been confirmed yet.
    pub async fn reconcile(&self, records: &[Record], pending: &HashSet<String>) -> usize {
        let mut changes = Vec::new();
        {
            let mut collection = self.collection.write().await;
            let mut seen = HashSet::new();
            for record in records {
                let item = match T::from_record(record) {
                    Ok(item) => item,
                    Err(e) => {
                        log::warn!("{}: skipping snapshot row: {e}", self.name);
                        continue;
                    }
                };
                seen.insert(item.id().to_string());
                if pending.contains(item.id()) {
                    continue;
                }
                let unchanged = collection.get(item.id()).map(|existing| *existing == item);
                match unchanged {
                    Some(true) => {}
                    Some(false) => {
                        collection.upsert(item.clone());
                        changes.push(CollectionChange::Updated(item));
                    }
                    None => {
                        collection.upsert(item.clone());
                        changes.push(CollectionChange::Added(item));
                    }
                }
            }
            let stale = collection
                .drain_where(|item| !seen.contains(item.id()) && !pending.contains(item.id()));
            changes.extend(
                stale
                    .into_iter()
                    .map(|item| CollectionChange::Deleted(item.id().to_string())),
            );
        }

        let count = changes.len();
        if count > 0 {
            log::info!("{}: resync applied {count} changes", self.name);
        }
        for change in changes {
            self.notify(change);
        }
        count
    }

    fn notify(&self, change: CollectionChange<T>) {
        // Nobody listening is fine.
        let _ = self.changes_tx.send(change);
    }
}
