//! Ordered, id-keyed mirror of a server-side record set.
//!
//! Initial order is whatever the snapshot query returned; later inserts
//! append. Ids are unique at all times.

use std::cmp::Ordering;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::SyncError;
use crate::mutation::Optimistic;
use crate::protocol::{record_id, Record};

/// An element a [`LocalCollection`] can hold.
pub trait CollectionItem: Clone + PartialEq + Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Shallow-merge `patch` over `self`.
    fn merge(&mut self, patch: &Self);

    fn from_record(record: &Record) -> Result<Self, SyncError>;
}

impl CollectionItem for Record {
    fn id(&self) -> &str {
        record_id(self).unwrap_or_default()
    }

    fn merge(&mut self, patch: &Self) {
        for (key, value) in patch {
            self.insert(key.clone(), value.clone());
        }
    }

    fn from_record(record: &Record) -> Result<Self, SyncError> {
        match record_id(record) {
            Some(id) if !id.is_empty() => Ok(record.clone()),
            _ => Err(SyncError::InvalidRecord("record has no id".into())),
        }
    }
}

/// Collection shared between the dispatcher, the mutation controller and
/// readers.
pub type SharedCollection<T> = Arc<RwLock<LocalCollection<T>>>;

#[derive(Debug, Clone, PartialEq)]
pub struct LocalCollection<T> {
    items: Vec<T>,
}

impl<T> Default for LocalCollection<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: CollectionItem> LocalCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a snapshot in server order. A repeated id is merged into
    /// its first occurrence.
    pub fn from_snapshot(items: impl IntoIterator<Item = T>) -> Self {
        let mut collection = Self::new();
        for item in items {
            match collection.position(item.id()) {
                Some(idx) => collection.items[idx].merge(&item),
                None => collection.items.push(item),
            }
        }
        collection
    }

    pub fn shared(self) -> SharedCollection<T> {
        Arc::new(RwLock::new(self))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(CollectionItem::id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.iter().find(|item| item.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// Replace the item with the same id in place, or append it.
    /// Returns `true` when the item was new.
    pub fn upsert(&mut self, item: T) -> bool {
        match self.position(item.id()) {
            Some(idx) => {
                self.items[idx] = item;
                false
            }
            None => {
                self.items.push(item);
                true
            }
        }
    }

    /// Shallow-merge `patch` into the item with the same id, or append it.
    /// Returns `true` when the item was new.
    pub fn merge(&mut self, patch: T) -> bool {
        match self.position(patch.id()) {
            Some(idx) => {
                self.items[idx].merge(&patch);
                false
            }
            None => {
                self.items.push(patch);
                true
            }
        }
    }

    /// Remove by id, returning where the item was.
    pub fn remove(&mut self, id: &str) -> Option<(usize, T)> {
        let idx = self.position(id)?;
        Some((idx, self.items.remove(idx)))
    }

    /// Insert at `idx` (clamped to the end). An existing item with the same
    /// id is removed first.
    pub fn insert_at(&mut self, idx: usize, item: T) {
        self.remove(item.id());
        let idx = idx.min(self.items.len());
        self.items.insert(idx, item);
    }

    /// Explicit re-sort; otherwise order is snapshot order plus appends.
    pub fn sort_by<F>(&mut self, compare: F)
    where
        F: FnMut(&T, &T) -> Ordering,
    {
        self.items.sort_by(compare);
    }

    /// Remove every item matching `remove`, returning them in order.
    pub fn drain_where<F>(&mut self, mut remove: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if remove(&item) {
                removed.push(item);
            } else {
                kept.push(item);
            }
        }
        self.items = kept;
        removed
    }
}

/// Optimistic edit of one collection entry.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionPatch<T> {
    /// Add the item, replacing any entry with the same id.
    Insert(T),
    /// Shallow-merge fields into the existing entry.
    Merge(T),
    Remove,
}

impl<T: CollectionItem> Optimistic for LocalCollection<T> {
    type Patch = CollectionPatch<T>;
    /// Entry as it was, with its position.
    type Snapshot = Option<(usize, T)>;

    fn apply_patch(&mut self, key: &str, patch: CollectionPatch<T>) -> Self::Snapshot {
        let snapshot = self
            .position(key)
            .map(|idx| (idx, self.items[idx].clone()));
        match patch {
            CollectionPatch::Insert(item) => {
                self.upsert(item);
            }
            CollectionPatch::Merge(fields) => {
                if let Some(idx) = self.position(key) {
                    self.items[idx].merge(&fields);
                }
            }
            CollectionPatch::Remove => {
                self.remove(key);
            }
        }
        snapshot
    }

    fn restore(&mut self, key: &str, snapshot: Self::Snapshot) {
        self.remove(key);
        if let Some((idx, item)) = snapshot {
            self.insert_at(idx, item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn post(id: &str, body: &str) -> Record {
        match json!({"id": id, "body": body}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn ids(collection: &LocalCollection<Record>) -> Vec<&str> {
        collection.ids().collect()
    }

    #[test]
    fn test_snapshot_deduplicates_ids() {
        let collection =
            LocalCollection::from_snapshot(vec![post("a", "1"), post("b", "2"), post("a", "3")]);
        assert_eq!(ids(&collection), vec!["a", "b"]);
        assert_eq!(collection.get("a").unwrap()["body"], json!("3"));
    }

    #[test]
    fn test_merge_is_shallow() {
        let mut collection = LocalCollection::from_snapshot(vec![post("a", "old")]);
        let mut patch = Record::new();
        patch.insert("id".into(), json!("a"));
        patch.insert("edited".into(), json!(true));

        assert!(!collection.merge(patch));
        let item = collection.get("a").unwrap();
        assert_eq!(item["body"], json!("old"));
        assert_eq!(item["edited"], json!(true));
    }

    #[test]
    fn test_insert_at_keeps_ids_unique() {
        let mut collection = LocalCollection::from_snapshot(vec![post("a", "1"), post("b", "2")]);
        collection.insert_at(0, post("b", "moved"));
        assert_eq!(ids(&collection), vec!["b", "a"]);
        collection.insert_at(99, post("c", "3"));
        assert_eq!(ids(&collection), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_record_without_id_is_invalid() {
        let mut record = Record::new();
        record.insert("body".into(), json!("x"));
        assert!(matches!(
            Record::from_record(&record),
            Err(SyncError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_patch_then_restore_is_identity() {
        let original =
            LocalCollection::from_snapshot(vec![post("a", "1"), post("b", "2"), post("c", "3")]);

        let patches = vec![
            ("b", CollectionPatch::Remove),
            ("b", CollectionPatch::Merge(post("b", "edited"))),
            ("b", CollectionPatch::Insert(post("b", "replaced"))),
            ("z", CollectionPatch::Insert(post("z", "new"))),
            ("missing", CollectionPatch::Remove),
        ];

        for (key, patch) in patches {
            let mut collection = original.clone();
            let snapshot = collection.apply_patch(key, patch);
            assert_ne!(key == "missing", collection != original);
            collection.restore(key, snapshot);
            assert_eq!(collection, original, "restore after patching {key}");
        }
    }

    #[test]
    fn test_drain_where() {
        let mut collection =
            LocalCollection::from_snapshot(vec![post("a", "1"), post("b", "2"), post("c", "3")]);
        let removed = collection.drain_where(|item| item.id() != "b");
        assert_eq!(removed.len(), 2);
        assert_eq!(ids(&collection), vec!["b"]);
    }
}
