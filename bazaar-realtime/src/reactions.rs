//! Per-post reaction counts folded from raw reaction rows.
//!
//! A reaction row is identified by `(post, user, kind)`. Counts are the
//! number of live row ids in a bucket rather than a running counter, which
//! keeps replayed inserts and unmatched deletes from skewing them.

use std::collections::{HashMap, HashSet};

use crate::error::SyncError;
use crate::mutation::Optimistic;
use crate::protocol::{record_str, ChangeEvent, ChangeKind, Record};

pub const POST_FIELD: &str = "post_id";
pub const USER_FIELD: &str = "user_id";
pub const KIND_FIELD: &str = "kind";

/// Row id of `user`'s `kind` reaction on `post`.
pub fn reaction_id(post_id: &str, user_id: &str, kind: &str) -> String {
    format!("{post_id}:{user_id}:{kind}")
}

/// One reaction row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionRow {
    pub post_id: String,
    pub user_id: String,
    pub kind: String,
}

impl ReactionRow {
    pub fn new(post_id: impl Into<String>, user_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            post_id: post_id.into(),
            user_id: user_id.into(),
            kind: kind.into(),
        }
    }

    pub fn id(&self) -> String {
        reaction_id(&self.post_id, &self.user_id, &self.kind)
    }

    pub fn from_record(record: &Record) -> Result<Self, SyncError> {
        let field = |name: &str| {
            record_str(record, name)
                .map(str::to_string)
                .ok_or_else(|| SyncError::InvalidRecord(format!("reaction row without {name}")))
        };
        Ok(Self {
            post_id: field(POST_FIELD)?,
            user_id: field(USER_FIELD)?,
            kind: field(KIND_FIELD)?,
        })
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("id".into(), self.id().into());
        record.insert(POST_FIELD.into(), self.post_id.clone().into());
        record.insert(USER_FIELD.into(), self.user_id.clone().into());
        record.insert(KIND_FIELD.into(), self.kind.clone().into());
        record
    }
}

/// Reaction summary for one `(post, kind)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionAggregate {
    pub post_id: String,
    pub kind: String,
    pub count: u32,
    pub viewer_reacted: bool,
}

#[derive(Debug, Clone, Default)]
struct Bucket {
    kind: String,
    ids: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct ReactionAggregator {
    viewer_id: String,
    rows: HashMap<String, ReactionRow>,
    /// post id -> buckets in first-seen kind order
    posts: HashMap<String, Vec<Bucket>>,
}

impl ReactionAggregator {
    pub fn new(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            rows: HashMap::new(),
            posts: HashMap::new(),
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    /// Count a row. Returns `false` if it was already counted.
    pub fn insert(&mut self, row: ReactionRow) -> bool {
        let id = row.id();
        if self.rows.contains_key(&id) {
            return false;
        }
        let buckets = self.posts.entry(row.post_id.clone()).or_default();
        match buckets.iter_mut().find(|b| b.kind == row.kind) {
            Some(bucket) => {
                bucket.ids.insert(id.clone());
            }
            None => buckets.push(Bucket {
                kind: row.kind.clone(),
                ids: HashSet::from([id.clone()]),
            }),
        }
        self.rows.insert(id, row);
        true
    }

    /// Uncount a row by id. Unknown ids are ignored.
    pub fn remove(&mut self, id: &str) -> Option<ReactionRow> {
        let Some(row) = self.rows.remove(id) else {
            log::debug!("reaction delete for unknown row {id} ignored");
            return None;
        };
        if let Some(buckets) = self.posts.get_mut(&row.post_id) {
            for bucket in buckets.iter_mut().filter(|b| b.kind == row.kind) {
                bucket.ids.remove(id);
            }
            buckets.retain(|b| !b.ids.is_empty());
            if buckets.is_empty() {
                self.posts.remove(&row.post_id);
            }
        }
        Some(row)
    }

    /// Fold one change event on the reactions table.
    pub fn apply(&mut self, event: &ChangeEvent) -> Result<bool, SyncError> {
        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let record = event
                    .new_record
                    .as_ref()
                    .ok_or_else(|| SyncError::InvalidRecord("reaction insert without row".into()))?;
                Ok(self.insert(ReactionRow::from_record(record)?))
            }
            ChangeKind::Delete => {
                // Prefer the row content; providers may only send the key.
                let id = match event.old_record.as_ref().map(ReactionRow::from_record) {
                    Some(Ok(row)) => row.id(),
                    _ => event.entity_id.clone(),
                };
                Ok(self.remove(&id).is_some())
            }
        }
    }

    /// Aggregates for `post_id`, only kinds with a positive count.
    pub fn aggregates(&self, post_id: &str) -> Vec<ReactionAggregate> {
        let Some(buckets) = self.posts.get(post_id) else {
            return Vec::new();
        };
        buckets
            .iter()
            .map(|bucket| ReactionAggregate {
                post_id: post_id.to_string(),
                kind: bucket.kind.clone(),
                count: u32::try_from(bucket.ids.len()).unwrap_or(u32::MAX),
                viewer_reacted: bucket
                    .ids
                    .contains(&reaction_id(post_id, &self.viewer_id, &bucket.kind)),
            })
            .collect()
    }

    pub fn count(&self, post_id: &str, kind: &str) -> u32 {
        self.aggregates(post_id)
            .into_iter()
            .find(|a| a.kind == kind)
            .map_or(0, |a| a.count)
    }

    pub fn viewer_reacted(&self, post_id: &str, kind: &str) -> bool {
        self.rows
            .contains_key(&reaction_id(post_id, &self.viewer_id, kind))
    }

    /// Replace the live rows with a fetched set, leaving ids in `pending`
    /// as they are locally.
    pub fn reconcile(&mut self, records: &[Record], pending: &HashSet<String>) -> usize {
        let mut fresh = HashMap::new();
        for record in records {
            match ReactionRow::from_record(record) {
                Ok(row) => {
                    fresh.insert(row.id(), row);
                }
                Err(e) => log::warn!("skipping reaction row: {e}"),
            }
        }

        let stale: Vec<String> = self
            .rows
            .keys()
            .filter(|id| !fresh.contains_key(*id) && !pending.contains(*id))
            .cloned()
            .collect();
        let mut changed = 0;
        for id in stale {
            self.remove(&id);
            changed += 1;
        }
        for (id, row) in fresh {
            if !pending.contains(&id) && self.insert(row) {
                changed += 1;
            }
        }
        changed
    }
}

/// Optimistic reaction edit by the viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionPatch {
    React { post_id: String, kind: String },
    Unreact { post_id: String, kind: String },
}

/// The viewer's row as it was before a patch.
#[derive(Debug, Clone)]
pub struct ReactionSnapshot {
    viewer_row: Option<ReactionRow>,
}

impl Optimistic for ReactionAggregator {
    type Patch = ReactionPatch;
    type Snapshot = ReactionSnapshot;

    /// `key` is the viewer's reaction row id.
    fn apply_patch(&mut self, key: &str, patch: ReactionPatch) -> ReactionSnapshot {
        let snapshot = ReactionSnapshot {
            viewer_row: self.rows.get(key).cloned(),
        };
        match patch {
            ReactionPatch::React { post_id, kind } => {
                self.insert(ReactionRow::new(post_id, self.viewer_id.clone(), kind));
            }
            ReactionPatch::Unreact { .. } => {
                if self.rows.contains_key(key) {
                    self.remove(key);
                }
            }
        }
        snapshot
    }

    fn restore(&mut self, key: &str, snapshot: ReactionSnapshot) {
        if self.rows.contains_key(key) {
            self.remove(key);
        }
        if let Some(row) = snapshot.viewer_row {
            self.insert(row);
        }
    }
}
