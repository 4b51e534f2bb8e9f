//! Optimistic mutation controller.
//!
//! A mutation patches local state immediately, then runs the remote write.
//! At most one mutation per entity is outstanding: a newer one cancels the
//! older one's token and inherits its rollback snapshot, so a later failure
//! still restores the last state the server vouched for.
//!
//! ```text
//! mutate(key, patch, commit)
//!     │  apply patch, capture snapshot        (target write lock)
//!     │  cancel + replace pending[key]        (pending lock)
//!     ▼
//! spawned commit ──┬── Ok   → clear pending                → Committed
//!                  ├── Err  → restore snapshot, clear      → Err(Mutation)
//!                  ├── panic → restore snapshot, clear     → Err(Internal)
//!                  └── token cancelled
//!                        ├── superseded → leave state      → Superseded
//!                        └── otherwise  → restore snapshot → Aborted
//! ```

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BackendError, SyncError};

/// State that can take an optimistic patch and later restore a snapshot.
pub trait Optimistic: Send + Sync + 'static {
    type Patch: Send + 'static;
    type Snapshot: Send + Sync + 'static;

    /// Apply `patch` to the entity at `key`, returning what is needed to
    /// undo it.
    fn apply_patch(&mut self, key: &str, patch: Self::Patch) -> Self::Snapshot;

    /// Put the entity at `key` back the way `snapshot` describes.
    fn restore(&mut self, key: &str, snapshot: Self::Snapshot);
}

/// How a mutation ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The write succeeded; the optimistic state stays until the change
    /// event confirms it.
    Committed,
    /// A newer mutation on the same entity took over; this result was
    /// discarded.
    Superseded,
    /// Cancelled by the owner (view closed, page hidden); the patch was
    /// rolled back.
    Aborted,
}

struct PendingMutation<Snap> {
    id: u64,
    rollback: Snap,
    token: CancellationToken,
}

/// Handle to one in-flight mutation.
#[derive(Debug)]
pub struct MutationHandle {
    id: u64,
    entity_id: String,
    token: CancellationToken,
    task: JoinHandle<Result<MutationOutcome, SyncError>>,
}

impl MutationHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Token that aborts the in-flight write.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Abort the in-flight write; the optimistic patch is rolled back.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the mutation to settle.
    pub async fn outcome(self) -> Result<MutationOutcome, SyncError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic().as_ref());
                log::error!("mutation {} on {} panicked: {message}", self.id, self.entity_id);
                Err(SyncError::Internal(format!("mutation on {} panicked: {message}", self.entity_id)))
            }
            Err(e) => {
                log::warn!("mutation {} task cancelled: {e}", self.id);
                Ok(MutationOutcome::Aborted)
            }
        }
    }
}

/// Serializes optimistic writes against one piece of shared state.
pub struct MutationController<S: Optimistic> {
    name: String,
    target: Arc<RwLock<S>>,
    pending: Arc<Mutex<HashMap<String, PendingMutation<S::Snapshot>>>>,
    next_id: AtomicU64,
}

impl<S: Optimistic> MutationController<S> {
    pub fn new(name: impl Into<String>, target: Arc<RwLock<S>>) -> Self {
        Self {
            name: name.into(),
            target,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn target(&self) -> &Arc<RwLock<S>> {
        &self.target
    }

    /// Apply `patch` to `entity_id` now and run `commit` in the background.
    ///
    /// The patch is visible to readers before this returns. Any mutation
    /// already outstanding on the same entity is cancelled.
    pub async fn mutate<F>(&self, entity_id: &str, patch: S::Patch, commit: F) -> MutationHandle
    where
        F: Future<Output = Result<(), BackendError>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        {
            // Lock order everywhere: target, then pending.
            let mut target = self.target.write().await;
            let mut pending = self.pending.lock().await;

            let mut rollback = target.apply_patch(entity_id, patch);
            if let Some(prior) = pending.remove(entity_id) {
                log::debug!(
                    "{}: mutation {id} supersedes {} on {entity_id}",
                    self.name,
                    prior.id
                );
                prior.token.cancel();
                rollback = prior.rollback;
            }
            pending.insert(
                entity_id.to_string(),
                PendingMutation {
                    id,
                    rollback,
                    token: token.clone(),
                },
            );
        }

        let task = tokio::spawn(settle(
            self.name.clone(),
            entity_id.to_string(),
            id,
            token.clone(),
            self.target.clone(),
            self.pending.clone(),
            commit,
        ));

        MutationHandle {
            id,
            entity_id: entity_id.to_string(),
            token,
            task,
        }
    }

    /// Abort every outstanding mutation.
    pub async fn cancel_all(&self) {
        let pending = self.pending.lock().await;
        for mutation in pending.values() {
            mutation.token.cancel();
        }
        if !pending.is_empty() {
            log::debug!("{}: cancelled {} pending mutations", self.name, pending.len());
        }
    }

    pub async fn is_pending(&self, entity_id: &str) -> bool {
        self.pending.lock().await.contains_key(entity_id)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Keys with an outstanding mutation.
    pub async fn pending_keys(&self) -> HashSet<String> {
        self.pending.lock().await.keys().cloned().collect()
    }
}

async fn settle<S, F>(
    name: String,
    entity_id: String,
    id: u64,
    token: CancellationToken,
    target: Arc<RwLock<S>>,
    pending: Arc<Mutex<HashMap<String, PendingMutation<S::Snapshot>>>>,
    commit: F,
) -> Result<MutationOutcome, SyncError>
where
    S: Optimistic,
    F: Future<Output = Result<(), BackendError>> + Send + 'static,
{
    let result = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = AssertUnwindSafe(commit).catch_unwind() => Some(result),
    };

    let mut target = target.write().await;
    let mut pending = pending.lock().await;

    let still_current = pending.get(&entity_id).is_some_and(|p| p.id == id);
    if !still_current {
        log::debug!("{name}: discarding result of superseded mutation {id} on {entity_id}");
        return Ok(MutationOutcome::Superseded);
    }

    // Cancelled after the write resolved counts as cancelled.
    let result = if token.is_cancelled() { None } else { result };

    match result {
        Some(Ok(Ok(()))) => {
            pending.remove(&entity_id);
            log::debug!("{name}: mutation {id} on {entity_id} committed");
            Ok(MutationOutcome::Committed)
        }
        Some(Err(panic)) => {
            if let Some(mutation) = pending.remove(&entity_id) {
                target.restore(&entity_id, mutation.rollback);
            }
            let message = panic_message(panic.as_ref());
            log::error!("{name}: commit for mutation {id} on {entity_id} panicked, rolled back: {message}");
            Err(SyncError::Internal(format!("commit for {entity_id} panicked: {message}")))
        }
        Some(Ok(Err(cause))) => {
            if let Some(mutation) = pending.remove(&entity_id) {
                target.restore(&entity_id, mutation.rollback);
            }
            log::warn!("{name}: mutation {id} on {entity_id} failed, rolled back: {cause}");
            Err(SyncError::Mutation { entity_id, cause })
        }
        None => {
            if let Some(mutation) = pending.remove(&entity_id) {
                target.restore(&entity_id, mutation.rollback);
            }
            log::debug!("{name}: mutation {id} on {entity_id} aborted");
            Ok(MutationOutcome::Aborted)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
