//! The session facade the UI talks to.
//!
//! One [`SyncSession`] binds a viewer to a thread: the thread's posts and
//! their reactions, the viewer's matches, and a presence/typing room.
//!
//! ```text
//!  open()
//!    │ fetch snapshots ──▶ LocalCollection / ReactionAggregator
//!    │ subscribe posts, post_reactions, matches
//!    ▼
//!  pump task per table (starts degraded)
//!    Change ───────────▶ dispatcher / aggregator
//!    Error, Idle ──────▶ mark degraded
//!    Subscribed ───────▶ if degraded: refetch + reconcile
//!
//!  create_post / update_post / ... ──▶ MutationController
//!    optimistic patch now, commit in the background, rollback on failure
//! ```
//!
//! Mutation failures are the only errors handed back to the caller and
//! to the [`ErrorReporter`]. Connection trouble is logged and repaired in
//! place.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{Backend, SnapshotQuery, WriteOp, WriteRequest};
use crate::channel::{ChannelManager, ChannelMessage, ChannelStatus, SubscriptionHandle, Visibility};
use crate::collection::{CollectionItem, CollectionPatch, LocalCollection};
use crate::config::SyncConfig;
use crate::dispatcher::{Binding, ChangeDispatcher, CollectionChange};
use crate::error::{BackendError, SyncError};
use crate::mutation::{MutationController, MutationOutcome, Optimistic};
use crate::presence::{PresenceEntry, PresenceTracker};
use crate::protocol::{table_topic, ChangeEvent, EventFilter, Record, Viewer, ID_FIELD};
use crate::provider::RealtimeProvider;
use crate::reactions::{reaction_id, ReactionAggregate, ReactionAggregator, ReactionPatch, ReactionRow};
use crate::telemetry::ErrorReporter;
use crate::typing::{TypingService, TypingSession};

pub const POSTS_TABLE: &str = "posts";
pub const REACTIONS_TABLE: &str = "post_reactions";
pub const MATCHES_TABLE: &str = "matches";

const THREAD_FIELD: &str = "thread_id";
const AUTHOR_FIELD: &str = "author_id";
const CREATED_FIELD: &str = "created_at";
const OWNER_FIELD: &str = "user_id";

/// Who is looking at what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub thread_id: String,
    pub viewer: Viewer,
}

impl SessionOptions {
    pub fn new(thread_id: impl Into<String>, viewer: Viewer) -> Self {
        Self {
            thread_id: thread_id.into(),
            viewer,
        }
    }

    /// Presence and typing room of the thread.
    pub fn room_topic(&self) -> String {
        format!("room:thread:{}", self.thread_id)
    }
}

/// Result of a UI mutation that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationReceipt {
    pub entity_id: String,
    pub outcome: MutationOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Posts,
    Reactions,
    Matches,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Posts => POSTS_TABLE,
            Table::Reactions => REACTIONS_TABLE,
            Table::Matches => MATCHES_TABLE,
        }
    }
}

struct Bindings {
    posts: Binding,
    reactions: Binding,
    matches: Binding,
}

impl Bindings {
    fn new(options: &SessionOptions) -> Self {
        let thread = EventFilter::eq(THREAD_FIELD, options.thread_id.as_str());
        let owner = EventFilter::eq(OWNER_FIELD, options.viewer.id.as_str());
        Self {
            posts: Binding::new(table_topic(POSTS_TABLE, Some(&thread)), Some(thread.clone())),
            reactions: Binding::new(table_topic(REACTIONS_TABLE, Some(&thread)), Some(thread)),
            matches: Binding::new(table_topic(MATCHES_TABLE, Some(&owner)), Some(owner)),
        }
    }

    fn get(&self, table: Table) -> &Binding {
        match table {
            Table::Posts => &self.posts,
            Table::Reactions => &self.reactions,
            Table::Matches => &self.matches,
        }
    }

    fn query(&self, table: Table) -> SnapshotQuery {
        let query = SnapshotQuery::new(table.name(), self.get(table).filter.clone());
        match table {
            Table::Posts | Table::Matches => query.order_by(CREATED_FIELD),
            Table::Reactions => query,
        }
    }
}

/// Fetch a snapshot unless `token` fires first. `Ok(None)` means aborted.
async fn fetch_snapshot(
    backend: &dyn Backend,
    query: &SnapshotQuery,
    token: &CancellationToken,
) -> Result<Option<Vec<Record>>, SyncError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Ok(None),
        rows = backend.fetch(query) => rows.map(Some).map_err(SyncError::Fetch),
    }
}

/// How an entity's local state runs ahead of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unacked {
    /// Inserted locally; the backend does not have the row yet.
    Created,
    /// Removed locally; the backend still has the row.
    Removed,
}

/// Writes the backend has not acknowledged, keyed by entity.
///
/// A superseded commit is dropped before it lands, so the write that
/// replaced it has to carry its effect: an update over an unacknowledged
/// create is sent as an insert, and a toggle that undoes an
/// unacknowledged toggle sends nothing.
#[derive(Clone, Default)]
struct UnackedWrites(Arc<StdMutex<HashMap<String, Unacked>>>);

impl UnackedWrites {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Unacked>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, key: &str) -> Option<Unacked> {
        self.entries().get(key).copied()
    }

    /// Record `state` unless `key` already runs ahead of the backend.
    fn mark(&self, key: &str, state: Unacked) {
        self.entries().entry(key.to_string()).or_insert(state);
    }

    fn clear(&self, key: &str) {
        self.entries().remove(key);
    }

    fn clear_all(&self) {
        self.entries().clear();
    }
}

/// Commit `request`, then forget `key`'s unacknowledged state. On failure
/// the rollback restores what the backend has, so it is forgotten too.
async fn commit_write(
    backend: Arc<dyn Backend>,
    unacked: UnackedWrites,
    key: String,
    request: WriteRequest,
) -> Result<(), BackendError> {
    let result = backend.commit(&request).await.map(|_| ());
    unacked.clear(&key);
    result
}

struct SessionInner {
    options: SessionOptions,
    bindings: Bindings,
    room: String,
    backend: Arc<dyn Backend>,
    channels: ChannelManager,
    reporter: Arc<ErrorReporter>,
    posts: ChangeDispatcher<Record>,
    matches: ChangeDispatcher<Record>,
    reactions: Arc<RwLock<ReactionAggregator>>,
    post_writes: MutationController<LocalCollection<Record>>,
    match_writes: MutationController<LocalCollection<Record>>,
    reaction_writes: MutationController<ReactionAggregator>,
    unacked_posts: UnackedWrites,
    unacked_reactions: UnackedWrites,
    presence: PresenceTracker,
    typing: TypingService,
    /// Replaced after every abort so later fetches start clean.
    fetch_token: Mutex<CancellationToken>,
    token: CancellationToken,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SessionInner {
    async fn fetch(&self, table: Table) -> Result<Option<Vec<Record>>, SyncError> {
        let token = self.fetch_token.lock().await.clone();
        fetch_snapshot(self.backend.as_ref(), &self.bindings.query(table), &token).await
    }

    async fn apply_change(&self, table: Table, event: &ChangeEvent) {
        match table {
            Table::Posts => {
                self.posts.on_event(event).await;
            }
            Table::Matches => {
                self.matches.on_event(event).await;
            }
            Table::Reactions => {
                if !self.bindings.reactions.accepts(event) {
                    log::debug!("reactions: dropping event from foreign topic {}", event.topic);
                    return;
                }
                if let Err(e) = self.reactions.write().await.apply(event) {
                    log::warn!("reactions: ignoring malformed event #{}: {e}", event.sequence);
                }
            }
        }
    }

    /// Refetch `table` and reconcile local state with it. Returns `false`
    /// when the fetch failed or was aborted.
    async fn resync(&self, table: Table) -> bool {
        let rows = match self.fetch(table).await {
            Ok(Some(rows)) => rows,
            Ok(None) => {
                log::debug!("{}: resync aborted", table.name());
                return false;
            }
            Err(e) => {
                log::warn!("{}: resync failed: {e}", table.name());
                return false;
            }
        };

        let changed = match table {
            Table::Posts => {
                let pending = self.post_writes.pending_keys().await;
                self.posts.reconcile(&rows, &pending).await
            }
            Table::Matches => {
                let pending = self.match_writes.pending_keys().await;
                self.matches.reconcile(&rows, &pending).await
            }
            Table::Reactions => {
                let pending = self.reaction_writes.pending_keys().await;
                self.reactions.write().await.reconcile(&rows, &pending)
            }
        };
        log::info!("{}: resynced {} rows, {changed} changed", table.name(), rows.len());
        true
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::SessionClosed);
        }
        Ok(())
    }

    /// Apply `patch` optimistically, run `commit`, and wait for the
    /// outcome. Failures are reported before being returned.
    async fn run_mutation<S, F>(
        &self,
        controller: &MutationController<S>,
        key: &str,
        patch: S::Patch,
        commit: F,
    ) -> Result<MutationReceipt, SyncError>
    where
        S: Optimistic,
        F: Future<Output = Result<(), BackendError>> + Send + 'static,
    {
        let handle = controller.mutate(key, patch, commit).await;

        match handle.outcome().await {
            Ok(outcome) => Ok(MutationReceipt {
                entity_id: key.to_string(),
                outcome,
            }),
            Err(e) => {
                if e.is_user_visible() {
                    self.reporter.report(&e).await;
                }
                Err(e)
            }
        }
    }

    async fn abort_inflight(&self) {
        let mut token = self.fetch_token.lock().await;
        token.cancel();
        *token = CancellationToken::new();
        drop(token);

        self.post_writes.cancel_all().await;
        self.match_writes.cancel_all().await;
        self.reaction_writes.cancel_all().await;
        // Aborted writes roll back to what the backend acknowledged.
        self.unacked_posts.clear_all();
        self.unacked_reactions.clear_all();
    }
}

/// Feed one table's channel messages into local state.
///
/// Writes committed between the opening snapshot and the subscription
/// never reach the feed, so the first `Subscribed` resyncs as well.
async fn pump_table(
    inner: Arc<SessionInner>,
    table: Table,
    mut events: mpsc::UnboundedReceiver<ChannelMessage>,
) {
    let mut degraded = true;
    loop {
        let message = tokio::select! {
            biased;
            _ = inner.token.cancelled() => return,
            message = events.recv() => message,
        };
        match message {
            Some(ChannelMessage::Change(event)) => inner.apply_change(table, &event).await,
            Some(ChannelMessage::Status(ChannelStatus::Subscribed)) => {
                if degraded && inner.resync(table).await {
                    degraded = false;
                }
            }
            Some(ChannelMessage::Status(
                ChannelStatus::Error | ChannelStatus::Idle | ChannelStatus::Closed,
            )) => {
                if !degraded {
                    log::debug!("{}: channel degraded, resync on next subscribe", table.name());
                }
                degraded = true;
            }
            Some(_) => {}
            None => return,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn collection_from(table: Table, rows: &[Record]) -> LocalCollection<Record> {
    LocalCollection::from_snapshot(rows.iter().filter_map(|row| match Record::from_record(row) {
        Ok(row) => Some(row),
        Err(e) => {
            log::warn!("{}: skipping snapshot row: {e}", table.name());
            None
        }
    }))
}

fn flag_patch(id: &str, field: &str) -> Record {
    let mut patch = Record::new();
    patch.insert(ID_FIELD.into(), Value::from(id));
    patch.insert(field.into(), Value::Bool(true));
    patch
}

/// A viewer's live view of one thread.
pub struct SyncSession {
    inner: Arc<SessionInner>,
}

impl SyncSession {
    /// Fetch the initial snapshots, subscribe to the thread's tables and
    /// join its room.
    ///
    /// A failed snapshot does not fail the session: the table starts empty.
    /// Every table is resynced once its channel is subscribed.
    pub async fn open(
        config: SyncConfig,
        backend: Arc<dyn Backend>,
        provider: Arc<dyn RealtimeProvider>,
        reporter: Arc<ErrorReporter>,
        options: SessionOptions,
    ) -> Self {
        let bindings = Bindings::new(&options);
        let fetch_token = CancellationToken::new();

        let mut snapshots = Vec::new();
        for table in [Table::Posts, Table::Reactions, Table::Matches] {
            let rows = match fetch_snapshot(backend.as_ref(), &bindings.query(table), &fetch_token).await {
                Ok(Some(rows)) => Some(rows),
                Ok(None) => None,
                Err(e) => {
                    log::warn!("{}: initial snapshot failed: {e}", table.name());
                    None
                }
            };
            snapshots.push((table, rows));
        }

        let mut posts = LocalCollection::new();
        let mut matches = LocalCollection::new();
        let mut reactions = ReactionAggregator::new(options.viewer.id.clone());
        for (table, rows) in snapshots {
            let Some(rows) = rows else {
                continue;
            };
            match table {
                Table::Posts => posts = collection_from(table, &rows),
                Table::Matches => matches = collection_from(table, &rows),
                Table::Reactions => {
                    reactions.reconcile(&rows, &HashSet::new());
                }
            }
        }

        let posts = posts.shared();
        let matches = matches.shared();
        let reactions = Arc::new(RwLock::new(reactions));
        let channels = ChannelManager::new(provider, &config);

        let inner = Arc::new(SessionInner {
            room: options.room_topic(),
            posts: ChangeDispatcher::new(POSTS_TABLE, posts.clone(), bindings.posts.clone()),
            matches: ChangeDispatcher::new(MATCHES_TABLE, matches.clone(), bindings.matches.clone()),
            post_writes: MutationController::new(POSTS_TABLE, posts),
            match_writes: MutationController::new(MATCHES_TABLE, matches),
            reaction_writes: MutationController::new(REACTIONS_TABLE, reactions.clone()),
            reactions,
            unacked_posts: UnackedWrites::default(),
            unacked_reactions: UnackedWrites::default(),
            presence: PresenceTracker::new(channels.clone(), &config),
            typing: TypingService::new(channels.clone(), &config),
            channels,
            bindings,
            backend,
            reporter,
            fetch_token: Mutex::new(fetch_token),
            token: CancellationToken::new(),
            subscriptions: Mutex::new(Vec::new()),
            pumps: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            options,
        });

        for table in [Table::Posts, Table::Reactions, Table::Matches] {
            let binding = inner.bindings.get(table);
            let subscription = inner
                .channels
                .subscribe(&binding.topic, binding.filter.clone())
                .await;
            inner.subscriptions.lock().await.push(subscription.handle);
            let pump = tokio::spawn(pump_table(inner.clone(), table, subscription.events));
            inner.pumps.lock().await.push(pump);
        }

        let viewer = &inner.options.viewer;
        let metadata = BTreeMap::from([("display_name".to_string(), viewer.display_name.clone())]);
        inner.presence.join(&inner.room, &viewer.id, metadata).await;
        inner.typing.attach(&inner.room, viewer).await;

        log::info!(
            "session open for {} on thread {}",
            inner.options.viewer.id,
            inner.options.thread_id
        );
        Self { inner }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn viewer(&self) -> &Viewer {
        &self.inner.options.viewer
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.inner.channels
    }

    pub fn posts_topic(&self) -> &str {
        &self.inner.bindings.posts.topic
    }

    pub fn reactions_topic(&self) -> &str {
        &self.inner.bindings.reactions.topic
    }

    pub fn matches_topic(&self) -> &str {
        &self.inner.bindings.matches.topic
    }

    pub fn room_topic(&self) -> &str {
        &self.inner.room
    }

    // ── mutations ──────────────────────────────────────────────────

    /// Publish a new post in the thread. The id is generated unless
    /// `fields` carries one.
    pub async fn create_post(&self, fields: Record) -> Result<MutationReceipt, SyncError> {
        self.inner.ensure_open()?;
        let mut record = fields;
        let id = match record.get(ID_FIELD).and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        record.insert(ID_FIELD.into(), Value::from(id.as_str()));
        record.insert(THREAD_FIELD.into(), Value::from(self.inner.options.thread_id.as_str()));
        record.insert(AUTHOR_FIELD.into(), Value::from(self.viewer().id.as_str()));
        record
            .entry(CREATED_FIELD)
            .or_insert_with(|| Value::from(now_millis()));

        let request = WriteRequest::new(POSTS_TABLE, self.viewer().id.as_str(), WriteOp::Insert(record.clone()));
        let unacked = self.inner.unacked_posts.clone();
        unacked.mark(&id, Unacked::Created);
        let commit = commit_write(self.inner.backend.clone(), unacked, id.clone(), request);
        self.inner
            .run_mutation(&self.inner.post_writes, &id, CollectionPatch::Insert(record), commit)
            .await
    }

    /// Merge `patch` into an existing post.
    ///
    /// If the post's own create was superseded before the backend took it,
    /// the merged row is inserted instead.
    pub async fn update_post(&self, post_id: &str, patch: Record) -> Result<MutationReceipt, SyncError> {
        self.inner.ensure_open()?;
        let mut merged = self
            .post(post_id)
            .await
            .ok_or_else(|| SyncError::UnknownEntity(post_id.to_string()))?;
        merged.merge(&patch);

        let mut local = patch.clone();
        local.insert(ID_FIELD.into(), Value::from(post_id));

        let backend = self.inner.backend.clone();
        let unacked = self.inner.unacked_posts.clone();
        let actor = self.viewer().id.clone();
        let id = post_id.to_string();
        let commit = async move {
            let op = match unacked.get(&id) {
                Some(Unacked::Created) => WriteOp::Insert(merged),
                _ => WriteOp::Update { id: id.clone(), patch },
            };
            let request = WriteRequest::new(POSTS_TABLE, actor, op);
            commit_write(backend, unacked, id, request).await
        };
        self.inner
            .run_mutation(&self.inner.post_writes, post_id, CollectionPatch::Merge(local), commit)
            .await
    }

    /// Remove a post. Deleting a post the backend never received sends
    /// nothing.
    pub async fn delete_post(&self, post_id: &str) -> Result<MutationReceipt, SyncError> {
        self.inner.ensure_open()?;
        self.require_post(post_id).await?;

        let backend = self.inner.backend.clone();
        let unacked = self.inner.unacked_posts.clone();
        let request = WriteRequest::new(
            POSTS_TABLE,
            self.viewer().id.as_str(),
            WriteOp::Delete {
                id: post_id.to_string(),
            },
        );
        let id = post_id.to_string();
        let commit = async move {
            if unacked.get(&id) == Some(Unacked::Created) {
                unacked.clear(&id);
                return Ok(());
            }
            commit_write(backend, unacked, id, request).await
        };
        self.inner
            .run_mutation(&self.inner.post_writes, post_id, CollectionPatch::Remove, commit)
            .await
    }

    /// React with `kind` on a post, or take the reaction back if the
    /// viewer already reacted.
    pub async fn toggle_reaction(&self, post_id: &str, kind: &str) -> Result<MutationReceipt, SyncError> {
        self.inner.ensure_open()?;
        self.require_post(post_id).await?;

        let viewer_id = self.viewer().id.as_str();
        let key = reaction_id(post_id, viewer_id, kind);
        let reacted = self.inner.reactions.read().await.viewer_reacted(post_id, kind);

        let (patch, op, state) = if reacted {
            (
                ReactionPatch::Unreact {
                    post_id: post_id.to_string(),
                    kind: kind.to_string(),
                },
                WriteOp::Delete { id: key.clone() },
                Unacked::Removed,
            )
        } else {
            let mut row = ReactionRow::new(post_id, viewer_id, kind).to_record();
            row.insert(THREAD_FIELD.into(), Value::from(self.inner.options.thread_id.as_str()));
            (
                ReactionPatch::React {
                    post_id: post_id.to_string(),
                    kind: kind.to_string(),
                },
                WriteOp::Insert(row),
                Unacked::Created,
            )
        };

        let backend = self.inner.backend.clone();
        let unacked = self.inner.unacked_reactions.clone();
        unacked.mark(&key, state);
        let request = WriteRequest::new(REACTIONS_TABLE, viewer_id, op);
        let id = key.clone();
        let commit = async move {
            // Undoes a toggle the backend never saw.
            if unacked.get(&id).is_some_and(|pending| pending != state) {
                unacked.clear(&id);
                return Ok(());
            }
            commit_write(backend, unacked, id, request).await
        };
        self.inner
            .run_mutation(&self.inner.reaction_writes, &key, patch, commit)
            .await
    }

    pub async fn mark_viewed(&self, match_id: &str) -> Result<MutationReceipt, SyncError> {
        self.flag_match(match_id, "viewed").await
    }

    pub async fn dismiss(&self, match_id: &str) -> Result<MutationReceipt, SyncError> {
        self.flag_match(match_id, "dismissed").await
    }

    async fn flag_match(&self, match_id: &str, field: &str) -> Result<MutationReceipt, SyncError> {
        self.inner.ensure_open()?;
        if !self.inner.matches.collection().read().await.contains(match_id) {
            return Err(SyncError::UnknownEntity(match_id.to_string()));
        }

        let patch = flag_patch(match_id, field);
        let mut remote = patch.clone();
        remote.remove(ID_FIELD);
        let request = WriteRequest::new(
            MATCHES_TABLE,
            self.viewer().id.as_str(),
            WriteOp::Update {
                id: match_id.to_string(),
                patch: remote,
            },
        );
        let backend = self.inner.backend.clone();
        let commit = async move { backend.commit(&request).await.map(|_| ()) };
        self.inner
            .run_mutation(&self.inner.match_writes, match_id, CollectionPatch::Merge(patch), commit)
            .await
    }

    async fn require_post(&self, post_id: &str) -> Result<(), SyncError> {
        if self.inner.posts.collection().read().await.contains(post_id) {
            Ok(())
        } else {
            Err(SyncError::UnknownEntity(post_id.to_string()))
        }
    }

    // ── reads ──────────────────────────────────────────────────────

    pub async fn posts(&self) -> Vec<Record> {
        self.inner.posts.collection().read().await.items().to_vec()
    }

    pub async fn post(&self, post_id: &str) -> Option<Record> {
        self.inner.posts.collection().read().await.get(post_id).cloned()
    }

    pub async fn matches(&self) -> Vec<Record> {
        self.inner.matches.collection().read().await.items().to_vec()
    }

    pub async fn reactions(&self, post_id: &str) -> Vec<ReactionAggregate> {
        self.inner.reactions.read().await.aggregates(post_id)
    }

    pub async fn reaction_count(&self, post_id: &str, kind: &str) -> u32 {
        self.inner.reactions.read().await.count(post_id, kind)
    }

    /// Take the post change queue (can only be called once).
    pub async fn take_post_changes(&self) -> Option<mpsc::UnboundedReceiver<CollectionChange<Record>>> {
        self.inner.posts.take_changes().await
    }

    /// Take the match change queue (can only be called once).
    pub async fn take_match_changes(&self) -> Option<mpsc::UnboundedReceiver<CollectionChange<Record>>> {
        self.inner.matches.take_changes().await
    }

    pub async fn pending_mutations(&self) -> usize {
        self.inner.post_writes.pending_count().await
            + self.inner.match_writes.pending_count().await
            + self.inner.reaction_writes.pending_count().await
    }

    // ── presence & typing ─────────────────────────────────────────

    pub async fn presence_roster(&self) -> Vec<PresenceEntry> {
        self.inner.presence.roster(&self.inner.room).await
    }

    pub async fn typing_text(&self) -> String {
        self.inner.typing.typing_text(&self.inner.room).await
    }

    pub async fn active_typers(&self) -> Vec<TypingSession> {
        self.inner.typing.active_typers(&self.inner.room).await
    }

    /// Composer input changed. An empty composer stops typing.
    pub async fn on_typing_text_change(&self, text: &str) {
        if self.inner.ensure_open().is_err() {
            return;
        }
        self.inner
            .typing
            .on_typing_text_change(&self.inner.room, &self.inner.options.viewer, text)
            .await;
    }

    pub async fn stop_typing(&self) {
        self.inner.typing.stop_typing(&self.inner.room).await;
    }

    // ── lifecycle ─────────────────────────────────────────────────

    /// Hidden pauses every channel and aborts in-flight fetches and
    /// mutations; Visible reconnects and resyncs.
    pub async fn set_visibility(&self, visibility: Visibility) {
        if self.inner.ensure_open().is_err() {
            return;
        }
        if visibility == Visibility::Hidden {
            self.inner.abort_inflight().await;
        }
        self.inner.channels.set_visibility(visibility).await;
    }

    /// Tear everything down. Later mutations fail with `SessionClosed`.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.abort_inflight().await;
        self.inner.typing.detach_all().await;
        self.inner.presence.leave_all().await;

        self.inner.token.cancel();
        let pumps: Vec<JoinHandle<()>> = self.inner.pumps.lock().await.drain(..).collect();
        for pump in pumps {
            let _ = pump.await;
        }
        let subscriptions: Vec<SubscriptionHandle> =
            self.inner.subscriptions.lock().await.drain(..).collect();
        for handle in &subscriptions {
            self.inner.channels.unsubscribe(handle).await;
        }
        self.inner.channels.shutdown().await;
        log::info!("session closed for {}", self.inner.options.viewer.id);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.inner.token.cancel();
    }
}
