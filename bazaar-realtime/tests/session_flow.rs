//! End-to-end session tests.
//!
//! Two viewers share one in-memory provider and backend, so every write
//! travels the real path: optimistic patch, commit, change feed, channel,
//! dispatcher. Time is paused; `settle()` lets background tasks drain.

use std::sync::Arc;

use bazaar_realtime::{
    BackendError, ChannelStatus, MemoryBackend, MemoryProvider, MutationOutcome, ProviderStatus,
    Record, SessionOptions, SyncConfig, SyncError, SyncSession, Viewer, Visibility, WriteOp,
    WriteRequest, Backend, ErrorReporter,
};
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};

struct Harness {
    provider: MemoryProvider,
    backend: MemoryBackend,
    reporter: Arc<ErrorReporter>,
}

impl Harness {
    async fn new() -> Self {
        let provider = MemoryProvider::new();
        let backend = MemoryBackend::new(provider.clone());
        backend
            .seed(
                "posts",
                vec![row(json!({
                    "id": "p1",
                    "thread_id": "t1",
                    "author_id": "alice",
                    "body": "first",
                    "created_at": 1
                }))],
            )
            .await;
        backend
            .seed(
                "matches",
                vec![row(json!({
                    "id": "m1",
                    "user_id": "alice",
                    "listing": "bike",
                    "viewed": false,
                    "created_at": 1
                }))],
            )
            .await;
        Self {
            provider,
            backend,
            reporter: ErrorReporter::init(16),
        }
    }

    async fn open(&self, id: &str, name: &str) -> SyncSession {
        let session = SyncSession::open(
            SyncConfig::default(),
            Arc::new(self.backend.clone()),
            Arc::new(self.provider.clone()),
            self.reporter.clone(),
            SessionOptions::new("t1", Viewer::new(id, name)),
        )
        .await;
        settle().await;
        session
    }
}

fn row(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => panic!("not an object"),
    }
}

fn body_of(record: &Record) -> Option<&str> {
    record.get("body").and_then(Value::as_str)
}

async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

// ─── Posts ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_new_post_reaches_other_viewer() {
    let h = Harness::new().await;
    let alice = h.open("alice", "Alice").await;
    let bob = h.open("bob", "Bob").await;

    let receipt = alice
        .create_post(row(json!({"body": "anyone selling a bike?"})))
        .await
        .unwrap();
    assert_eq!(receipt.outcome, MutationOutcome::Committed);
    settle().await;

    let seen = bob.post(&receipt.entity_id).await.expect("bob sees the post");
    assert_eq!(body_of(&seen), Some("anyone selling a bike?"));
    assert_eq!(seen.get("author_id"), Some(&json!("alice")));

    // The echo of alice's own write must not duplicate her optimistic row.
    let ids: Vec<String> = alice
        .posts()
        .await
        .iter()
        .filter_map(|p| p.get("id").and_then(Value::as_str).map(String::from))
        .collect();
    assert_eq!(ids, vec!["p1".to_string(), receipt.entity_id.clone()]);
}

#[tokio::test(start_paused = true)]
async fn test_optimistic_post_visible_before_commit() {
    let h = Harness::new().await;
    let alice = h.open("alice", "Alice").await;
    h.backend.set_latency(Duration::from_secs(1)).await;

    let (receipt, during) = tokio::join!(
        alice.create_post(row(json!({"id": "p-new", "body": "draft"}))),
        async {
            sleep(Duration::from_millis(100)).await;
            alice.post("p-new").await
        }
    );

    assert_eq!(during.as_ref().and_then(body_of), Some("draft"));
    assert_eq!(receipt.unwrap().outcome, MutationOutcome::Committed);
    assert_eq!(h.backend.rows("posts").await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_edit_during_create_is_saved_as_insert() {
    let h = Harness::new().await;
    let alice = h.open("alice", "Alice").await;
    let bob = h.open("bob", "Bob").await;
    h.backend.set_latency(Duration::from_secs(1)).await;

    let (created, edited) = tokio::join!(
        alice.create_post(row(json!({"id": "p-new", "body": "draft"}))),
        async {
            sleep(Duration::from_millis(100)).await;
            alice.update_post("p-new", row(json!({"body": "final"}))).await
        }
    );
    assert_eq!(created.unwrap().outcome, MutationOutcome::Superseded);
    assert_eq!(edited.unwrap().outcome, MutationOutcome::Committed);
    settle().await;

    let stored = h.backend.rows("posts").await;
    let saved = stored
        .iter()
        .find(|p| p.get("id") == Some(&json!("p-new")))
        .expect("the edit carries the insert");
    assert_eq!(body_of(saved), Some("final"));
    assert_eq!(saved.get("author_id"), Some(&json!("alice")));
    assert_eq!(saved.get("thread_id"), Some(&json!("t1")));
    assert_eq!(h.backend.commits().await, 1);

    assert_eq!(alice.post("p-new").await.as_ref().and_then(body_of), Some("final"));
    assert_eq!(bob.post("p-new").await.as_ref().and_then(body_of), Some("final"));
    assert_eq!(h.reporter.pending().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_delete_during_create_sends_nothing() {
    let h = Harness::new().await;
    let alice = h.open("alice", "Alice").await;
    h.backend.set_latency(Duration::from_secs(1)).await;

    let (created, deleted) = tokio::join!(
        alice.create_post(row(json!({"id": "p-tmp", "body": "oops"}))),
        async {
            sleep(Duration::from_millis(100)).await;
            alice.delete_post("p-tmp").await
        }
    );
    assert_eq!(created.unwrap().outcome, MutationOutcome::Superseded);
    assert_eq!(deleted.unwrap().outcome, MutationOutcome::Committed);
    sleep(Duration::from_secs(2)).await;

    assert!(alice.post("p-tmp").await.is_none());
    assert_eq!(h.backend.rows("posts").await.len(), 1);
    assert_eq!(h.backend.commits().await, 0);
    assert_eq!(h.reporter.pending().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_update_rolls_back() {
    let h = Harness::new().await;
    let bob = h.open("bob", "Bob").await;

    let result = bob.update_post("p1", row(json!({"body": "hacked"}))).await;
    match result {
        Err(SyncError::Mutation { entity_id, cause }) => {
            assert_eq!(entity_id, "p1");
            assert!(matches!(cause, BackendError::Unauthorized(_)));
        }
        other => panic!("expected mutation failure, got {other:?}"),
    }

    let p1 = bob.post("p1").await.unwrap();
    assert_eq!(body_of(&p1), Some("first"));
    assert_eq!(h.reporter.flush().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_create_is_removed_and_reported() {
    let h = Harness::new().await;
    let alice = h.open("alice", "Alice").await;
    h.backend.fail_next(BackendError::Transport("connection reset".into())).await;

    let result = alice.create_post(row(json!({"id": "p2", "body": "lost"}))).await;
    assert!(matches!(result, Err(SyncError::Mutation { .. })));
    assert!(alice.post("p2").await.is_none());

    let reports = h.reporter.flush().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].error.is_user_visible());
}

#[tokio::test(start_paused = true)]
async fn test_delete_post_propagates() {
    let h = Harness::new().await;
    let alice = h.open("alice", "Alice").await;
    let bob = h.open("bob", "Bob").await;

    let receipt = alice.delete_post("p1").await.unwrap();
    assert_eq!(receipt.outcome, MutationOutcome::Committed);
    settle().await;

    assert!(alice.post("p1").await.is_none());
    assert!(bob.post("p1").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_post_is_refused_without_report() {
    let h = Harness::new().await;
    let alice = h.open("alice", "Alice").await;

    let result = alice.update_post("nope", Record::new()).await;
    assert_eq!(result, Err(SyncError::UnknownEntity("nope".into())));
    assert_eq!(h.reporter.pending().await, 0);
    assert_eq!(h.backend.commits().await, 0);
}

// ─── Reconnect ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_update_missed_while_disconnected_is_recovered() {
    let h = Harness::new().await;
    let bob = h.open("bob", "Bob").await;
    let topic = bob.posts_topic().to_string();

    h.provider
        .send_status(&topic, ProviderStatus::ChannelError("socket dropped".into()))
        .await;
    settle().await;
    assert_eq!(bob.channels().status(&topic).await, Some(ChannelStatus::Error));

    // Committed while bob has no live subscription: the feed drops it.
    let insert = WriteRequest::new(
        "posts",
        "alice",
        WriteOp::Insert(row(json!({
            "id": "p9",
            "thread_id": "t1",
            "author_id": "alice",
            "body": "missed",
            "created_at": 9
        }))),
    );
    h.backend.commit(&insert).await.unwrap();
    settle().await;
    assert!(bob.post("p9").await.is_none());

    // Fixed 5s backoff, then resubscribe and resync.
    sleep(Duration::from_secs(6)).await;
    assert_eq!(bob.channels().status(&topic).await, Some(ChannelStatus::Subscribed));
    let p9 = bob.post("p9").await.expect("resync restores the missed post");
    assert_eq!(body_of(&p9), Some("missed"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_initial_snapshot_is_retried_on_subscribe() {
    let h = Harness::new().await;
    h.backend.fail_next_fetch(BackendError::Timeout).await;

    let alice = h.open("alice", "Alice").await;

    assert!(alice.post("p1").await.is_some());
    assert_eq!(h.reporter.pending().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_write_committed_while_opening_is_picked_up() {
    let h = Harness::new().await;
    h.backend.set_latency(Duration::from_secs(1)).await;

    // Lands after the posts snapshot is read, before the channel exists.
    let backend = h.backend.clone();
    let writer = tokio::spawn(async move {
        sleep(Duration::from_millis(200)).await;
        let insert = WriteRequest::new(
            "posts",
            "alice",
            WriteOp::Insert(row(json!({
                "id": "p9",
                "thread_id": "t1",
                "author_id": "alice",
                "body": "posted during open",
                "created_at": 9
            }))),
        );
        backend.commit(&insert).await
    });

    let bob = h.open("bob", "Bob").await;
    writer.await.unwrap().unwrap();
    sleep(Duration::from_secs(5)).await;

    let p9 = bob.post("p9").await.expect("first subscribe resyncs the snapshot");
    assert_eq!(body_of(&p9), Some("posted during open"));
    assert!(bob.post("p1").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_hidden_aborts_inflight_mutation() {
    let h = Harness::new().await;
    let alice = h.open("alice", "Alice").await;
    h.backend.set_latency(Duration::from_secs(10)).await;

    let (receipt, _) = tokio::join!(
        alice.create_post(row(json!({"id": "p-x", "body": "half-typed"}))),
        async {
            sleep(Duration::from_secs(1)).await;
            alice.set_visibility(Visibility::Hidden).await;
        }
    );

    assert_eq!(receipt.unwrap().outcome, MutationOutcome::Aborted);
    assert!(alice.post("p-x").await.is_none());
    assert_eq!(h.reporter.pending().await, 0);
    assert_eq!(
        alice.channels().status(alice.posts_topic()).await,
        Some(ChannelStatus::Idle)
    );

    h.backend.set_latency(Duration::ZERO).await;
    alice.set_visibility(Visibility::Visible).await;
    settle().await;
    assert_eq!(
        alice.channels().status(alice.posts_topic()).await,
        Some(ChannelStatus::Subscribed)
    );
    assert!(h.backend.rows("posts").await.iter().all(|p| p.get("id") != Some(&json!("p-x"))));
}

// ─── Reactions ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_toggle_reaction_round_trip() {
    let h = Harness::new().await;
    let alice = h.open("alice", "Alice").await;
    let bob = h.open("bob", "Bob").await;

    alice.toggle_reaction("p1", "like").await.unwrap();
    settle().await;

    assert_eq!(bob.reaction_count("p1", "like").await, 1);
    let at_bob = bob.reactions("p1").await;
    assert_eq!(at_bob.len(), 1);
    assert!(!at_bob[0].viewer_reacted);
    assert!(alice.reactions("p1").await[0].viewer_reacted);

    bob.toggle_reaction("p1", "like").await.unwrap();
    settle().await;
    assert_eq!(alice.reaction_count("p1", "like").await, 2);

    alice.toggle_reaction("p1", "like").await.unwrap();
    settle().await;
    assert_eq!(bob.reaction_count("p1", "like").await, 1);
    assert_eq!(alice.reaction_count("p1", "like").await, 1);
    assert!(!alice.reactions("p1").await[0].viewer_reacted);
}

// ─── Matches ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_double_toggle_during_commit_cancels_out() {
    let h = Harness::new().await;
    let alice = h.open("alice", "Alice").await;
    h.backend.set_latency(Duration::from_secs(1)).await;

    let (first, second) = tokio::join!(
        alice.toggle_reaction("p1", "like"),
        async {
            sleep(Duration::from_millis(100)).await;
            alice.toggle_reaction("p1", "like").await
        }
    );
    assert_eq!(first.unwrap().outcome, MutationOutcome::Superseded);
    assert_eq!(second.unwrap().outcome, MutationOutcome::Committed);
    sleep(Duration::from_secs(2)).await;

    assert_eq!(alice.reaction_count("p1", "like").await, 0);
    assert!(h.backend.rows("post_reactions").await.is_empty());
    assert_eq!(h.backend.commits().await, 0);
    assert_eq!(h.reporter.pending().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_mark_viewed_and_dismiss() {
    let h = Harness::new().await;
    let alice = h.open("alice", "Alice").await;
    assert_eq!(alice.matches().await.len(), 1);

    alice.mark_viewed("m1").await.unwrap();
    alice.dismiss("m1").await.unwrap();

    let local = &alice.matches().await[0];
    assert_eq!(local.get("viewed"), Some(&json!(true)));
    assert_eq!(local.get("dismissed"), Some(&json!(true)));
    let stored = &h.backend.rows("matches").await[0];
    assert_eq!(stored.get("viewed"), Some(&json!(true)));
    assert_eq!(stored.get("listing"), Some(&json!("bike")));

    assert_eq!(
        alice.mark_viewed("m404").await,
        Err(SyncError::UnknownEntity("m404".into()))
    );
}

// ─── Presence & typing ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_presence_roster_follows_join_and_close() {
    let h = Harness::new().await;
    let alice = h.open("alice", "Alice").await;
    let bob = h.open("bob", "Bob").await;

    let ids: Vec<String> = alice.presence_roster().await.into_iter().map(|e| e.peer_id).collect();
    assert_eq!(ids, vec!["alice", "bob"]);
    let bob_entry = &alice.presence_roster().await[1];
    assert_eq!(bob_entry.metadata.get("display_name").map(String::as_str), Some("Bob"));

    bob.close().await;
    settle().await;
    let ids: Vec<String> = alice.presence_roster().await.into_iter().map(|e| e.peer_id).collect();
    assert_eq!(ids, vec!["alice"]);
}

#[tokio::test(start_paused = true)]
async fn test_typing_indicator_clears_after_pause() {
    let h = Harness::new().await;
    let alice = h.open("alice", "Alice").await;
    let bob = h.open("bob", "Bob").await;

    alice.on_typing_text_change("is the bike still").await;
    settle().await;
    assert_eq!(bob.typing_text().await, "Alice is typing…");
    assert_eq!(alice.typing_text().await, "");

    // No keystroke for 6s: the idle stop goes out at 5s.
    sleep(Duration::from_secs(6)).await;
    assert_eq!(bob.typing_text().await, "");
    assert!(bob.active_typers().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_clearing_composer_stops_typing() {
    let h = Harness::new().await;
    let alice = h.open("alice", "Alice").await;
    let bob = h.open("bob", "Bob").await;

    alice.on_typing_text_change("h").await;
    settle().await;
    assert_eq!(bob.active_typers().await.len(), 1);

    alice.on_typing_text_change("").await;
    settle().await;
    assert!(bob.active_typers().await.is_empty());
}

// ─── Lifecycle ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_closed_session_refuses_mutations() {
    let h = Harness::new().await;
    let alice = h.open("alice", "Alice").await;
    let topic = alice.posts_topic().to_string();

    alice.close().await;
    settle().await;

    assert!(alice.is_closed());
    assert_eq!(
        alice.create_post(Record::new()).await,
        Err(SyncError::SessionClosed)
    );
    assert_eq!(h.provider.subscriber_count(&topic).await, 0);
}
