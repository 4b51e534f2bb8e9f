//! Bazaar console — scripted two-viewer run of the realtime sync core.
//!
//! Boots `bazaar-realtime` against the in-memory provider and backend,
//! plays a short conversation between two viewers (posts, reactions, a
//! rejected edit, typing, a dropped connection) and prints what each
//! viewer ends up seeing. `RUST_LOG=debug` shows the sync layer at work.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde_json::{json, Value};

use bazaar_realtime::{
    BackoffPolicy, ErrorReporter, MemoryBackend, MemoryProvider, ProviderStatus, Record,
    SessionOptions, SyncConfig, SyncSession, Viewer,
};

const THREAD: &str = "bikes";

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

async fn print_view(label: &str, session: &SyncSession) {
    println!("── {label} ──");
    for post in session.posts().await {
        let id = post.get("id").and_then(Value::as_str).unwrap_or("?");
        let author = post.get("author_id").and_then(Value::as_str).unwrap_or("?");
        let body = post.get("body").and_then(Value::as_str).unwrap_or("");
        let reactions: Vec<String> = session
            .reactions(id)
            .await
            .into_iter()
            .map(|r| format!("{}×{}{}", r.kind, r.count, if r.viewer_reacted { "*" } else { "" }))
            .collect();
        println!("  [{id}] {author}: {body} {}", reactions.join(" "));
    }
    for m in session.matches().await {
        println!("  match {}", Value::Object(m));
    }
    let roster: Vec<String> = session
        .presence_roster()
        .await
        .into_iter()
        .map(|e| e.peer_id)
        .collect();
    println!("  online: {}", roster.join(", "));
    let typing = session.typing_text().await;
    if !typing.is_empty() {
        println!("  {typing}");
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    info!("Starting Bazaar console...");

    let config = SyncConfig::default().with_backoff(BackoffPolicy::fixed(Duration::from_millis(500)));
    let reporter = ErrorReporter::init(config.queue_capacity);
    let provider = MemoryProvider::new();
    let backend = MemoryBackend::new(provider.clone());
    backend
        .seed(
            "posts",
            vec![record(json!({
                "id": "welcome",
                "thread_id": THREAD,
                "author_id": "alice",
                "body": "Selling a road bike, 56cm frame",
                "created_at": 0
            }))],
        )
        .await;
    backend
        .seed(
            "matches",
            vec![record(json!({
                "id": "m-1",
                "user_id": "bob",
                "listing": "road bike",
                "viewed": false,
                "created_at": 0
            }))],
        )
        .await;

    let open = |id: &str, name: &str| {
        SyncSession::open(
            config.clone(),
            Arc::new(backend.clone()),
            Arc::new(provider.clone()),
            reporter.clone(),
            SessionOptions::new(THREAD, Viewer::new(id, name)),
        )
    };
    let alice = open("alice", "Alice").await;
    let bob = open("bob", "Bob").await;
    settle().await;

    bob.mark_viewed("m-1").await?;
    bob.toggle_reaction("welcome", "like").await?;
    let question = bob
        .create_post(record(json!({"body": "Is it still available?"})))
        .await?;
    settle().await;

    alice.on_typing_text_change("Yes, come").await;
    settle().await;
    print_view("bob, while alice types", &bob).await;

    // Not his post: rolled back and reported.
    if let Err(e) = bob
        .update_post("welcome", record(json!({"body": "FREE BIKE"})))
        .await
    {
        println!("bob's edit refused: {e}");
    }

    // Bob's post feed drops; alice answers meanwhile.
    provider
        .send_status(bob.posts_topic(), ProviderStatus::ChannelError("wifi lost".into()))
        .await;
    settle().await;
    alice
        .create_post(record(json!({"body": "Yes, come by after 6"})))
        .await?;
    alice.toggle_reaction(&question.entity_id, "love").await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    print_view("alice", &alice).await;
    print_view("bob, after reconnect", &bob).await;

    bob.close().await;
    alice.close().await;

    let reports = reporter.shutdown().await;
    println!("{} failure(s) reported", reports.len());
    Ok(())
}
