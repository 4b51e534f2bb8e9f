//! In-process change-feed provider.
//!
//! Holds subscribers per topic and fans frames out to them over unbounded
//! channels. Besides the [`RealtimeProvider`] surface it exposes hooks to
//! inject changes, force status transitions and script subscribe failures,
//! which is how tests and the console drive reconnect paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, Mutex};

use super::{FrameStream, RealtimeProvider};
use crate::error::ProviderError;
use crate::protocol::{
    table_of, EventFilter, PresenceMessage, PresenceState, ProviderFrame, ProviderStatus,
    RawChange,
};

/// Outcome forced onto the next subscribe call for a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedSubscribe {
    /// `subscribe` itself fails.
    Refuse(ProviderError),
    /// The handshake answers with this status and the stream ends.
    Status(ProviderStatus),
}

struct Subscriber {
    filter: Option<EventFilter>,
    tx: mpsc::UnboundedSender<ProviderFrame>,
}

impl Subscriber {
    fn accepts(&self, change: &RawChange) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches_change(change))
    }
}

#[derive(Default)]
struct MemoryState {
    subscribers: HashMap<String, Vec<Subscriber>>,
    presence: HashMap<String, BTreeMap<String, PresenceState>>,
    scripts: HashMap<String, VecDeque<ScriptedSubscribe>>,
    subscribe_calls: HashMap<String, usize>,
}

impl MemoryState {
    /// Send to every live subscriber of `topic` that `pick` accepts,
    /// dropping subscribers whose stream was released.
    fn deliver(&mut self, topic: &str, frame: &ProviderFrame, pick: impl Fn(&Subscriber) -> bool) -> usize {
        let Some(subscribers) = self.subscribers.get_mut(topic) else {
            return 0;
        };
        subscribers.retain(|s| !s.tx.is_closed());
        let mut delivered = 0;
        for subscriber in subscribers.iter().filter(|s| pick(*s)) {
            if subscriber.tx.send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Shared in-memory provider. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a change to subscribers of exactly `topic`.
    pub async fn emit(&self, topic: &str, change: RawChange) -> usize {
        let frame = ProviderFrame::Change(change.clone());
        let mut state = self.inner.lock().await;
        state.deliver(topic, &frame, |s| s.accepts(&change))
    }

    /// Deliver a row change to every topic of `table` whose filter accepts it.
    pub async fn publish(&self, table: &str, change: RawChange) -> usize {
        let frame = ProviderFrame::Change(change.clone());
        let mut state = self.inner.lock().await;
        let topics: Vec<String> = state
            .subscribers
            .keys()
            .filter(|topic| table_of(topic) == table)
            .cloned()
            .collect();
        topics
            .iter()
            .map(|topic| state.deliver(topic, &frame, |s| s.accepts(&change)))
            .sum()
    }

    /// Push a status to every subscriber of `topic`. Anything other than
    /// `Subscribed` also severs those subscriptions.
    pub async fn send_status(&self, topic: &str, status: ProviderStatus) {
        let severs = status != ProviderStatus::Subscribed;
        let frame = ProviderFrame::Status(status);
        let mut state = self.inner.lock().await;
        state.deliver(topic, &frame, |_| true);
        if severs {
            state.subscribers.remove(topic);
        }
    }

    /// Force the outcome of the next subscribe call for `topic`.
    pub async fn script_subscribe(&self, topic: &str, script: ScriptedSubscribe) {
        let mut state = self.inner.lock().await;
        state.scripts.entry(topic.to_string()).or_default().push_back(script);
    }

    /// Number of open physical subscriptions on `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        let state = self.inner.lock().await;
        state
            .subscribers
            .get(topic)
            .map_or(0, |subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
    }

    /// Total subscribe calls ever made for `topic`.
    pub async fn subscribe_calls(&self, topic: &str) -> usize {
        let state = self.inner.lock().await;
        state.subscribe_calls.get(topic).copied().unwrap_or(0)
    }

    /// Presence states currently tracked on `topic`.
    pub async fn presence(&self, topic: &str) -> Vec<PresenceState> {
        let state = self.inner.lock().await;
        state
            .presence
            .get(topic)
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn frame_stream(rx: mpsc::UnboundedReceiver<ProviderFrame>) -> FrameStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|frame| (frame, rx)) }).boxed()
}

#[async_trait]
impl RealtimeProvider for MemoryProvider {
    async fn subscribe(
        &self,
        topic: &str,
        filter: Option<&EventFilter>,
    ) -> Result<FrameStream, ProviderError> {
        let mut state = self.inner.lock().await;
        *state.subscribe_calls.entry(topic.to_string()).or_default() += 1;

        let script = state.scripts.get_mut(topic).and_then(VecDeque::pop_front);
        let (tx, rx) = mpsc::unbounded_channel();
        match script {
            Some(ScriptedSubscribe::Refuse(e)) => return Err(e),
            Some(ScriptedSubscribe::Status(status)) => {
                // Sender dropped right away: the stream ends after the status.
                let _ = tx.send(ProviderFrame::Status(status));
                return Ok(frame_stream(rx));
            }
            None => {}
        }

        let _ = tx.send(ProviderFrame::Status(ProviderStatus::Subscribed));
        if let Some(peers) = state.presence.get(topic).filter(|p| !p.is_empty()) {
            let roster = peers.values().cloned().collect();
            let _ = tx.send(ProviderFrame::Presence(PresenceMessage::Sync(roster)));
        }

        state
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                filter: filter.cloned(),
                tx,
            });
        log::debug!("memory provider: subscribed to {topic}");
        Ok(frame_stream(rx))
    }

    async fn broadcast(&self, topic: &str, event: &str, payload: Vec<u8>) -> Result<(), ProviderError> {
        let frame = ProviderFrame::Broadcast {
            event: event.to_string(),
            payload,
        };
        let mut state = self.inner.lock().await;
        state.deliver(topic, &frame, |_| true);
        Ok(())
    }

    async fn track(&self, topic: &str, presence: PresenceState) -> Result<(), ProviderError> {
        let frame = ProviderFrame::Presence(PresenceMessage::Join(vec![presence.clone()]));
        let mut state = self.inner.lock().await;
        state
            .presence
            .entry(topic.to_string())
            .or_default()
            .insert(presence.peer_id.clone(), presence);
        state.deliver(topic, &frame, |_| true);
        Ok(())
    }

    async fn untrack(&self, topic: &str, peer_id: &str) -> Result<(), ProviderError> {
        let mut state = self.inner.lock().await;
        let removed = state
            .presence
            .get_mut(topic)
            .and_then(|peers| peers.remove(peer_id))
            .is_some();
        if removed {
            let frame = ProviderFrame::Presence(PresenceMessage::Leave(vec![peer_id.to_string()]));
            state.deliver(topic, &frame, |_| true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Record;
    use serde_json::json;
    use uuid::Uuid;

    fn post(id: &str, thread: &str) -> Record {
        let mut record = Record::new();
        record.insert("id".into(), json!(id));
        record.insert("thread_id".into(), json!(thread));
        record
    }

    #[tokio::test]
    async fn test_subscribe_announces_subscribed() {
        let provider = MemoryProvider::new();
        let mut frames = provider.subscribe("posts", None).await.unwrap();

        assert_eq!(
            frames.next().await,
            Some(ProviderFrame::Status(ProviderStatus::Subscribed))
        );
        assert_eq!(provider.subscriber_count("posts").await, 1);
        assert_eq!(provider.subscribe_calls("posts").await, 1);
    }

    #[tokio::test]
    async fn test_publish_respects_filters() {
        let provider = MemoryProvider::new();
        let t1 = EventFilter::eq("thread_id", "t1");
        let t2 = EventFilter::eq("thread_id", "t2");
        let mut first = provider.subscribe("posts:thread_id=eq.t1", Some(&t1)).await.unwrap();
        let mut second = provider.subscribe("posts:thread_id=eq.t2", Some(&t2)).await.unwrap();
        let _ = first.next().await;
        let _ = second.next().await;

        let delivered = provider.publish("posts", RawChange::insert(post("p1", "t1"))).await;
        assert_eq!(delivered, 1);

        match first.next().await {
            Some(ProviderFrame::Change(change)) => assert_eq!(change.entity_id, "p1"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scripted_status_ends_stream() {
        let provider = MemoryProvider::new();
        provider
            .script_subscribe("posts", ScriptedSubscribe::Status(ProviderStatus::TimedOut))
            .await;

        let mut frames = provider.subscribe("posts", None).await.unwrap();
        assert_eq!(frames.next().await, Some(ProviderFrame::Status(ProviderStatus::TimedOut)));
        assert_eq!(frames.next().await, None);

        // Script consumed: the next subscribe succeeds.
        let mut frames = provider.subscribe("posts", None).await.unwrap();
        assert_eq!(
            frames.next().await,
            Some(ProviderFrame::Status(ProviderStatus::Subscribed))
        );
    }

    #[tokio::test]
    async fn test_error_status_severs_subscribers() {
        let provider = MemoryProvider::new();
        let mut frames = provider.subscribe("posts", None).await.unwrap();
        let _ = frames.next().await;

        provider
            .send_status("posts", ProviderStatus::ChannelError("network".into()))
            .await;

        assert_eq!(
            frames.next().await,
            Some(ProviderFrame::Status(ProviderStatus::ChannelError("network".into())))
        );
        assert_eq!(frames.next().await, None);
        assert_eq!(provider.subscriber_count("posts").await, 0);
    }

    #[tokio::test]
    async fn test_track_and_untrack_fan_out() {
        let provider = MemoryProvider::new();
        let mut frames = provider.subscribe("room:t1", None).await.unwrap();
        let _ = frames.next().await;

        let state = PresenceState {
            peer_id: "alice".into(),
            epoch: Uuid::new_v4(),
            metadata: BTreeMap::new(),
            heartbeat: 1,
        };
        provider.track("room:t1", state.clone()).await.unwrap();
        assert_eq!(
            frames.next().await,
            Some(ProviderFrame::Presence(PresenceMessage::Join(vec![state])))
        );

        provider.untrack("room:t1", "alice").await.unwrap();
        assert_eq!(
            frames.next().await,
            Some(ProviderFrame::Presence(PresenceMessage::Leave(vec!["alice".into()])))
        );
        assert!(provider.presence("room:t1").await.is_empty());
    }

    #[tokio::test]
    async fn test_late_subscriber_receives_presence_sync() {
        let provider = MemoryProvider::new();
        let state = PresenceState {
            peer_id: "bob".into(),
            epoch: Uuid::new_v4(),
            metadata: BTreeMap::new(),
            heartbeat: 3,
        };
        provider.track("room:t1", state.clone()).await.unwrap();

        let mut frames = provider.subscribe("room:t1", None).await.unwrap();
        let _ = frames.next().await;
        assert_eq!(
            frames.next().await,
            Some(ProviderFrame::Presence(PresenceMessage::Sync(vec![state])))
        );
    }
}
