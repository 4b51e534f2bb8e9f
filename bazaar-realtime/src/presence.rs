//! Presence: who is currently on a topic.
//!
//! ```text
//! join(topic)
//!     │  track(self) now, then every heartbeat interval
//!     ▼
//! provider ──sync/join/leave──▶ PresenceRoster::handle_message()
//!                                      │
//!                                      ▼
//!                         roster(now) drops peers whose last
//!                         heartbeat is older than the liveness window
//! ```
//!
//! Eviction never waits for an explicit leave; a peer that stops
//! heartbeating disappears once its entry ages out.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{ChannelManager, ChannelMessage, ChannelStatus, SubscriptionHandle, Visibility};
use crate::config::SyncConfig;
use crate::protocol::{PresenceMessage, PresenceState};

/// A peer as seen locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub peer_id: String,
    pub metadata: BTreeMap<String, String>,
    pub last_heartbeat: Instant,
    epoch: Uuid,
    heartbeat: u64,
}

/// Roster state for one topic.
#[derive(Debug, Clone)]
pub struct PresenceRoster {
    entries: HashMap<String, PresenceEntry>,
    liveness: Duration,
}

impl PresenceRoster {
    pub fn new(liveness: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            liveness,
        }
    }

    /// Apply a presence control message received at `now`.
    pub fn handle_message(&mut self, message: &PresenceMessage, now: Instant) {
        match message {
            PresenceMessage::Sync(states) => {
                self.entries
                    .retain(|peer_id, _| states.iter().any(|s| s.peer_id == *peer_id));
                for state in states {
                    self.observe(state, now);
                }
            }
            PresenceMessage::Join(states) => {
                for state in states {
                    self.observe(state, now);
                }
            }
            PresenceMessage::Leave(peer_ids) => {
                for peer_id in peer_ids {
                    self.entries.remove(peer_id);
                }
            }
        }
    }

    /// Only a newer heartbeat counter refreshes the liveness clock, so a
    /// replayed roster cannot keep a dead peer alive. A new epoch means the
    /// peer rejoined and its counter started over.
    fn observe(&mut self, state: &PresenceState, now: Instant) {
        match self.entries.get_mut(&state.peer_id) {
            Some(entry) => {
                entry.metadata = state.metadata.clone();
                if state.epoch != entry.epoch {
                    log::debug!("{} rejoined with a new epoch", state.peer_id);
                    entry.epoch = state.epoch;
                    entry.heartbeat = state.heartbeat;
                    entry.last_heartbeat = now;
                } else if state.heartbeat > entry.heartbeat {
                    entry.heartbeat = state.heartbeat;
                    entry.last_heartbeat = now;
                }
            }
            None => {
                self.entries.insert(
                    state.peer_id.clone(),
                    PresenceEntry {
                        peer_id: state.peer_id.clone(),
                        metadata: state.metadata.clone(),
                        last_heartbeat: now,
                        epoch: state.epoch,
                        heartbeat: state.heartbeat,
                    },
                );
            }
        }
    }

    fn is_live(&self, entry: &PresenceEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_heartbeat) <= self.liveness
    }

    /// Drop expired peers, returning their ids.
    pub fn prune(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| !self.is_live(e, now))
            .map(|e| e.peer_id.clone())
            .collect();
        for peer_id in &expired {
            self.entries.remove(peer_id);
        }
        expired
    }

    /// Live peers ordered by id.
    pub fn roster(&self, now: Instant) -> Vec<PresenceEntry> {
        let mut live: Vec<PresenceEntry> = self
            .entries
            .values()
            .filter(|e| self.is_live(e, now))
            .cloned()
            .collect();
        live.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        live
    }

    pub fn is_present(&self, peer_id: &str, now: Instant) -> bool {
        self.entries.get(peer_id).is_some_and(|e| self.is_live(e, now))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct PresenceRoom {
    self_id: String,
    roster: Arc<Mutex<PresenceRoster>>,
    handle: SubscriptionHandle,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Joins topics, heartbeats on them and keeps their rosters.
pub struct PresenceTracker {
    channels: ChannelManager,
    heartbeat: Duration,
    liveness: Duration,
    rooms: Mutex<HashMap<String, PresenceRoom>>,
    shutdown: CancellationToken,
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl PresenceTracker {
    pub fn new(channels: ChannelManager, config: &SyncConfig) -> Self {
        Self {
            channels,
            heartbeat: config.presence_heartbeat,
            liveness: config.presence_liveness,
            rooms: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Announce `self_id` on `topic` and start tracking the roster.
    /// Joining a topic again replaces the previous membership.
    pub async fn join(&self, topic: &str, self_id: &str, metadata: BTreeMap<String, String>) {
        self.leave(topic).await;

        let subscription = self.channels.subscribe(topic, None).await;
        let roster = Arc::new(Mutex::new(PresenceRoster::new(self.liveness)));
        let token = self.shutdown.child_token();
        let kick = Arc::new(Notify::new());

        let pump = tokio::spawn(pump_presence(
            subscription.events,
            roster.clone(),
            kick.clone(),
            token.clone(),
        ));
        let heartbeat = tokio::spawn(run_heartbeat(
            self.channels.clone(),
            topic.to_string(),
            self_id.to_string(),
            metadata,
            self.heartbeat,
            roster.clone(),
            kick,
            token.clone(),
        ));

        log::debug!("{topic}: joined presence as {self_id}");
        self.rooms.lock().await.insert(
            topic.to_string(),
            PresenceRoom {
                self_id: self_id.to_string(),
                roster,
                handle: subscription.handle,
                token,
                tasks: vec![pump, heartbeat],
            },
        );
    }

    /// Withdraw from `topic` and forget its roster.
    pub async fn leave(&self, topic: &str) {
        let Some(room) = self.rooms.lock().await.remove(topic) else {
            return;
        };
        room.token.cancel();
        for task in room.tasks {
            let _ = task.await;
        }
        if let Err(e) = self.channels.provider().untrack(topic, &room.self_id).await {
            log::warn!("{topic}: untrack failed: {e}");
        }
        self.channels.unsubscribe(&room.handle).await;
        log::debug!("{topic}: left presence");
    }

    /// Live peers on `topic`, including this client.
    pub async fn roster(&self, topic: &str) -> Vec<PresenceEntry> {
        let roster = {
            let rooms = self.rooms.lock().await;
            match rooms.get(topic) {
                Some(room) => room.roster.clone(),
                None => return Vec::new(),
            }
        };
        let mut roster = roster.lock().await;
        let now = Instant::now();
        roster.prune(now);
        roster.roster(now)
    }

    pub async fn leave_all(&self) {
        let topics: Vec<String> = self.rooms.lock().await.keys().cloned().collect();
        for topic in topics {
            self.leave(&topic).await;
        }
    }
}

async fn pump_presence(
    mut events: tokio::sync::mpsc::UnboundedReceiver<ChannelMessage>,
    roster: Arc<Mutex<PresenceRoster>>,
    kick: Arc<Notify>,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            message = events.recv() => message,
        };
        match message {
            Some(ChannelMessage::Presence(message)) => {
                roster.lock().await.handle_message(&message, Instant::now());
            }
            // Re-announce as soon as a (re)subscription lands.
            Some(ChannelMessage::Status(ChannelStatus::Subscribed)) => kick.notify_one(),
            Some(_) => {}
            None => return,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_heartbeat(
    channels: ChannelManager,
    topic: String,
    self_id: String,
    metadata: BTreeMap<String, String>,
    period: Duration,
    roster: Arc<Mutex<PresenceRoster>>,
    kick: Arc<Notify>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    let epoch = Uuid::new_v4();
    let mut beat: u64 = 0;
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
            _ = kick.notified() => {}
        }

        let expired = roster.lock().await.prune(Instant::now());
        if !expired.is_empty() {
            log::debug!("{topic}: evicted {expired:?}");
        }

        if channels.visibility().await == Visibility::Hidden {
            continue;
        }
        beat += 1;
        let state = PresenceState {
            peer_id: self_id.clone(),
            epoch,
            metadata: metadata.clone(),
            heartbeat: beat,
        };
        if let Err(e) = channels.provider().track(&topic, state).await {
            log::warn!("{topic}: presence heartbeat failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;

    fn state(peer: &str, heartbeat: u64) -> PresenceState {
        state_in(Uuid::nil(), peer, heartbeat)
    }

    fn state_in(epoch: Uuid, peer: &str, heartbeat: u64) -> PresenceState {
        PresenceState {
            peer_id: peer.into(),
            epoch,
            metadata: BTreeMap::from([("name".to_string(), peer.to_uppercase())]),
            heartbeat,
        }
    }

    fn ids(entries: &[PresenceEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.peer_id.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_join_leave() {
        let mut roster = PresenceRoster::new(Duration::from_secs(30));
        let now = Instant::now();

        roster.handle_message(&PresenceMessage::Sync(vec![state("a", 1), state("b", 1)]), now);
        roster.handle_message(&PresenceMessage::Join(vec![state("c", 1)]), now);
        roster.handle_message(&PresenceMessage::Leave(vec!["a".into()]), now);
        assert_eq!(ids(&roster.roster(now)), vec!["b", "c"]);

        // A sync replaces the roster wholesale.
        roster.handle_message(&PresenceMessage::Sync(vec![state("c", 1)]), now);
        assert_eq!(ids(&roster.roster(now)), vec!["c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_peer_evicted_without_leave() {
        let mut roster = PresenceRoster::new(Duration::from_secs(30));
        let t0 = Instant::now();
        roster.handle_message(&PresenceMessage::Join(vec![state("a", 1), state("b", 1)]), t0);

        let t1 = t0 + Duration::from_secs(20);
        roster.handle_message(&PresenceMessage::Join(vec![state("a", 2)]), t1);

        let t2 = t0 + Duration::from_secs(31);
        assert_eq!(ids(&roster.roster(t2)), vec!["a"]);
        assert!(!roster.is_present("b", t2));
        assert_eq!(roster.prune(t2), vec!["b".to_string()]);
        assert_eq!(roster.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_heartbeat_does_not_refresh() {
        let mut roster = PresenceRoster::new(Duration::from_secs(30));
        let t0 = Instant::now();
        roster.handle_message(&PresenceMessage::Join(vec![state("a", 5)]), t0);
        roster.handle_message(
            &PresenceMessage::Sync(vec![state("a", 5)]),
            t0 + Duration::from_secs(25),
        );
        assert!(!roster.is_present("a", t0 + Duration::from_secs(31)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoined_peer_stays_live_with_restarted_counter() {
        let mut roster = PresenceRoster::new(Duration::from_secs(30));
        let t0 = Instant::now();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        roster.handle_message(&PresenceMessage::Join(vec![state_in(first, "bob", 11)]), t0);

        // Bob reloads without leaving; his new tracker counts from 1 again.
        for (beat, secs) in [(1, 5), (2, 15), (3, 25), (4, 35)] {
            roster.handle_message(
                &PresenceMessage::Join(vec![state_in(second, "bob", beat)]),
                t0 + Duration::from_secs(secs),
            );
        }
        assert!(roster.is_present("bob", t0 + Duration::from_secs(40)));
        assert!(roster.prune(t0 + Duration::from_secs(40)).is_empty());

        // Within one epoch a replayed lower counter still does not refresh.
        roster.handle_message(
            &PresenceMessage::Join(vec![state_in(second, "bob", 2)]),
            t0 + Duration::from_secs(60),
        );
        assert!(!roster.is_present("bob", t0 + Duration::from_secs(66)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_rejoin_after_dropped_session() {
        let provider = MemoryProvider::new();
        let config = SyncConfig::default();
        let alice = PresenceTracker::new(ChannelManager::new(Arc::new(provider.clone()), &config), &config);
        alice.join("room:t1", "alice", BTreeMap::new()).await;

        let bob1 = PresenceTracker::new(ChannelManager::new(Arc::new(provider.clone()), &config), &config);
        bob1.join("room:t1", "bob", BTreeMap::new()).await;
        tokio::time::sleep(Duration::from_secs(105)).await;

        // Dropped without a leave; a fresh tracker takes over straight away.
        drop(bob1);
        let bob2 = PresenceTracker::new(ChannelManager::new(Arc::new(provider.clone()), &config), &config);
        bob2.join("room:t1", "bob", BTreeMap::new()).await;

        for _ in 0..60 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(ids(&alice.roster("room:t1").await), vec!["alice", "bob"]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_ages_out_of_tracker() {
        let provider = MemoryProvider::new();
        let config = SyncConfig::default();
        let alice_channels = ChannelManager::new(Arc::new(provider.clone()), &config);
        let bob_channels = ChannelManager::new(Arc::new(provider.clone()), &config);
        let alice = PresenceTracker::new(alice_channels, &config);
        let bob = PresenceTracker::new(bob_channels.clone(), &config);

        alice.join("room:t1", "alice", BTreeMap::new()).await;
        bob.join("room:t1", "bob", BTreeMap::new()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(ids(&alice.roster("room:t1").await), vec!["alice", "bob"]);
        assert_eq!(ids(&bob.roster("room:t1").await), vec!["alice", "bob"]);

        // Bob's page goes to the background: no more heartbeats, no leave.
        bob_channels.set_visibility(Visibility::Hidden).await;
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(ids(&alice.roster("room:t1").await), vec!["alice"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_untracks() {
        let provider = MemoryProvider::new();
        let config = SyncConfig::default();
        let alice = PresenceTracker::new(ChannelManager::new(Arc::new(provider.clone()), &config), &config);
        let bob = PresenceTracker::new(ChannelManager::new(Arc::new(provider.clone()), &config), &config);

        alice.join("room:t1", "alice", BTreeMap::new()).await;
        bob.join("room:t1", "bob", BTreeMap::new()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        alice.leave("room:t1").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(ids(&bob.roster("room:t1").await), vec!["bob"]);
        assert!(alice.roster("room:t1").await.is_empty());
        assert_eq!(provider.presence("room:t1").await.len(), 1);
        assert_eq!(provider.subscriber_count("room:t1").await, 1);
    }
}
