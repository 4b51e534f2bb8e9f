//! "Someone is typing" indicators.
//!
//! Send side: a start signal goes out at most once per throttle window
//! while keys are being pressed; after the idle window without a keystroke
//! an explicit stop is sent.
//!
//! Receive side: each start (re)arms a session that expires after the TTL.
//! A periodic sweep drops expired sessions whether or not a stop ever
//! arrives, which covers peers that disconnect mid-sentence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelManager, ChannelMessage, SubscriptionHandle};
use crate::config::SyncConfig;
use crate::protocol::{TypingPayload, Viewer, TYPING_EVENT};

/// Outgoing signal decided by [`TypingRoom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

/// A remote peer currently typing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSession {
    pub user_id: String,
    pub display_name: String,
    /// Time of the latest start signal.
    pub started_at: Instant,
    pub expires_at: Instant,
}

/// Typing state of one topic, local and remote.
#[derive(Debug, Clone)]
pub struct TypingRoom {
    self_id: String,
    throttle: Duration,
    idle_stop: Duration,
    ttl: Duration,
    last_start_sent: Option<Instant>,
    last_keystroke: Option<Instant>,
    typing: bool,
    sessions: HashMap<String, TypingSession>,
}

impl TypingRoom {
    pub fn new(self_id: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            self_id: self_id.into(),
            throttle: config.typing_throttle,
            idle_stop: config.typing_idle_stop,
            ttl: config.typing_ttl,
            last_start_sent: None,
            last_keystroke: None,
            typing: false,
            sessions: HashMap::new(),
        }
    }

    /// Record a local keystroke. Returns `Start` when a broadcast is due.
    pub fn on_keystroke(&mut self, now: Instant) -> Option<TypingSignal> {
        self.last_keystroke = Some(now);
        let due = self
            .last_start_sent
            .map_or(true, |sent| now.saturating_duration_since(sent) >= self.throttle);
        if !due {
            return None;
        }
        self.last_start_sent = Some(now);
        self.typing = true;
        Some(TypingSignal::Start)
    }

    /// When the local idle stop fires, if the user is typing.
    pub fn idle_deadline(&self) -> Option<Instant> {
        if !self.typing {
            return None;
        }
        self.last_keystroke.map(|at| at + self.idle_stop)
    }

    pub fn poll_idle(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.idle_deadline() {
            Some(deadline) if now >= deadline => self.stop(),
            _ => None,
        }
    }

    /// Explicit stop (message sent, composer cleared).
    pub fn stop(&mut self) -> Option<TypingSignal> {
        if !self.typing {
            return None;
        }
        self.typing = false;
        self.last_start_sent = None;
        Some(TypingSignal::Stop)
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    /// Apply a remote start/stop. Signals from ourselves are ignored.
    pub fn handle_remote(&mut self, payload: &TypingPayload, now: Instant) -> bool {
        if payload.user_id == self.self_id {
            return false;
        }
        if payload.typing {
            self.sessions.insert(
                payload.user_id.clone(),
                TypingSession {
                    user_id: payload.user_id.clone(),
                    display_name: payload.display_name.clone(),
                    started_at: now,
                    expires_at: now + self.ttl,
                },
            );
            true
        } else {
            self.sessions.remove(&payload.user_id).is_some()
        }
    }

    /// Drop sessions whose age reached the TTL.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| now >= s.expires_at)
            .map(|s| s.user_id.clone())
            .collect();
        for user_id in &expired {
            self.sessions.remove(user_id);
        }
        expired
    }

    /// Unexpired typers, ordered by display name.
    pub fn active_typers(&self, now: Instant) -> Vec<TypingSession> {
        let mut active: Vec<TypingSession> = self
            .sessions
            .values()
            .filter(|s| now < s.expires_at)
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        active
    }
}

/// Human-readable typing line for a list of names.
pub fn typing_text(names: &[&str]) -> String {
    match names {
        [] => String::new(),
        [one] => format!("{one} is typing…"),
        [a, b] => format!("{a} and {b} are typing…"),
        [first, rest @ ..] => format!("{first} and {} others are typing…", rest.len()),
    }
}

struct TypingHandle {
    identity: Viewer,
    room: Arc<Mutex<TypingRoom>>,
    subscription: SubscriptionHandle,
    wake: Arc<Notify>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Runs typing rooms on top of the channel manager.
pub struct TypingService {
    channels: ChannelManager,
    config: SyncConfig,
    rooms: Mutex<HashMap<String, TypingHandle>>,
    shutdown: CancellationToken,
}

impl Drop for TypingService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl TypingService {
    pub fn new(channels: ChannelManager, config: &SyncConfig) -> Self {
        Self {
            channels,
            config: config.clone(),
            rooms: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start receiving typing signals on `topic`.
    pub async fn attach(&self, topic: &str, identity: &Viewer) {
        let mut rooms = self.rooms.lock().await;
        if rooms.contains_key(topic) {
            return;
        }

        let subscription = self.channels.subscribe(topic, None).await;
        let room = Arc::new(Mutex::new(TypingRoom::new(identity.id.clone(), &self.config)));
        let wake = Arc::new(Notify::new());
        let token = self.shutdown.child_token();

        let tasks = vec![
            tokio::spawn(pump_typing(subscription.events, room.clone(), token.clone())),
            tokio::spawn(run_sweep(room.clone(), self.config.typing_sweep, token.clone())),
            tokio::spawn(run_idle_stop(
                self.channels.clone(),
                topic.to_string(),
                identity.clone(),
                room.clone(),
                wake.clone(),
                token.clone(),
            )),
        ];

        log::debug!("{topic}: typing attached for {}", identity.id);
        rooms.insert(
            topic.to_string(),
            TypingHandle {
                identity: identity.clone(),
                room,
                subscription: subscription.handle,
                wake,
                token,
                tasks,
            },
        );
    }

    /// Stop sending and receiving on `topic`. A pending stop goes out first.
    pub async fn detach(&self, topic: &str) {
        let Some(handle) = self.rooms.lock().await.remove(topic) else {
            return;
        };
        handle.token.cancel();
        for task in handle.tasks {
            let _ = task.await;
        }
        let signal = handle.room.lock().await.stop();
        if let Some(signal) = signal {
            send_signal(&self.channels, topic, &handle.identity, signal).await;
        }
        self.channels.unsubscribe(&handle.subscription).await;
    }

    pub async fn detach_all(&self) {
        let topics: Vec<String> = self.rooms.lock().await.keys().cloned().collect();
        for topic in topics {
            self.detach(&topic).await;
        }
    }

    /// Register a keystroke by `identity` on `topic`, broadcasting a start
    /// when the throttle allows. Returns whether a start was sent.
    pub async fn notify_typing(&self, topic: &str, identity: &Viewer) -> bool {
        self.attach(topic, identity).await;
        let (room, wake) = match self.rooms.lock().await.get(topic) {
            Some(handle) => (handle.room.clone(), handle.wake.clone()),
            None => return false,
        };

        let signal = room.lock().await.on_keystroke(Instant::now());
        // Idle deadline moved.
        wake.notify_one();
        match signal {
            Some(signal) => {
                send_signal(&self.channels, topic, identity, signal).await;
                true
            }
            None => false,
        }
    }

    /// Composer hook for every text change. Clearing the text stops typing.
    pub async fn on_typing_text_change(&self, topic: &str, identity: &Viewer, text: &str) {
        if text.is_empty() {
            self.stop_typing(topic).await;
        } else {
            self.notify_typing(topic, identity).await;
        }
    }

    /// Send an explicit stop if the local user is typing.
    pub async fn stop_typing(&self, topic: &str) {
        let Some((room, identity, wake)) = self
            .rooms
            .lock()
            .await
            .get(topic)
            .map(|h| (h.room.clone(), h.identity.clone(), h.wake.clone()))
        else {
            return;
        };
        let signal = room.lock().await.stop();
        wake.notify_one();
        if let Some(signal) = signal {
            send_signal(&self.channels, topic, &identity, signal).await;
        }
    }

    pub async fn active_typers(&self, topic: &str) -> Vec<TypingSession> {
        let room = match self.rooms.lock().await.get(topic) {
            Some(handle) => handle.room.clone(),
            None => return Vec::new(),
        };
        let typers = room.lock().await.active_typers(Instant::now());
        typers
    }

    pub async fn typing_text(&self, topic: &str) -> String {
        let typers = self.active_typers(topic).await;
        let names: Vec<&str> = typers.iter().map(|s| s.display_name.as_str()).collect();
        typing_text(&names)
    }
}

async fn send_signal(channels: &ChannelManager, topic: &str, identity: &Viewer, signal: TypingSignal) {
    let payload = TypingPayload {
        user_id: identity.id.clone(),
        display_name: identity.display_name.clone(),
        typing: signal == TypingSignal::Start,
    };
    let bytes = match payload.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("{topic}: cannot encode typing signal: {e}");
            return;
        }
    };
    if let Err(e) = channels.provider().broadcast(topic, TYPING_EVENT, bytes).await {
        log::warn!("{topic}: typing {signal:?} not sent: {e}");
    }
}

async fn pump_typing(
    mut events: mpsc::UnboundedReceiver<ChannelMessage>,
    room: Arc<Mutex<TypingRoom>>,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            message = events.recv() => message,
        };
        match message {
            Some(ChannelMessage::Broadcast { event, payload }) if event == TYPING_EVENT => {
                match TypingPayload::decode(&payload) {
                    Ok(payload) => {
                        room.lock().await.handle_remote(&payload, Instant::now());
                    }
                    Err(e) => log::debug!("dropping malformed typing payload: {e}"),
                }
            }
            Some(_) => {}
            None => return,
        }
    }
}

async fn run_sweep(room: Arc<Mutex<TypingRoom>>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let expired = room.lock().await.sweep(Instant::now());
        if !expired.is_empty() {
            log::trace!("typing sessions expired: {expired:?}");
        }
    }
}

async fn run_idle_stop(
    channels: ChannelManager,
    topic: String,
    identity: Viewer,
    room: Arc<Mutex<TypingRoom>>,
    wake: Arc<Notify>,
    token: CancellationToken,
) {
    loop {
        let deadline = room.lock().await.idle_deadline();
        let idle = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = wake.notified() => continue,
            _ = idle => {}
        }

        let signal = room.lock().await.poll_idle(Instant::now());
        if let Some(signal) = signal {
            log::debug!("{topic}: idle, sending typing stop");
            send_signal(&channels, &topic, &identity, signal).await;
        }
    }
}
