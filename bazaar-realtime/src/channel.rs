//! Channel manager: one physical subscription per topic, shared by any
//! number of logical subscribers.
//!
//! ## Lifecycle
//!
//! ```text
//!              subscribe (visible)
//!   Idle ─────────────────────────▶ Connecting ──handshake──▶ Subscribed
//!    ▲                                 ▲   │                      │
//!    │ hidden                          │   │ refused / error      │ channel_error
//!    │                        backoff  │   ▼                      │ stream end
//!    └──────────── any ◀───────────────┴─ Error ◀─────────────────┘
//!                                          │ timed_out: no delay
//!                                          ▼ retries exhausted
//!                                        Closed
//! ```
//!
//! Every reconnect re-issues the full subscription; nothing assumes the
//! feed was gap-free. Connection failures are logged and retried, never
//! returned to subscribers as errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::config::SyncConfig;
use crate::protocol::{ChangeEvent, EventFilter, PresenceMessage, ProviderFrame, ProviderStatus};
use crate::provider::{FrameStream, RealtimeProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
    Idle,
    Connecting,
    Subscribed,
    Error,
    Closed,
}

/// Host page visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// What a logical subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Status(ChannelStatus),
    Change(ChangeEvent),
    Broadcast { event: String, payload: Vec<u8> },
    Presence(PresenceMessage),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub topic: String,
}

/// A logical subscription: a handle for `unsubscribe` and the message queue.
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::UnboundedReceiver<ChannelMessage>,
}

/// Per-topic state shared between the manager and the connection task.
struct Fanout {
    topic: String,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<ChannelMessage>>>,
    status: watch::Sender<ChannelStatus>,
    retries: AtomicU32,
    sequence: AtomicU64,
}

impl Fanout {
    fn new(topic: &str) -> Self {
        let (status, _) = watch::channel(ChannelStatus::Idle);
        Self {
            topic: topic.to_string(),
            subscribers: Mutex::new(HashMap::new()),
            status,
            retries: AtomicU32::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    fn current(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    /// Register a subscriber and hand it the current status. Holding the
    /// subscriber lock keeps this atomic with `set_status`.
    async fn join(&self, id: u64, tx: mpsc::UnboundedSender<ChannelMessage>) {
        let mut subscribers = self.subscribers.lock().await;
        let status = self.current();
        if status != ChannelStatus::Idle {
            let _ = tx.send(ChannelMessage::Status(status));
        }
        subscribers.insert(id, tx);
    }

    /// Returns the number of subscribers left.
    async fn leave(&self, id: u64) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.remove(&id);
        subscribers.len()
    }

    async fn set_status(&self, status: ChannelStatus) {
        let mut subscribers = self.subscribers.lock().await;
        if self.status.send_replace(status) != status {
            log::debug!("{}: {status:?}", self.topic);
            subscribers.retain(|_, tx| tx.send(ChannelMessage::Status(status)).is_ok());
        }
    }

    async fn send(&self, message: ChannelMessage) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|_, tx| tx.send(message.clone()).is_ok());
    }
}

struct ChannelTask {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl ChannelTask {
    async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            log::warn!("channel task ended abnormally: {e}");
        }
    }
}

struct Channel {
    filter: Option<EventFilter>,
    fanout: Arc<Fanout>,
    task: Option<ChannelTask>,
}

impl Channel {
    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.join.is_finished())
    }
}

struct ManagerState {
    channels: HashMap<String, Channel>,
    visibility: Visibility,
}

struct ManagerInner {
    provider: Arc<dyn RealtimeProvider>,
    backoff: BackoffPolicy,
    max_retries: Option<u32>,
    state: Mutex<ManagerState>,
    next_id: AtomicU64,
    /// Parent of every channel task token.
    root: CancellationToken,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

/// Shared channel manager. Clones refer to the same channels.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<ManagerInner>,
}

impl ChannelManager {
    pub fn new(provider: Arc<dyn RealtimeProvider>, config: &SyncConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                provider,
                backoff: config.backoff,
                max_retries: config.max_retries,
                state: Mutex::new(ManagerState {
                    channels: HashMap::new(),
                    visibility: Visibility::Visible,
                }),
                next_id: AtomicU64::new(1),
                root: CancellationToken::new(),
            }),
        }
    }

    pub fn provider(&self) -> &Arc<dyn RealtimeProvider> {
        &self.inner.provider
    }

    /// Attach a logical subscriber to `topic`, opening the physical channel
    /// if this is the first one. `filter` only applies when the channel is
    /// created; later subscribers share the existing one.
    pub async fn subscribe(&self, topic: &str, filter: Option<EventFilter>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, events) = mpsc::unbounded_channel();

        let mut state = self.inner.state.lock().await;
        let visible = state.visibility == Visibility::Visible;
        let channel = state
            .channels
            .entry(topic.to_string())
            .or_insert_with(|| Channel {
                filter: filter.clone(),
                fanout: Arc::new(Fanout::new(topic)),
                task: None,
            });
        if channel.filter != filter {
            log::debug!("{topic}: sharing channel created with filter {:?}", channel.filter);
        }

        channel.fanout.join(id, tx).await;
        if visible && !channel.is_running() {
            channel.task = Some(self.spawn(channel));
        }

        Subscription {
            handle: SubscriptionHandle {
                id,
                topic: topic.to_string(),
            },
            events,
        }
    }

    /// Detach a subscriber. The last one out tears the channel down.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut state = self.inner.state.lock().await;
        let Some(channel) = state.channels.get(&handle.topic) else {
            return;
        };
        if channel.fanout.leave(handle.id).await > 0 {
            return;
        }
        if let Some(mut channel) = state.channels.remove(&handle.topic) {
            if let Some(task) = channel.task.take() {
                task.stop().await;
            }
            channel.fanout.set_status(ChannelStatus::Closed).await;
            log::debug!("{}: last subscriber left, channel closed", handle.topic);
        }
    }

    /// Pause every channel when the host is hidden; resubscribe when it
    /// becomes visible again.
    pub async fn set_visibility(&self, visibility: Visibility) {
        let mut state = self.inner.state.lock().await;
        if state.visibility == visibility {
            return;
        }
        state.visibility = visibility;

        match visibility {
            Visibility::Hidden => {
                log::info!("host hidden, pausing {} channels", state.channels.len());
                for channel in state.channels.values_mut() {
                    if let Some(task) = channel.task.take() {
                        task.stop().await;
                    }
                    channel.fanout.set_status(ChannelStatus::Idle).await;
                }
            }
            Visibility::Visible => {
                log::info!("host visible, resuming {} channels", state.channels.len());
                for channel in state.channels.values_mut() {
                    if !channel.is_running() {
                        channel.task = Some(self.spawn(channel));
                    }
                }
            }
        }
    }

    pub async fn visibility(&self) -> Visibility {
        self.inner.state.lock().await.visibility
    }

    pub async fn status(&self, topic: &str) -> Option<ChannelStatus> {
        let state = self.inner.state.lock().await;
        state.channels.get(topic).map(|c| c.fanout.current())
    }

    /// Consecutive failed attempts since the last successful handshake.
    pub async fn retry_count(&self, topic: &str) -> Option<u32> {
        let state = self.inner.state.lock().await;
        state
            .channels
            .get(topic)
            .map(|c| c.fanout.retries.load(Ordering::Relaxed))
    }

    /// Close every channel and drop all subscribers.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        for (_, mut channel) in state.channels.drain() {
            if let Some(task) = channel.task.take() {
                task.stop().await;
            }
            channel.fanout.set_status(ChannelStatus::Closed).await;
            channel.fanout.subscribers.lock().await.clear();
        }
    }

    fn spawn(&self, channel: &Channel) -> ChannelTask {
        let token = self.inner.root.child_token();
        channel.fanout.retries.store(0, Ordering::Relaxed);
        let join = tokio::spawn(run_channel(
            self.inner.provider.clone(),
            channel.fanout.clone(),
            channel.filter.clone(),
            self.inner.backoff,
            self.inner.max_retries,
            token.clone(),
        ));
        ChannelTask { token, join }
    }
}

enum PumpEnd {
    Cancelled,
    TimedOut,
    Failed(String),
}

/// Connect, pump, and reconnect until cancelled or out of retries.
async fn run_channel(
    provider: Arc<dyn RealtimeProvider>,
    fanout: Arc<Fanout>,
    filter: Option<EventFilter>,
    backoff: BackoffPolicy,
    max_retries: Option<u32>,
    token: CancellationToken,
) {
    let topic = fanout.topic.clone();
    loop {
        fanout.set_status(ChannelStatus::Connecting).await;

        let attempt = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            result = provider.subscribe(&topic, filter.as_ref()) => result,
        };
        let end = match attempt {
            Ok(stream) => pump(&fanout, stream, &token).await,
            Err(e) => PumpEnd::Failed(e.to_string()),
        };

        let retry = fanout.retries.fetch_add(1, Ordering::Relaxed) + 1;
        let reason = match end {
            PumpEnd::Cancelled => return,
            PumpEnd::TimedOut => None,
            PumpEnd::Failed(reason) => Some(reason),
        };

        if max_retries.is_some_and(|max| retry > max) {
            log::warn!("{topic}: giving up after {} failed attempts", retry - 1);
            fanout.set_status(ChannelStatus::Closed).await;
            return;
        }
        fanout.set_status(ChannelStatus::Error).await;

        match reason {
            None => {
                log::warn!("{topic}: subscription timed out, retrying immediately (attempt {retry})");
            }
            Some(reason) => {
                let delay = backoff.delay_for(retry);
                log::warn!("{topic}: channel error: {reason}");
                log::info!("{topic}: reconnecting in {delay:?} (attempt {retry})");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Forward frames of one physical subscription until it ends.
async fn pump(fanout: &Fanout, mut stream: FrameStream, token: &CancellationToken) -> PumpEnd {
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => return PumpEnd::Cancelled,
            frame = stream.next() => frame,
        };
        let Some(frame) = frame else {
            return PumpEnd::Failed("stream ended".into());
        };

        match frame {
            ProviderFrame::Status(ProviderStatus::Subscribed) => {
                fanout.retries.store(0, Ordering::Relaxed);
                fanout.set_status(ChannelStatus::Subscribed).await;
            }
            ProviderFrame::Status(ProviderStatus::ChannelError(reason)) => {
                return PumpEnd::Failed(reason);
            }
            ProviderFrame::Status(ProviderStatus::TimedOut) => return PumpEnd::TimedOut,
            ProviderFrame::Status(ProviderStatus::Closed) => {
                return PumpEnd::Failed("closed by provider".into());
            }
            ProviderFrame::Change(raw) => {
                let sequence = fanout.sequence.fetch_add(1, Ordering::Relaxed) + 1;
                let event = ChangeEvent::from_raw(raw, fanout.topic.as_str(), sequence);
                fanout.send(ChannelMessage::Change(event)).await;
            }
            ProviderFrame::Broadcast { event, payload } => {
                fanout.send(ChannelMessage::Broadcast { event, payload }).await;
            }
            ProviderFrame::Presence(message) => {
                fanout.send(ChannelMessage::Presence(message)).await;
            }
        }
    }
}
