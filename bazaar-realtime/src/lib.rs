//! # bazaar-realtime — Realtime state sync for marketplace threads
//!
//! Keeps a client's view of posts, reactions and matches in step with the
//! server, with optimistic writes, presence and typing indicators.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  subscribe/frames  ┌──────────────────┐
//! │ Channel      │ ◄────────────────► │ RealtimeProvider │
//! │ Manager      │  reconnect+backoff │ (memory | ws)    │
//! └──────┬───────┘                    └──────────────────┘
//!        │ ChannelMessage
//!        ▼
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ Change       │    │ Presence     │    │ Typing       │
//! │ Dispatcher   │    │ Tracker      │    │ Service      │
//! └──────┬───────┘    └──────────────┘    └──────────────┘
//!        ▼
//! ┌──────────────┐ ◄── optimistic patch / rollback ──┐
//! │ Local        │                            ┌──────┴───────┐
//! │ Collection   │                            │ Mutation     │──▶ Backend
//! └──────────────┘                            │ Controller   │
//!                                             └──────────────┘
//! ```
//!
//! [`SyncSession`] wires all of it for one viewer on one thread.
//!
//! ## Modules
//!
//! - [`protocol`] — records, change events, filters, the websocket `Frame`
//! - [`channel`] — shared subscriptions with reconnect and visibility
//! - [`dispatcher`] / [`collection`] — change events into ordered local state
//! - [`mutation`] — optimistic writes with supersession and rollback
//! - [`presence`] — heartbeat-based rosters
//! - [`typing`] — throttled typing signals with TTL expiry
//! - [`reactions`] — per-post reaction counts
//! - [`session`] — the UI-facing facade
//! - [`telemetry`] — user-visible error reporting

pub mod backend;
pub mod backoff;
pub mod channel;
pub mod collection;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod mutation;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod reactions;
pub mod session;
pub mod telemetry;
pub mod typing;

// Re-exports for convenience
pub use backend::{Backend, MemoryBackend, SnapshotQuery, WriteOp, WriteRequest};
pub use backoff::BackoffPolicy;
pub use channel::{ChannelManager, ChannelMessage, ChannelStatus, Subscription, SubscriptionHandle, Visibility};
pub use collection::{CollectionItem, CollectionPatch, LocalCollection, SharedCollection};
pub use config::SyncConfig;
pub use dispatcher::{Binding, ChangeDispatcher, CollectionChange};
pub use error::{BackendError, ProviderError, SyncError};
pub use mutation::{MutationController, MutationHandle, MutationOutcome, Optimistic};
pub use presence::{PresenceEntry, PresenceRoster, PresenceTracker};
pub use protocol::{
    ChangeEvent, ChangeKind, EventFilter, Frame, FrameKind, PresenceMessage, PresenceState,
    ProtocolError, ProviderFrame, ProviderStatus, RawChange, Record, TypingPayload, Viewer,
};
pub use provider::{MemoryProvider, RealtimeProvider, WsProvider};
pub use reactions::{ReactionAggregate, ReactionAggregator, ReactionPatch, ReactionRow};
pub use session::{MutationReceipt, SessionOptions, SyncSession};
pub use telemetry::{ErrorReport, ErrorReporter};
pub use typing::{typing_text, TypingRoom, TypingService, TypingSession, TypingSignal};
