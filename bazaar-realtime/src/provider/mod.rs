//! Realtime change-feed providers.
//!
//! A provider turns a topic subscription into a stream of
//! [`ProviderFrame`]s and carries the ephemeral signals (broadcast,
//! presence) the other way. Dropping the returned stream ends the
//! subscription.
//!
//! - [`memory`] — in-process provider, used by tests and the console
//! - [`ws`] — websocket transport speaking the [`Frame`](crate::protocol::Frame) envelope

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::ProviderError;
use crate::protocol::{EventFilter, PresenceState, ProviderFrame};

pub mod memory;
pub mod ws;

pub use memory::MemoryProvider;
pub use ws::WsProvider;

/// Frames of one physical subscription.
pub type FrameStream = BoxStream<'static, ProviderFrame>;

#[async_trait]
pub trait RealtimeProvider: Send + Sync + 'static {
    /// Open a subscription. The first status frame tells whether the
    /// handshake succeeded.
    async fn subscribe(
        &self,
        topic: &str,
        filter: Option<&EventFilter>,
    ) -> Result<FrameStream, ProviderError>;

    /// Send an ephemeral event to every subscriber of `topic`.
    async fn broadcast(&self, topic: &str, event: &str, payload: Vec<u8>)
        -> Result<(), ProviderError>;

    /// Announce or refresh this peer's presence on `topic`.
    async fn track(&self, topic: &str, state: PresenceState) -> Result<(), ProviderError>;

    /// Withdraw this peer's presence from `topic`.
    async fn untrack(&self, topic: &str, peer_id: &str) -> Result<(), ProviderError>;
}
