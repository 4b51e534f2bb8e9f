//! WebSocket provider.
//!
//! Every subscription gets its own socket: the client sends a
//! `Subscribe` frame and the server answers with a status frame followed
//! by changes, broadcasts and presence for that topic. Dropping the frame
//! stream drops the socket, which is the unsubscribe.
//!
//! Outgoing ephemeral traffic (broadcast, track, untrack) shares one
//! control socket that is opened lazily and replaced when a send fails.

use async_trait::async_trait;
use futures_util::stream::{self, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{FrameStream, RealtimeProvider};
use crate::error::ProviderError;
use crate::protocol::{EventFilter, Frame, PresenceState, ProviderFrame, ProviderStatus};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

pub struct WsProvider {
    url: String,
    control: Mutex<Option<WsSink>>,
}

impl WsProvider {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            control: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<WsStream, ProviderError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        Ok(ws)
    }

    /// Send on the control socket, reconnecting once if the cached
    /// socket turned out to be dead.
    async fn send_control(&self, frame: Frame) -> Result<(), ProviderError> {
        let bytes = frame.encode()?;
        let mut control = self.control.lock().await;

        for _ in 0..2 {
            if control.is_none() {
                let (sink, reader) = self.connect().await?.split();
                tokio::spawn(drain_control(reader));
                *control = Some(sink);
            }
            if let Some(sink) = control.as_mut() {
                match sink.send(Message::Binary(bytes.clone().into())).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        log::debug!("control socket to {} failed: {e}", self.url);
                        *control = None;
                    }
                }
            }
        }
        Err(ProviderError::Closed)
    }
}

/// Keep reading the control socket so pings get answered.
async fn drain_control(mut reader: SplitStream<WsStream>) {
    while let Some(msg) = reader.next().await {
        if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
            break;
        }
    }
}

/// Next frame for `topic`, or the terminal status once the socket ends.
async fn next_frame(ws: &mut WsStream, topic: &str) -> (ProviderFrame, bool) {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                let bytes: Vec<u8> = data.into();
                let frame = match Frame::decode(&bytes) {
                    Ok(frame) if frame.topic == topic => frame,
                    Ok(frame) => {
                        log::debug!("{topic}: ignoring frame for {}", frame.topic);
                        continue;
                    }
                    Err(e) => {
                        log::warn!("{topic}: undecodable frame: {e}");
                        continue;
                    }
                };
                match frame.into_provider_frame() {
                    Ok(frame) => return (frame, true),
                    Err(e) => log::warn!("{topic}: unexpected frame: {e}"),
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                return (ProviderFrame::Status(ProviderStatus::Closed), false);
            }
            Some(Err(e)) => {
                return (ProviderFrame::Status(ProviderStatus::ChannelError(e.to_string())), false);
            }
            Some(Ok(_)) => {}
        }
    }
}

#[async_trait]
impl RealtimeProvider for WsProvider {
    async fn subscribe(
        &self,
        topic: &str,
        filter: Option<&EventFilter>,
    ) -> Result<FrameStream, ProviderError> {
        let mut ws = self.connect().await?;
        let hello = Frame::subscribe(topic, filter)?.encode()?;
        ws.send(Message::Binary(hello.into()))
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        log::debug!("{topic}: subscribe sent to {}", self.url);

        let topic = topic.to_string();
        let frames = stream::unfold(Some(ws), move |state| {
            let topic = topic.clone();
            async move {
                let mut ws = state?;
                let (frame, open) = next_frame(&mut ws, &topic).await;
                Some((frame, open.then_some(ws)))
            }
        });
        Ok(frames.boxed())
    }

    async fn broadcast(
        &self,
        topic: &str,
        event: &str,
        payload: Vec<u8>,
    ) -> Result<(), ProviderError> {
        self.send_control(Frame::broadcast(topic, event, payload)).await
    }

    async fn track(&self, topic: &str, state: PresenceState) -> Result<(), ProviderError> {
        self.send_control(Frame::track(topic, &state)?).await
    }

    async fn untrack(&self, topic: &str, peer_id: &str) -> Result<(), ProviderError> {
        self.send_control(Frame::untrack(topic, peer_id)).await
    }
}
