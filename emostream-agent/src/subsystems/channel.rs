//! Stream channel: one WebSocket to the inference service
//!
//! A driver task owns the socket. The channel handle only flips shared state
//! and pushes frames into a single-slot outbox; when the socket is not open or
//! the slot is taken the frame is dropped, never queued.
//!
//! Lifecycle is reported on an event receiver:
//! `Opened`, then any number of `Message`s, then exactly one terminal
//! `Error` or `Closed`. There is no reconnect; a new session opens a new channel.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use emostream_core::protocol::ServerMessage;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;

/// Outgoing frames waiting for the socket. One slot: newer frames are dropped
/// while the previous one is still being written.
const OUTBOX_SLOTS: usize = 1;

/// Slack on top of `close_timeout` before a stuck driver task is aborted.
const FINISH_GRACE: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("invalid stream endpoint: {0}")]
    InvalidEndpoint(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened,
    Message(ServerMessage),
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

impl ChannelEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelEvent::Error(_) | ChannelEvent::Closed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Connecting,
            1 => ChannelState::Open,
            2 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ChannelState::Connecting => 0,
            ChannelState::Open => 1,
            ChannelState::Closing => 2,
            ChannelState::Closed => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub event_buffer: usize,
    /// How long a client-initiated close waits for the server's close reply.
    pub close_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            event_buffer: 64,
            close_timeout: Duration::from_millis(500),
        }
    }
}

/// `{socket_origin}{stream_path}`; the origin must be `ws://` or `wss://`.
pub fn build_stream_url(socket_origin: &str, stream_path: &str) -> Result<Url, ChannelError> {
    let origin = Url::parse(socket_origin)
        .map_err(|e| ChannelError::InvalidEndpoint(format!("{socket_origin}: {e}")))?;
    if !matches!(origin.scheme(), "ws" | "wss") {
        return Err(ChannelError::InvalidEndpoint(format!(
            "{socket_origin}: expected ws:// or wss://"
        )));
    }
    origin
        .join(stream_path)
        .map_err(|e| ChannelError::InvalidEndpoint(format!("{stream_path}: {e}")))
}

#[derive(Debug, Default)]
struct Shared {
    state: AtomicU8,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Shared {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

/// Cloneable send side of a channel, handed to the capture loop.
#[derive(Debug, Clone)]
pub struct FrameSender {
    shared: Arc<Shared>,
    outbox: mpsc::Sender<Vec<u8>>,
}

impl FrameSender {
    /// Returns `false` when the frame was dropped.
    pub fn send(&self, bytes: Vec<u8>) -> bool {
        let queued = self.shared.state() == ChannelState::Open && self.outbox.try_send(bytes).is_ok();
        if !queued {
            self.shared.frames_dropped.fetch_add(1, Ordering::AcqRel);
        }
        queued
    }
}

pub struct StreamChannel {
    sender: FrameSender,
    cancel: CancellationToken,
    close_timeout: Duration,
    task: Option<JoinHandle<()>>,
}

impl StreamChannel {
    /// Open a connection to `endpoint` with `auth_token` as the `token` query
    /// parameter. Returns immediately; the handshake completes on the driver task.
    pub fn connect(
        endpoint: &Url,
        auth_token: &str,
        options: ChannelOptions,
    ) -> Result<(Self, mpsc::Receiver<ChannelEvent>), ChannelError> {
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(ChannelError::InvalidEndpoint(endpoint.to_string()));
        }

        let mut url = endpoint.clone();
        if auth_token.is_empty() {
            tracing::warn!("Opening stream channel without an auth token");
        } else {
            url.query_pairs_mut().append_pair("token", auth_token);
        }

        let shared = Arc::new(Shared::default());
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_SLOTS);
        let (events_tx, events_rx) = mpsc::channel(options.event_buffer.max(1));
        let cancel = CancellationToken::new();

        tracing::info!(endpoint = %endpoint, "Opening stream channel");

        let task = tokio::spawn(drive(
            url,
            shared.clone(),
            outbox_rx,
            events_tx,
            cancel.clone(),
            options.close_timeout,
        ));

        Ok((
            Self {
                sender: FrameSender {
                    shared,
                    outbox: outbox_tx,
                },
                cancel,
                close_timeout: options.close_timeout,
                task: Some(task),
            },
            events_rx,
        ))
    }

    pub fn state(&self) -> ChannelState {
        self.sender.shared.state()
    }

    pub fn send(&self, bytes: Vec<u8>) -> bool {
        self.sender.send(bytes)
    }

    pub fn frame_sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Frames actually written to the socket.
    pub fn frames_sent(&self) -> u64 {
        self.sender.shared.frames_sent.load(Ordering::Acquire)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.sender.shared.frames_dropped.load(Ordering::Acquire)
    }

    /// Begin closing. Idempotent; in-flight messages keep arriving on the
    /// event receiver until the terminal `Closed`.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(state = ?self.state(), "Closing stream channel");
            self.cancel.cancel();
        }
    }

    /// Wait for the driver task to exit. Call after `close` and after the
    /// event receiver has been drained (or dropped). A driver still running
    /// after `close_timeout` plus a short grace is aborted.
    pub async fn finished(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(self.close_timeout + FINISH_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Stream channel task failed"),
            Err(_) => {
                tracing::warn!("Stream channel task did not exit in time, aborting");
                task.abort();
                self.sender.shared.set_state(ChannelState::Closed);
            }
        }
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive(
    url: Url,
    shared: Arc<Shared>,
    mut outbox: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
    close_timeout: Duration,
) {
    let connected = tokio::select! {
        res = connect_async(url.as_str()) => res,
        _ = cancel.cancelled() => {
            shared.set_state(ChannelState::Closed);
            let _ = events
                .send(ChannelEvent::Closed { code: None, reason: "closed before open".to_string() })
                .await;
            return;
        }
    };

    let socket = match connected {
        Ok((socket, _response)) => socket,
        Err(e) => {
            tracing::warn!(error = %e, "Stream channel failed to open");
            shared.set_state(ChannelState::Closed);
            let _ = events.send(ChannelEvent::Error(e.to_string())).await;
            return;
        }
    };

    shared.set_state(ChannelState::Open);
    tracing::info!("Stream channel open");
    let _ = events.send(ChannelEvent::Opened).await;

    let (mut sink, mut stream) = socket.split();

    let terminal = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            Some(bytes) = outbox.recv() => {
                // A peer that stops reading must not hold off a close.
                tokio::select! {
                    sent = sink.send(Message::Binary(bytes)) => {
                        if let Err(e) = sent {
                            break Some(ChannelEvent::Error(e.to_string()));
                        }
                        shared.frames_sent.fetch_add(1, Ordering::AcqRel);
                    }
                    _ = cancel.cancelled() => break None,
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(message)) => {
                    if let Some(event) = handle_incoming(message, &events).await {
                        break Some(event);
                    }
                }
                Some(Err(e)) => break Some(ChannelEvent::Error(e.to_string())),
                None => break Some(ChannelEvent::Closed {
                    code: None,
                    reason: "connection dropped".to_string(),
                }),
            }
        }
    };

    let terminal = match terminal {
        Some(event) => {
            match &event {
                ChannelEvent::Error(e) => tracing::warn!(error = %e, "Stream channel error"),
                other => tracing::info!(event = ?other, "Stream channel closed by server"),
            }
            let _ = tokio::time::timeout(close_timeout, sink.close()).await;
            event
        }
        None => {
            shared.set_state(ChannelState::Closing);
            let deadline = tokio::time::Instant::now() + close_timeout;
            if tokio::time::timeout_at(deadline, sink.send(Message::Close(None)))
                .await
                .is_err()
            {
                tracing::debug!("Close frame not written before the timeout");
            }

            // Results already in flight still count; read until the server
            // acknowledges the close or the timeout elapses.
            let deadline = tokio::time::sleep_until(deadline);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        tracing::debug!("Close acknowledgement timed out");
                        break;
                    }
                    incoming = stream.next() => match incoming {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(message)) => {
                            let _ = handle_incoming(message, &events).await;
                        }
                    }
                }
            }
            ChannelEvent::Closed {
                code: None,
                reason: "closed by client".to_string(),
            }
        }
    };

    shared.set_state(ChannelState::Closed);
    tracing::info!(
        frames_sent = shared.frames_sent.load(Ordering::Acquire),
        frames_dropped = shared.frames_dropped.load(Ordering::Acquire),
        "Stream channel finished"
    );
    let _ = events.send(terminal).await;
}

/// Forward one incoming frame. Returns the terminal event for a close frame.
async fn handle_incoming(
    message: Message,
    events: &mpsc::Sender<ChannelEvent>,
) -> Option<ChannelEvent> {
    match message {
        Message::Text(text) => {
            match ServerMessage::parse(&text) {
                ServerMessage::Unknown { reason, raw } => {
                    tracing::warn!(%reason, %raw, "Dropping unrecognized stream message");
                }
                parsed => {
                    let _ = events.send(ChannelEvent::Message(parsed)).await;
                }
            }
            None
        }
        Message::Close(frame) => {
            let (code, reason) = match frame {
                Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                None => (None, String::new()),
            };
            Some(ChannelEvent::Closed { code, reason })
        }
        Message::Binary(bytes) => {
            tracing::warn!(len = bytes.len(), "Ignoring binary message from server");
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_stream_url_joins_path() {
        let url = build_stream_url("ws://127.0.0.1:8000", "/ws/emotion").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8000/ws/emotion");

        let secure = build_stream_url("wss://api.example.test/", "ws/emotion").unwrap();
        assert_eq!(secure.as_str(), "wss://api.example.test/ws/emotion");
    }

    #[test]
    fn test_build_stream_url_rejects_http() {
        assert!(matches!(
            build_stream_url("http://127.0.0.1:8000", "/ws/emotion"),
            Err(ChannelError::InvalidEndpoint(_))
        ));
        assert!(build_stream_url("nonsense", "/ws").is_err());
    }

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            ChannelState::Connecting,
            ChannelState::Open,
            ChannelState::Closing,
            ChannelState::Closed,
        ] {
            assert_eq!(ChannelState::from_u8(state.as_u8()), state);
        }
    }

    #[tokio::test]
    async fn test_send_before_open_is_dropped() {
        // Nothing listens on port 9; the channel never opens.
        let url = build_stream_url("ws://127.0.0.1:9", "/ws/emotion").unwrap();
        let (channel, mut events) =
            StreamChannel::connect(&url, "token", ChannelOptions::default()).unwrap();

        assert!(!channel.send(vec![0xFF, 0xD8]));
        assert_eq!(channel.frames_sent(), 0);
        assert_eq!(channel.frames_dropped(), 1);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("terminal event")
            .expect("event");
        assert!(event.is_terminal(), "got {event:?}");
        assert_eq!(channel.state(), ChannelState::Closed);
    }
}
