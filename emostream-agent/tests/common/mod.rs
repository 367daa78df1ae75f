//! Shared fakes for the agent integration tests: a scripted in-process
//! inference server, a REST collaborator and a camera.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use emostream_agent::{CameraDevice, CaptureConstraints, CaptureError, SessionView, VideoSource};
use emostream_core::api::{ApiError, QuotaDecision, SessionApi};
use emostream_core::{EmostreamConfig, SessionSummary, TrendRecord};
use futures::{SinkExt, StreamExt};
use image::{Rgb, RgbImage};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

pub const TOKEN: &str = "test-token";
pub const USER_ID: &str = "user-1";

// ============================================================================
// Config
// ============================================================================

/// Fast cadence so tests finish quickly.
pub fn test_config(socket_origin: &str) -> EmostreamConfig {
    let mut config = EmostreamConfig::default();
    config.endpoints.socket_origin = socket_origin.to_string();
    config.auth.token = TOKEN.to_string();
    config.auth.user_id = USER_ID.to_string();
    config.capture.frame_interval_ms = 20;
    config.capture.tick_interval_ms = 5;
    config.session.hard_cap_seconds = 30;
    config.session.handshake_timeout_seconds = 5;
    config.session.close_timeout_ms = 300;
    config
}

pub fn small_constraints() -> CaptureConstraints {
    CaptureConstraints {
        width: 32,
        height: 24,
        facing_mode: "user".to_string(),
    }
}

/// Wait until `pred` holds for the published view.
pub async fn wait_for_view(
    rx: &mut watch::Receiver<SessionView>,
    what: &str,
    pred: impl FnMut(&SessionView) -> bool,
) -> SessionView {
    let result = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(pred))
        .await
        .map(|inner| inner.map(|view| view.clone()));
    match result {
        Ok(Ok(view)) => view,
        Ok(Err(_)) => panic!("controller exited while waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what}; last view: {:?}", rx.borrow().clone()),
    }
}

pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition never held: {what}");
}

// ============================================================================
// Fake inference server
// ============================================================================

#[derive(Debug, Clone)]
pub enum Reply {
    Result(&'static str),
    FrameError(&'static str),
    Garbage,
}

impl Reply {
    fn to_text(&self) -> String {
        match self {
            Reply::Result(label) => json!({
                "emotion": label,
                "confidence": 0.9,
                "timestamp": Utc::now().to_rfc3339(),
            })
            .to_string(),
            Reply::FrameError(message) => json!({ "error": message }).to_string(),
            Reply::Garbage => json!({ "type": "heartbeat" }).to_string(),
        }
    }
}

/// Per-connection behaviour. Each received frame consumes the next reply.
#[derive(Debug, Clone, Default)]
pub struct ServerScript {
    /// Session id sent as the handshake; `None` never completes the handshake.
    pub handshake: Option<String>,
    pub replies: Vec<Reply>,
    /// Close the connection (1000) after this many frames.
    pub close_after_frames: Option<usize>,
    /// Drop the TCP connection without a close frame after this many frames.
    pub drop_after_frames: Option<usize>,
    /// Hold each reply back this long after its frame arrives.
    pub reply_delay: Option<Duration>,
    /// After the handshake, keep the connection open but never read from it.
    pub stall: bool,
}

impl ServerScript {
    pub fn with_handshake(session_id: &str) -> Self {
        Self {
            handshake: Some(session_id.to_string()),
            ..Self::default()
        }
    }

    pub fn replies(mut self, replies: Vec<Reply>) -> Self {
        self.replies = replies;
        self
    }

    pub fn close_after(mut self, frames: usize) -> Self {
        self.close_after_frames = Some(frames);
        self
    }

    pub fn drop_after(mut self, frames: usize) -> Self {
        self.drop_after_frames = Some(frames);
        self
    }

    pub fn reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = Some(delay);
        self
    }

    pub fn stalled(mut self) -> Self {
        self.stall = true;
        self
    }
}

#[derive(Debug, Default)]
struct ServerStats {
    connections: AtomicUsize,
    frames: AtomicUsize,
    client_closes: AtomicUsize,
    tokens: Mutex<Vec<String>>,
}

pub struct FakeInferenceServer {
    pub origin: String,
    stats: Arc<ServerStats>,
    task: JoinHandle<()>,
}

impl FakeInferenceServer {
    pub async fn start(script: ServerScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake server");
        let addr = listener.local_addr().expect("local addr");
        let stats = Arc::new(ServerStats::default());

        let accept_stats = stats.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, script.clone(), accept_stats.clone()));
            }
        });

        Self {
            origin: format!("ws://{addr}"),
            stats,
            task,
        }
    }

    pub fn connections(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> usize {
        self.stats.frames.load(Ordering::SeqCst)
    }

    pub fn client_closes(&self) -> usize {
        self.stats.client_closes.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<String> {
        self.stats.tokens.lock().unwrap().clone()
    }
}

impl Drop for FakeInferenceServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(stream: TcpStream, script: ServerScript, stats: Arc<ServerStats>) {
    let token_stats = stats.clone();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let token = req
            .uri()
            .query()
            .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("token=")))
            .unwrap_or_default()
            .to_string();
        token_stats.tokens.lock().unwrap().push(token);
        Ok(resp)
    };

    let mut ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    stats.connections.fetch_add(1, Ordering::SeqCst);

    if let Some(session_id) = &script.handshake {
        let handshake = json!({ "status": "connected", "session_id": session_id }).to_string();
        if ws.send(Message::Text(handshake)).await.is_err() {
            return;
        }
    }

    if script.stall {
        // Socket stays open; nothing is read, so the client's writes back up.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        drop(ws);
        return;
    }

    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut replies = script.replies.iter();
    let mut frames = 0usize;
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(_)) => {
                frames += 1;
                stats.frames.fetch_add(1, Ordering::SeqCst);
                if let Some(reply) = replies.next() {
                    let text = Message::Text(reply.to_text());
                    match script.reply_delay {
                        Some(delay) => {
                            let out = out_tx.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = out.send(text);
                            });
                        }
                        None => {
                            let _ = out_tx.send(text);
                        }
                    }
                }
                if script.close_after_frames == Some(frames) {
                    let _ = out_tx.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "session over".into(),
                    })));
                }
                if script.drop_after_frames == Some(frames) {
                    // Flush queued replies, then drop both halves without a close frame.
                    drop(out_tx);
                    let _ = writer.await;
                    return;
                }
            }
            Ok(Message::Close(_)) => {
                stats.client_closes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    drop(out_tx);
    writer.abort();
}

// ============================================================================
// Fake REST collaborator
// ============================================================================

#[derive(Debug, Clone)]
pub enum QuotaBehavior {
    Grant,
    Deny(String),
    Fail,
}

pub struct FakeApi {
    quota: QuotaBehavior,
    quota_calls: AtomicUsize,
    summaries: Mutex<Vec<SessionSummary>>,
}

impl FakeApi {
    pub fn new(quota: QuotaBehavior) -> Arc<Self> {
        Arc::new(Self {
            quota,
            quota_calls: AtomicUsize::new(0),
            summaries: Mutex::new(Vec::new()),
        })
    }

    pub fn granting() -> Arc<Self> {
        Self::new(QuotaBehavior::Grant)
    }

    pub fn quota_calls(&self) -> usize {
        self.quota_calls.load(Ordering::SeqCst)
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.summaries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionApi for FakeApi {
    async fn check_quota(&self) -> Result<QuotaDecision, ApiError> {
        self.quota_calls.fetch_add(1, Ordering::SeqCst);
        match &self.quota {
            QuotaBehavior::Grant => Ok(QuotaDecision::Granted { remaining: Some(4) }),
            QuotaBehavior::Deny(reason) => Ok(QuotaDecision::Denied {
                reason: reason.clone(),
            }),
            QuotaBehavior::Fail => Err(ApiError::RetryExhausted {
                attempts: 3,
                last: "connection refused".to_string(),
            }),
        }
    }

    async fn persist_summary(&self, summary: &SessionSummary) -> Result<(), ApiError> {
        self.summaries.lock().unwrap().push(summary.clone());
        Ok(())
    }

    async fn fetch_trends(&self, _limit: Option<u32>) -> Result<Vec<TrendRecord>, ApiError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

// ============================================================================
// Fake camera
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraBehavior {
    Working,
    Denied,
    Missing,
}

pub struct FakeCamera {
    behavior: CameraBehavior,
    opens: AtomicUsize,
    held: Arc<AtomicBool>,
}

impl FakeCamera {
    pub fn new(behavior: CameraBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            opens: AtomicUsize::new(0),
            held: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn working() -> Arc<Self> {
        Self::new(CameraBehavior::Working)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CameraDevice for FakeCamera {
    async fn open(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn VideoSource>, CaptureError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            CameraBehavior::Denied => Err(CaptureError::PermissionDenied),
            CameraBehavior::Missing => Err(CaptureError::DeviceUnavailable("no camera".to_string())),
            CameraBehavior::Working => {
                if self.held.swap(true, Ordering::SeqCst) {
                    return Err(CaptureError::DeviceUnavailable("in use".to_string()));
                }
                Ok(Box::new(FakeSource {
                    width: constraints.width,
                    height: constraints.height,
                    held: Some(self.held.clone()),
                }))
            }
        }
    }

    fn name(&self) -> &str {
        "fake"
    }
}

struct FakeSource {
    width: u32,
    height: u32,
    held: Option<Arc<AtomicBool>>,
}

impl VideoSource for FakeSource {
    fn grab(&mut self) -> Result<RgbImage, CaptureError> {
        Ok(RgbImage::from_pixel(self.width, self.height, Rgb([90, 120, 150])))
    }

    fn close(&mut self) {
        if let Some(held) = self.held.take() {
            held.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.close();
    }
}
