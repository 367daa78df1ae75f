//! Session controller, the orchestrating actor
//!
//! One tokio task owns every piece of session state: the status machine,
//! the capture controller, the stream channel and the aggregation engine.
//! Intents arrive on a command channel; channel events, the 1 s timer, the
//! hard-cap deadline and the handshake deadline are multiplexed with
//! `tokio::select!`, so no lock guards session state.
//!
//! Every end path (user stop, hard cap, server close, channel error,
//! shutdown) runs the same cleanup:
//! 1. stop frame emission
//! 2. close the channel and drain in-flight results
//! 3. release the camera
//! 4. persist the summary once, then reset to `Idle`

use std::sync::Arc;

use chrono::{DateTime, Utc};
use emostream_core::api::{QuotaDecision, SessionApi};
use emostream_core::config::EmostreamConfig;
use emostream_core::protocol::ServerMessage;
use emostream_core::{AggregationEngine, AggregationSnapshot, Session, SessionStatus, SessionSummary};
use reqwest::Url;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::capture::{CameraDevice, CaptureConstraints, CaptureController, CaptureError, CaptureSettings};
use super::channel::{build_stream_url, ChannelError, ChannelEvent, ChannelOptions, StreamChannel};

/// Extra time allowed for draining on top of the channel's own close timeout.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

const COMMAND_BUFFER: usize = 16;

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Start,
    Pause,
    Resume,
    Stop,
}

/// User-visible notices raised by fatal or blocking conditions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    #[error("limit reached: {0}")]
    LimitReached(String),

    #[error("quota check failed: {0}")]
    QuotaCheckFailed(String),

    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("camera permission denied")]
    PermissionDenied,

    #[error("stream channel error: {0}")]
    ChannelError(String),

    #[error("no handshake from the inference service")]
    HandshakeTimeout,
}

impl From<CaptureError> for SessionNotice {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::PermissionDenied => SessionNotice::PermissionDenied,
            CaptureError::DeviceUnavailable(msg) => SessionNotice::DeviceUnavailable(msg),
            other => SessionNotice::DeviceUnavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    UserStop,
    HardCap,
    ServerClosed,
    ChannelError,
    Shutdown,
}

/// Everything a presenter needs, published after every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionView {
    pub status: SessionStatus,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: u64,
    pub remaining_seconds: Option<u64>,
    pub frame_count: u64,
    pub frames_per_second: u32,
    pub aggregation: AggregationSnapshot,
    pub notice: Option<SessionNotice>,
    /// Most recent per-frame failure reported by the server (e.g. no face).
    pub last_frame_error: Option<String>,
    /// Summary of the previous session, kept after the reset to `Idle`.
    pub last_summary: Option<SessionSummary>,
    pub last_end: Option<EndReason>,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session controller has shut down")]
    ControllerGone,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

// ============================================================================
// SessionController (handle)
// ============================================================================

pub struct SessionController {
    commands: mpsc::Sender<SessionCommand>,
    view: watch::Receiver<SessionView>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionController {
    pub fn spawn(
        config: EmostreamConfig,
        api: Arc<dyn SessionApi>,
        camera: Arc<dyn CameraDevice>,
        constraints: CaptureConstraints,
    ) -> Result<Self, SessionError> {
        let endpoint = build_stream_url(&config.endpoints.socket_origin, &config.endpoints.stream_path)?;
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (view_tx, view_rx) = watch::channel(SessionView::default());
        let shutdown = CancellationToken::new();

        let runtime = SessionRuntime {
            capture: CaptureController::new(camera, CaptureSettings::from(&config.capture)),
            engine: AggregationEngine::new(config.session.history_capacity),
            channel_options: ChannelOptions {
                close_timeout: config.session.close_timeout(),
                ..ChannelOptions::default()
            },
            config,
            api,
            constraints,
            endpoint,
            session: Session::new(),
            clock: ActiveClock::default(),
            view: view_tx,
            channel: None,
            events: None,
            cap_deadline: None,
            handshake_deadline: None,
            frames_at_last_tick: 0,
            notice: None,
            last_frame_error: None,
            last_summary: None,
            last_end: None,
        };

        let span = tracing::info_span!("session_controller", controller = %Uuid::new_v4());
        let task = tokio::spawn(runtime.run(commands_rx, shutdown.clone()).instrument(span));

        Ok(Self {
            commands: commands_tx,
            view: view_rx,
            shutdown,
            task,
        })
    }

    pub async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::ControllerGone)
    }

    pub async fn start(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Start).await
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Resume).await
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Stop).await
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// End any live session (its summary is still persisted) and stop the actor.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Session controller task failed");
        }
    }
}

// ============================================================================
// Active-time clock
// ============================================================================

/// Elapsed time that only advances while running: a banked total plus the
/// anchor of the current running stretch.
#[derive(Debug, Default)]
struct ActiveClock {
    banked: Duration,
    running_since: Option<Instant>,
}

impl ActiveClock {
    fn start(&mut self, now: Instant) {
        self.banked = Duration::ZERO;
        self.running_since = Some(now);
    }

    fn pause(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.banked += now.saturating_duration_since(since);
        }
    }

    fn resume(&mut self, now: Instant) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.banked
            + self
                .running_since
                .map(|since| now.saturating_duration_since(since))
                .unwrap_or_default()
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// Runtime (actor)
// ============================================================================

struct SessionRuntime {
    config: EmostreamConfig,
    api: Arc<dyn SessionApi>,
    capture: CaptureController,
    constraints: CaptureConstraints,
    endpoint: Url,
    channel_options: ChannelOptions,
    engine: AggregationEngine,
    session: Session,
    clock: ActiveClock,
    view: watch::Sender<SessionView>,
    channel: Option<StreamChannel>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    /// Wall-clock cap; keeps running while paused.
    cap_deadline: Option<Instant>,
    handshake_deadline: Option<Instant>,
    frames_at_last_tick: u64,
    notice: Option<SessionNotice>,
    last_frame_error: Option<String>,
    last_summary: Option<SessionSummary>,
    last_end: Option<EndReason>,
}

impl SessionRuntime {
    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>, shutdown: CancellationToken) {
        let mut ticker = time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(endpoint = %self.endpoint, api = self.api.name(), "Session controller running");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Session controller shutting down");
                    self.end(EndReason::Shutdown).await;
                    break;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.end(EndReason::Shutdown).await;
                        break;
                    }
                },
                event = next_event(&mut self.events) => self.handle_channel_event(event).await,
                _ = ticker.tick() => self.on_tick(),
                _ = deadline(self.cap_deadline) => {
                    tracing::info!(
                        hard_cap_seconds = self.config.session.hard_cap_seconds,
                        "Hard cap reached"
                    );
                    self.end(EndReason::HardCap).await;
                }
                _ = deadline(self.handshake_deadline) => {
                    tracing::warn!(
                        timeout_seconds = self.config.session.handshake_timeout_seconds,
                        "No handshake received"
                    );
                    self.fail(SessionNotice::HandshakeTimeout).await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        let status = self.session.status;
        tracing::debug!(?command, ?status, "Session command");

        match command {
            SessionCommand::Start if status.can_start() => self.begin().await,
            SessionCommand::Pause if status == SessionStatus::Active => {
                self.session.transition(SessionStatus::Paused);
                self.capture.pause();
                self.clock.pause(Instant::now());
                tracing::info!("Session paused");
                self.publish();
            }
            SessionCommand::Resume if status == SessionStatus::Paused => {
                self.session.transition(SessionStatus::Active);
                self.capture.resume();
                self.clock.resume(Instant::now());
                tracing::info!("Session resumed");
                self.publish();
            }
            SessionCommand::Stop if status.is_live() => self.end(EndReason::UserStop).await,
            _ => tracing::debug!(?command, ?status, "Ignoring command in current state"),
        }
    }

    async fn begin(&mut self) {
        let attempt = Uuid::new_v4();
        self.session.reset();
        self.notice = None;
        self.last_frame_error = None;
        self.session.transition(SessionStatus::Requesting);
        self.publish();
        tracing::info!(%attempt, "Requesting session");

        match self.api.check_quota().await {
            Ok(QuotaDecision::Granted { remaining }) => {
                tracing::info!(%attempt, ?remaining, "Quota granted");
            }
            Ok(QuotaDecision::Denied { reason }) => {
                tracing::warn!(%attempt, %reason, "Quota denied");
                self.session.transition(SessionStatus::Idle);
                self.notice = Some(SessionNotice::LimitReached(reason));
                self.publish();
                return;
            }
            Err(e) => {
                tracing::error!(%attempt, error = %e, "Quota check failed");
                self.session.transition(SessionStatus::Failed);
                self.notice = Some(SessionNotice::QuotaCheckFailed(e.to_string()));
                self.publish();
                return;
            }
        }

        self.session.transition(SessionStatus::Connecting);
        self.engine.reset();
        self.publish();

        if let Err(e) = self.capture.acquire(&self.constraints).await {
            tracing::warn!(%attempt, error = %e, "Camera acquisition failed");
            self.fail(SessionNotice::from(e)).await;
            return;
        }

        match StreamChannel::connect(&self.endpoint, &self.config.auth.token, self.channel_options.clone()) {
            Ok((channel, events)) => {
                self.channel = Some(channel);
                self.events = Some(events);
                self.handshake_deadline = Some(Instant::now() + self.config.session.handshake_timeout());
            }
            Err(e) => {
                tracing::error!(%attempt, error = %e, "Could not open stream channel");
                self.fail(SessionNotice::ChannelError(e.to_string())).await;
            }
        }
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        let status = self.session.status;
        match event {
            ChannelEvent::Opened => tracing::debug!("Channel open, waiting for handshake"),
            ChannelEvent::Message(ServerMessage::Connected { session_id }) => {
                if status == SessionStatus::Connecting {
                    self.activate(session_id);
                } else {
                    tracing::warn!(%session_id, ?status, "Unexpected handshake");
                }
            }
            ChannelEvent::Message(ServerMessage::Result(result)) => {
                if matches!(status, SessionStatus::Active | SessionStatus::Paused) {
                    self.engine.ingest(result);
                    self.publish();
                } else {
                    tracing::warn!(?status, "Dropping result received before handshake");
                }
            }
            ChannelEvent::Message(ServerMessage::Error { message }) => {
                tracing::debug!(%message, "Per-frame error from server");
                self.last_frame_error = Some(message);
                self.publish();
            }
            ChannelEvent::Message(ServerMessage::Unknown { reason, .. }) => {
                tracing::warn!(%reason, "Unrecognized message reached the controller");
            }
            ChannelEvent::Error(e) => {
                self.events = None;
                if status == SessionStatus::Connecting {
                    self.fail(SessionNotice::ChannelError(e)).await;
                } else {
                    self.notice = Some(SessionNotice::ChannelError(e));
                    self.end(EndReason::ChannelError).await;
                }
            }
            ChannelEvent::Closed { code, reason } => {
                self.events = None;
                if status == SessionStatus::Connecting {
                    self.fail(SessionNotice::ChannelError(format!(
                        "closed before handshake ({code:?} {reason})"
                    )))
                    .await;
                } else {
                    tracing::info!(?code, %reason, "Server closed the stream");
                    self.end(EndReason::ServerClosed).await;
                }
            }
        }
    }

    fn activate(&mut self, session_id: String) {
        let now = Instant::now();
        if !self.session.activate(session_id.clone(), Utc::now()) {
            return;
        }
        self.handshake_deadline = None;
        self.cap_deadline = Some(now + self.config.session.hard_cap());
        self.clock.start(now);
        self.frames_at_last_tick = 0;

        let Some(channel) = self.channel.as_ref() else {
            return;
        };
        let sender = channel.frame_sender();
        let started = self.capture.start_capturing(
            move |frame| {
                if !sender.send(frame.bytes) {
                    tracing::trace!(sequence = frame.sequence, "Frame dropped");
                }
            },
            self.config.capture.frame_interval(),
        );
        if let Err(e) = started {
            tracing::error!(error = %e, "Capture loop failed to start");
            self.notice = Some(SessionNotice::from(e));
        }

        tracing::info!(%session_id, "Session active");
        self.publish();
    }

    fn on_tick(&mut self) {
        if !matches!(self.session.status, SessionStatus::Active | SessionStatus::Paused) {
            return;
        }
        self.session.elapsed_seconds = self.clock.elapsed(Instant::now()).as_secs();
        if let Some(channel) = self.channel.as_ref() {
            let sent = channel.frames_sent();
            self.session.frames_per_second =
                u32::try_from(sent.saturating_sub(self.frames_at_last_tick)).unwrap_or(u32::MAX);
            self.session.frame_count = sent;
            self.frames_at_last_tick = sent;
        }
        self.publish();
    }

    /// Tear down a session that never became active.
    async fn fail(&mut self, notice: SessionNotice) {
        if self.session.status != SessionStatus::Connecting {
            return;
        }
        tracing::warn!(%notice, "Session failed");
        self.handshake_deadline = None;
        self.capture.stop_capturing().await;
        self.close_channel(false).await;
        self.capture.release().await;
        self.engine.reset();
        self.session.transition(SessionStatus::Failed);
        self.notice = Some(notice);
        self.publish();
    }

    /// Shared end path. A no-op unless a session is live.
    async fn end(&mut self, reason: EndReason) {
        let status = self.session.status;
        if !status.is_live() {
            tracing::debug!(?reason, ?status, "Nothing to end");
            return;
        }
        let was_active = status != SessionStatus::Connecting;

        self.session.transition(SessionStatus::Ending);
        self.clock.pause(Instant::now());
        self.session.elapsed_seconds = self.clock.elapsed(Instant::now()).as_secs();
        self.cap_deadline = None;
        self.handshake_deadline = None;
        tracing::info!(?reason, elapsed_seconds = self.session.elapsed_seconds, "Session ending");
        self.publish();

        self.capture.stop_capturing().await;
        self.close_channel(was_active).await;
        self.capture.release().await;

        if let Some(session_id) = self.session.id.clone() {
            let summary = SessionSummary {
                session_id,
                duration_seconds: self.session.elapsed_seconds,
                emotion_tally: self.engine.tally().clone(),
                user_id: self.config.auth.user_id.clone(),
            };
            match self.api.persist_summary(&summary).await {
                Ok(()) => tracing::debug!(session_id = %summary.session_id, "Summary handed off"),
                Err(e) => tracing::error!(
                    session_id = %summary.session_id,
                    error = %e,
                    "Failed to persist session summary"
                ),
            }
            self.last_summary = Some(summary);
        }

        self.session.transition(SessionStatus::Ended);
        self.last_end = Some(reason);
        self.publish();

        self.engine.reset();
        self.clock.reset();
        self.session.reset();
        self.frames_at_last_tick = 0;
        self.publish();
        tracing::info!(?reason, "Session ended");
    }

    /// Close the channel and wait for its terminal event. Results that arrive
    /// meanwhile are ingested when `ingest` is set.
    async fn close_channel(&mut self, ingest: bool) {
        let Some(mut channel) = self.channel.take() else {
            self.events = None;
            return;
        };
        channel.close();

        if let Some(mut events) = self.events.take() {
            let until = Instant::now() + self.channel_options.close_timeout + DRAIN_GRACE;
            loop {
                match time::timeout_at(until, events.recv()).await {
                    Ok(Some(event)) if event.is_terminal() => break,
                    Ok(Some(ChannelEvent::Message(ServerMessage::Result(result)))) => {
                        if ingest {
                            self.engine.ingest(result);
                        }
                    }
                    Ok(Some(ChannelEvent::Message(ServerMessage::Error { message }))) => {
                        self.last_frame_error = Some(message);
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(_) => {
                        tracing::warn!("Channel did not finish closing in time");
                        break;
                    }
                }
            }
        }

        self.session.frame_count = channel.frames_sent();
        channel.finished().await;
    }

    fn publish(&self) {
        let now = Instant::now();
        self.view.send_replace(SessionView {
            status: self.session.status,
            session_id: self.session.id.clone(),
            started_at: self.session.started_at,
            elapsed_seconds: self.session.elapsed_seconds,
            remaining_seconds: self
                .cap_deadline
                .map(|at| at.saturating_duration_since(now).as_secs()),
            frame_count: self.session.frame_count,
            frames_per_second: self.session.frames_per_second,
            aggregation: self.engine.snapshot(),
            notice: self.notice.clone(),
            last_frame_error: self.last_frame_error.clone(),
            last_summary: self.last_summary.clone(),
            last_end: self.last_end,
        });
    }
}

/// Next event from the open channel; pending forever when there is none.
async fn next_event(events: &mut Option<mpsc::Receiver<ChannelEvent>>) -> ChannelEvent {
    match events {
        Some(rx) => rx.recv().await.unwrap_or(ChannelEvent::Closed {
            code: None,
            reason: "channel driver exited".to_string(),
        }),
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
