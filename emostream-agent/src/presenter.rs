//! Terminal presenter
//!
//! Observes the controller's view model and writes one status line per
//! meaningful change. Intents are single letters read from stdin.

use tokio::sync::{broadcast, watch};

use emostream_core::SessionStatus;

use crate::subsystems::session::{SessionCommand, SessionView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Session(SessionCommand),
    Quit,
}

/// `s` starts or stops depending on the current status.
pub fn parse_intent(line: &str, status: SessionStatus) -> Option<Intent> {
    match line.trim().to_ascii_lowercase().as_str() {
        "s" | "start" | "stop" if status.is_live() => Some(Intent::Session(SessionCommand::Stop)),
        "s" | "start" => Some(Intent::Session(SessionCommand::Start)),
        "p" | "pause" => Some(Intent::Session(SessionCommand::Pause)),
        "r" | "resume" => Some(Intent::Session(SessionCommand::Resume)),
        "q" | "quit" | "exit" => Some(Intent::Quit),
        _ => None,
    }
}

pub fn render_status(view: &SessionView) -> String {
    let mut line = format!("[{:?}]", view.status);
    if let Some(id) = &view.session_id {
        line.push_str(&format!(" session={id}"));
    }
    if view.status.is_live() {
        line.push_str(&format!(
            " elapsed={}s fps={} frames={}",
            view.elapsed_seconds, view.frames_per_second, view.frame_count
        ));
        if let Some(remaining) = view.remaining_seconds {
            line.push_str(&format!(" remaining={remaining}s"));
        }
    }
    let agg = &view.aggregation;
    if agg.total > 0 {
        let tally: Vec<String> = agg
            .tally
            .iter()
            .map(|(label, count)| format!("{label}:{count}"))
            .collect();
        line.push_str(&format!(" results={} [{}]", agg.total, tally.join(" ")));
        if let Some(dominant) = &agg.dominant {
            line.push_str(&format!(" dominant={dominant}"));
        }
    }
    line
}

/// Log view changes until shutdown. Per-second counters alone do not
/// trigger output; status, results, notices and summaries do.
pub async fn run_presenter(
    mut view: watch::Receiver<SessionView>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut last = view.borrow_and_update().clone();
    tracing::info!("{}", render_status(&last));

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                report(&last, &current);
                last = current;
            }
        }
    }
}

fn report(previous: &SessionView, current: &SessionView) {
    if current.notice != previous.notice {
        if let Some(notice) = &current.notice {
            tracing::warn!(%notice, "Session notice");
        }
    }
    if current.last_frame_error != previous.last_frame_error {
        if let Some(message) = &current.last_frame_error {
            tracing::debug!(%message, "Frame not analysed");
        }
    }
    if current.last_summary != previous.last_summary {
        if let Some(summary) = &current.last_summary {
            let tally = serde_json::to_string(&summary.emotion_tally).unwrap_or_default();
            tracing::info!(
                session_id = %summary.session_id,
                duration_seconds = summary.duration_seconds,
                %tally,
                end = ?current.last_end,
                "Session summary"
            );
        }
    }
    let moved = current.status != previous.status
        || current.aggregation.total != previous.aggregation.total
        || current.elapsed_seconds / 10 != previous.elapsed_seconds / 10;
    if moved {
        tracing::info!("{}", render_status(current));
    }
}
