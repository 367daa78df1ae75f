use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Requesting,
    Connecting,
    Active,
    Paused,
    Ending,
    Ended,
    Failed,
}

impl SessionStatus {
    /// Transition table of the session state machine.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Idle, Requesting)
                | (Failed, Requesting)
                | (Requesting, Idle)
                | (Requesting, Connecting)
                | (Requesting, Failed)
                | (Connecting, Active)
                | (Connecting, Failed)
                | (Connecting, Ending)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Ending)
                | (Paused, Ending)
                | (Ending, Ended)
                | (Ended, Idle)
        )
    }

    /// Whether a session has been started and not yet torn down.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionStatus::Connecting | SessionStatus::Active | SessionStatus::Paused
        )
    }

    /// States from which a new session may be requested.
    pub fn can_start(self) -> bool {
        self.can_transition_to(SessionStatus::Requesting)
    }
}

/// One monitoring run, as seen by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Session {
    /// Assigned by the server handshake.
    pub id: Option<String>,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: u64,
    pub frame_count: u64,
    pub frames_per_second: u32,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a transition if the table allows it. Returns `false` and leaves the
    /// status untouched otherwise.
    pub fn transition(&mut self, next: SessionStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    pub fn activate(&mut self, id: String, started_at: DateTime<Utc>) -> bool {
        if !self.transition(SessionStatus::Active) {
            return false;
        }
        self.id = Some(id);
        self.started_at = Some(started_at);
        self.elapsed_seconds = 0;
        self.frame_count = 0;
        self.frames_per_second = 0;
        true
    }

    /// Drop everything but the status, which returns to `Idle`.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
