use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregation::EmotionTally;
use crate::models::EmotionLabel;

/// Payload persisted once per finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub duration_seconds: u64,
    pub emotion_tally: EmotionTally,
    pub user_id: String,
}

/// One historical session as returned by the history endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendRecord {
    pub session_id: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: u64,
    #[serde(default)]
    pub emotion_tally: EmotionTally,
    #[serde(default)]
    pub dominant_emotion: Option<EmotionLabel>,
}

impl TrendRecord {
    /// Server-provided dominant label, or the tally's argmax when absent.
    pub fn dominant(&self) -> Option<EmotionLabel> {
        self.dominant_emotion
            .clone()
            .or_else(|| self.emotion_tally.dominant().cloned())
    }
}

/// Totals across a set of historical sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrendOverview {
    pub sessions: usize,
    pub total_seconds: u64,
    pub combined_tally: EmotionTally,
}

impl TrendOverview {
    pub fn from_records(records: &[TrendRecord]) -> Self {
        let mut overview = TrendOverview::default();
        for record in records {
            overview.sessions += 1;
            overview.total_seconds += record.duration_seconds;
            overview.combined_tally.merge(&record.emotion_tally);
        }
        overview
    }
}
