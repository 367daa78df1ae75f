use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Emotion class reported by the inference service.
///
/// Labels outside the known set are kept verbatim in `Other` so they still
/// count towards the tally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EmotionLabel {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
    Other(String),
}

impl EmotionLabel {
    pub fn as_str(&self) -> &str {
        match self {
            EmotionLabel::Angry => "angry",
            EmotionLabel::Disgust => "disgust",
            EmotionLabel::Fear => "fear",
            EmotionLabel::Happy => "happy",
            EmotionLabel::Sad => "sad",
            EmotionLabel::Surprise => "surprise",
            EmotionLabel::Neutral => "neutral",
            EmotionLabel::Other(label) => label,
        }
    }
}

impl From<&str> for EmotionLabel {
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "angry" | "anger" => EmotionLabel::Angry,
            "disgust" | "disgusted" => EmotionLabel::Disgust,
            "fear" | "fearful" => EmotionLabel::Fear,
            "happy" | "happiness" => EmotionLabel::Happy,
            "sad" | "sadness" => EmotionLabel::Sad,
            "surprise" | "surprised" => EmotionLabel::Surprise,
            "neutral" => EmotionLabel::Neutral,
            _ => EmotionLabel::Other(raw.trim().to_string()),
        }
    }
}

impl From<String> for EmotionLabel {
    fn from(raw: String) -> Self {
        EmotionLabel::from(raw.as_str())
    }
}

impl From<EmotionLabel> for String {
    fn from(label: EmotionLabel) -> Self {
        label.as_str().to_string()
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub emotion: EmotionLabel,
    /// In [0, 1]; out-of-range values are rejected at the protocol boundary.
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl InferenceResult {
    pub fn new(emotion: impl Into<EmotionLabel>, confidence: f32, timestamp: DateTime<Utc>) -> Self {
        Self {
            emotion: emotion.into(),
            confidence,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_parsing_normalizes_known_labels() {
        assert_eq!(EmotionLabel::from("Happy"), EmotionLabel::Happy);
        assert_eq!(EmotionLabel::from(" surprised "), EmotionLabel::Surprise);
        assert_eq!(EmotionLabel::from("fearful"), EmotionLabel::Fear);
    }

    #[test]
    fn test_unknown_label_is_kept() {
        let label = EmotionLabel::from("no_face");
        assert_eq!(label, EmotionLabel::Other("no_face".to_string()));
        assert_eq!(label.as_str(), "no_face");
    }

    #[test]
    fn test_label_serializes_as_plain_string() {
        let json = serde_json::to_string(&EmotionLabel::Sad).unwrap();
        assert_eq!(json, "\"sad\"");
        let back: EmotionLabel = serde_json::from_str("\"contempt\"").unwrap();
        assert_eq!(back, EmotionLabel::Other("contempt".to_string()));
    }
}
