pub mod aggregation;
pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod protocol;

pub use aggregation::{AggregationEngine, AggregationSnapshot, EmotionTally, HistoryWindow};
pub use api::{ApiError, QuotaDecision, RestSessionApi, SessionApi};
pub use config::EmostreamConfig;
pub use error::EmostreamError;
pub use models::{EmotionLabel, InferenceResult, Session, SessionStatus, SessionSummary, TrendRecord};
pub use protocol::ServerMessage;
