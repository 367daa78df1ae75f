pub mod inference;
pub mod session;
pub mod summary;

pub use inference::{EmotionLabel, InferenceResult};
pub use session::{Session, SessionStatus};
pub use summary::{SessionSummary, TrendOverview, TrendRecord};
