use thiserror::Error;

use crate::api::ApiError;

#[derive(Error, Debug)]
pub enum EmostreamError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}
