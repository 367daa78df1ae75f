//! REST collaborators of the session core
//!
//! Provides a `SessionApi` trait covering the three calls the streaming core
//! makes outside the socket:
//! - **quota check** before a session may start
//! - **summary persistence** once a session has ended
//! - **trend history** of previously persisted sessions
//!
//! `RestSessionApi` is the reqwest implementation; tests swap in fakes.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::EmostreamConfig;
use crate::models::{SessionSummary, TrendRecord};

pub const QUOTA_PATH: &str = "/api/sessions/quota";
pub const SUMMARY_PATH: &str = "/api/sessions";
pub const HISTORY_PATH: &str = "/api/sessions/history";

/// Reason reported when the server denies without one.
pub const LIMIT_REACHED: &str = "limit reached";

// ============================================================================
// SessionApi trait
// ============================================================================

#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Ask whether the user may start another session.
    async fn check_quota(&self) -> Result<QuotaDecision, ApiError>;

    /// Persist the summary of a finished session.
    async fn persist_summary(&self, summary: &SessionSummary) -> Result<(), ApiError>;

    /// Most recent persisted sessions, newest first.
    async fn fetch_trends(&self, limit: Option<u32>) -> Result<Vec<TrendRecord>, ApiError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Granted { remaining: Option<u32> },
    Denied { reason: String },
}

impl QuotaDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, QuotaDecision::Granted { .. })
    }
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("Missing auth token")]
    MissingToken,

    #[error("All {attempts} retry attempts failed: {last}")]
    RetryExhausted { attempts: usize, last: String },
}

impl ApiError {
    /// Transport failures and 5xx answers are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Http(e) => !e.is_decode() && !e.is_builder(),
            ApiError::Api { code, .. } => *code >= 500,
            _ => false,
        }
    }
}

// ============================================================================
// Wire structs (private)
// ============================================================================

#[derive(Debug, Deserialize)]
struct QuotaResponse {
    #[serde(default = "default_allowed")]
    allowed: bool,
    remaining: Option<u32>,
    detail: Option<String>,
}

fn default_allowed() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<String>,
    error: Option<String>,
}

// ============================================================================
// RestSessionApi
// ============================================================================

/// Client settings, usually derived from `EmostreamConfig`.
#[derive(Debug, Clone)]
pub struct RestApiConfig {
    pub base_url: String,
    pub auth_token: String,
    pub timeout: Duration,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl From<&EmostreamConfig> for RestApiConfig {
    fn from(config: &EmostreamConfig) -> Self {
        Self {
            base_url: config.endpoints.rest_origin.clone(),
            auth_token: config.auth.token.clone(),
            timeout: Duration::from_secs(config.http.timeout_seconds),
            max_retries: config.http.max_retries,
            retry_delay_ms: config.http.retry_delay_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestSessionApi {
    client: Client,
    config: RestApiConfig,
    base_url: String,
}

impl RestSessionApi {
    pub fn new(config: RestApiConfig) -> Result<Self, ApiError> {
        if config.auth_token.is_empty() {
            return Err(ApiError::MissingToken);
        }
        if reqwest::Url::parse(&config.base_url).is_err() {
            return Err(ApiError::InvalidBaseUrl(config.base_url));
        }

        let client = Client::builder().timeout(config.timeout).build()?;
        let base_url = config.base_url.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            config,
            base_url,
        })
    }

    pub fn from_config(config: &EmostreamConfig) -> Result<Self, ApiError> {
        Self::new(RestApiConfig::from(config))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Run `op` with exponential backoff while the error is retryable.
    async fn with_retry<T, F, Fut>(&self, what: &'static str, op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ApiError>>,
    {
        let attempts = self.config.max_retries.max(1);
        let strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms.max(1))
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(attempts - 1);

        match RetryIf::spawn(strategy, op, ApiError::is_retryable).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_retryable() => {
                tracing::error!(call = what, attempts, error = %e, "All retry attempts failed");
                Err(ApiError::RetryExhausted {
                    attempts,
                    last: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn check_quota_once(&self) -> Result<QuotaDecision, ApiError> {
        let response = self
            .client
            .post(self.url(QUOTA_PATH))
            .bearer_auth(&self.config.auth_token)
            .send()
            .await?;

        let status = response.status();

        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            let reason = error_detail(&body).unwrap_or_else(|| LIMIT_REACHED.to_string());
            return Ok(QuotaDecision::Denied { reason });
        }

        if !status.is_success() {
            return Err(api_error(status, response).await);
        }

        let quota: QuotaResponse = response.json().await?;
        if quota.allowed {
            Ok(QuotaDecision::Granted {
                remaining: quota.remaining,
            })
        } else {
            Ok(QuotaDecision::Denied {
                reason: quota.detail.unwrap_or_else(|| LIMIT_REACHED.to_string()),
            })
        }
    }

    async fn persist_summary_once(&self, summary: &SessionSummary) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(SUMMARY_PATH))
            .bearer_auth(&self.config.auth_token)
            .json(summary)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(api_error(status, response).await);
        }
        Ok(())
    }

    async fn fetch_trends_once(&self, limit: Option<u32>) -> Result<Vec<TrendRecord>, ApiError> {
        let mut request = self
            .client
            .get(self.url(HISTORY_PATH))
            .bearer_auth(&self.config.auth_token);
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(api_error(status, response).await);
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl SessionApi for RestSessionApi {
    async fn check_quota(&self) -> Result<QuotaDecision, ApiError> {
        let decision = self.with_retry("check_quota", || self.check_quota_once()).await?;
        tracing::debug!(?decision, "Quota check answered");
        Ok(decision)
    }

    async fn persist_summary(&self, summary: &SessionSummary) -> Result<(), ApiError> {
        self.with_retry("persist_summary", || self.persist_summary_once(summary))
            .await?;
        tracing::info!(
            session_id = %summary.session_id,
            duration_seconds = summary.duration_seconds,
            results = summary.emotion_tally.total(),
            "Session summary persisted"
        );
        Ok(())
    }

    async fn fetch_trends(&self, limit: Option<u32>) -> Result<Vec<TrendRecord>, ApiError> {
        self.with_retry("fetch_trends", || self.fetch_trends_once(limit))
            .await
    }

    fn name(&self) -> &str {
        "rest"
    }
}

fn error_detail(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.detail.or(b.error))
}

async fn api_error(status: StatusCode, response: reqwest::Response) -> ApiError {
    let body = response.text().await.unwrap_or_default();
    let message = error_detail(&body).unwrap_or(body);
    tracing::warn!(code = status.as_u16(), message = %message, "Session API error");
    ApiError::Api {
        code: status.as_u16(),
        message,
    }
}

// ============================================================================
// TESTS
// ============================================================================
