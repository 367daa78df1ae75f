use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use reqwest::Url;
use serde::Deserialize;

use crate::error::EmostreamError;

/// Prefix for environment overrides, e.g. `EMOSTREAM_AUTH__TOKEN`.
pub const ENV_PREFIX: &str = "EMOSTREAM";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EmostreamConfig {
    pub service: ServiceConfig,
    pub endpoints: EndpointConfig,
    pub auth: AuthConfig,
    pub capture: CaptureConfig,
    pub session: SessionConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EndpointConfig {
    pub rest_origin: String,
    pub socket_origin: String,
    pub stream_path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            rest_origin: "http://127.0.0.1:8000".to_string(),
            socket_origin: "ws://127.0.0.1:8000".to_string(),
            stream_path: "/ws/emotion".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub token: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CaptureConfig {
    /// Minimum spacing between emitted frames.
    pub frame_interval_ms: u64,
    /// Cadence of the cooperative loop; finer than `frame_interval_ms`.
    pub tick_interval_ms: u64,
    /// Lossy encoder quality in (0, 1].
    pub jpeg_quality: f32,
    pub width: u32,
    pub height: u32,
    pub compact_width: u32,
    pub compact_height: u32,
    /// Viewports narrower than this get the compact resolution.
    pub compact_breakpoint: u32,
    pub facing_mode: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 100,
            tick_interval_ms: 16,
            jpeg_quality: 0.7,
            width: 640,
            height: 480,
            compact_width: 320,
            compact_height: 240,
            compact_breakpoint: 640,
            facing_mode: "user".to_string(),
        }
    }
}

impl CaptureConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Encoder quality as the 1..=100 scale JPEG encoders take.
    pub fn jpeg_quality_percent(&self) -> u8 {
        (self.jpeg_quality * 100.0).round().clamp(1.0, 100.0) as u8
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Wall-clock cap for one session, enforced locally.
    pub hard_cap_seconds: u64,
    pub history_capacity: usize,
    pub handshake_timeout_seconds: u64,
    /// How long a closing channel may keep delivering in-flight results.
    pub close_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hard_cap_seconds: 120,
            history_capacity: 30,
            handshake_timeout_seconds: 10,
            close_timeout_ms: 500,
        }
    }
}

impl SessionConfig {
    pub fn hard_cap(&self) -> Duration {
        Duration::from_secs(self.hard_cap_seconds)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_seconds: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
            max_retries: 3,
            retry_delay_ms: 250,
        }
    }
}

impl EmostreamConfig {
    /// Load from a TOML file (optional) layered under `EMOSTREAM_*` environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        s.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), EmostreamError> {
        check_origin(&self.endpoints.rest_origin, &["http", "https"])?;
        check_origin(&self.endpoints.socket_origin, &["ws", "wss"])?;

        if self.capture.frame_interval_ms == 0 {
            return Err(invalid("capture.frame_interval_ms must be greater than zero"));
        }
        if self.capture.tick_interval_ms == 0 {
            return Err(invalid("capture.tick_interval_ms must be greater than zero"));
        }
        if !(self.capture.jpeg_quality > 0.0 && self.capture.jpeg_quality <= 1.0) {
            return Err(invalid("capture.jpeg_quality must be in (0, 1]"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(invalid("capture resolution must be non-zero"));
        }
        if self.session.hard_cap_seconds == 0 {
            return Err(invalid("session.hard_cap_seconds must be greater than zero"));
        }
        if self.session.handshake_timeout_seconds == 0 {
            return Err(invalid("session.handshake_timeout_seconds must be greater than zero"));
        }
        if self.session.history_capacity == 0 {
            return Err(invalid("session.history_capacity must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> EmostreamError {
    EmostreamError::InvalidConfig(msg.to_string())
}

fn check_origin(origin: &str, schemes: &[&str]) -> Result<(), EmostreamError> {
    let url = Url::parse(origin)
        .map_err(|e| EmostreamError::InvalidConfig(format!("invalid origin {origin}: {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(EmostreamError::InvalidConfig(format!(
            "origin {origin} must use one of {schemes:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EmostreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capture.frame_interval(), Duration::from_millis(100));
        assert_eq!(config.session.hard_cap(), Duration::from_secs(120));
        assert_eq!(config.session.history_capacity, 30);
        assert_eq!(config.capture.jpeg_quality_percent(), 70);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("tempfile");
        writeln!(
            file,
            r#"
[endpoints]
rest_origin = "https://api.example.test"
socket_origin = "wss://api.example.test"

[session]
hard_cap_seconds = 60
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = EmostreamConfig::load(&path).expect("config should load");

        assert_eq!(config.endpoints.rest_origin, "https://api.example.test");
        assert_eq!(config.endpoints.stream_path, "/ws/emotion");
        assert_eq!(config.session.hard_cap_seconds, 60);
        assert_eq!(config.session.history_capacity, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = EmostreamConfig::load("/nonexistent/emostream-config").unwrap();
        assert_eq!(config.capture.frame_interval_ms, 100);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EmostreamConfig::default();
        config.session.history_capacity = 0;
        assert!(matches!(config.validate(), Err(EmostreamError::InvalidConfig(_))));

        let mut config = EmostreamConfig::default();
        config.session.handshake_timeout_seconds = 0;
        assert!(matches!(config.validate(), Err(EmostreamError::InvalidConfig(_))));

        let mut config = EmostreamConfig::default();
        config.capture.jpeg_quality = 1.5;
        assert!(config.validate().is_err());

        let mut config = EmostreamConfig::default();
        config.endpoints.socket_origin = "http://127.0.0.1:8000".to_string();
        assert!(config.validate().is_err());

        let mut config = EmostreamConfig::default();
        config.endpoints.rest_origin = "not a url".to_string();
        assert!(config.validate().is_err());
    }
}
