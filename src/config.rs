use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SyncError};

const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Runtime configuration for the chat client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST API
    pub api_base_url: String,
    /// Base URL of the push endpoint (http or ws scheme)
    pub ws_base_url: String,
    /// Path of the push endpoint on `ws_base_url`
    pub push_path: String,
    /// Timeout applied to every HTTP request
    pub request_timeout: Duration,
    /// Delay before reconnecting a dropped push connection
    pub reconnect_delay: Duration,
    /// Interval at which we promise to send heartbeats
    pub heartbeat_outgoing: Duration,
    /// Interval at which we ask the server to send heartbeats
    pub heartbeat_incoming: Duration,
    /// Capacity of the live message channel
    pub live_buffer: usize,
    /// Where file-backed session storage lives
    pub data_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_BASE_URL.to_string(),
            ws_base_url: DEFAULT_BASE_URL.to_string(),
            push_path: "/ws".to_string(),
            request_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            heartbeat_outgoing: Duration::from_secs(4),
            heartbeat_incoming: Duration::from_secs(4),
            live_buffer: 256,
            data_dir: dirs::data_dir().map(|d| d.join("schat")),
        }
    }
}

impl ClientConfig {
    /// Build a config from the environment, reading `.env` if present
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenv::dotenv() {
            debug!("Loaded environment from {:?}", path);
        }

        let mut config = Self::default();

        if let Ok(url) = std::env::var("SCHAT_API_URL") {
            config.api_base_url = normalize_base_url(&url)?;
        }
        if let Ok(url) = std::env::var("SCHAT_WS_URL") {
            config.ws_base_url = normalize_base_url(&url)?;
        } else {
            config.ws_base_url = config.api_base_url.clone();
        }
        if let Ok(path) = std::env::var("SCHAT_PUSH_PATH") {
            if !path.starts_with('/') {
                return Err(SyncError::Config(format!(
                    "SCHAT_PUSH_PATH must start with '/': {}",
                    path
                )));
            }
            config.push_path = path;
        }
        if let Ok(dir) = std::env::var("SCHAT_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    /// Full URL for an API path
    pub fn api_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// WebSocket URL of the push endpoint
    pub fn push_url(&self) -> String {
        let base = self
            .ws_base_url
            .trim_end_matches('/')
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}{}", base, self.push_path)
    }
}

fn normalize_base_url(raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| SyncError::Config(format!("invalid base url {:?}: {}", raw, e)))?;

    match parsed.scheme() {
        "http" | "https" | "ws" | "wss" => {}
        other => {
            return Err(SyncError::Config(format!(
                "unsupported scheme {:?} in {}",
                other, raw
            )))
        }
    }

    Ok(parsed.as_str().trim_end_matches('/').to_string())
}
