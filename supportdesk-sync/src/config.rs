use crate::backoff::Backoff;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const CONFIG_FILE: &str = "sync.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the remote authority, e.g. "https://support.example.com/api".
    /// `None` keeps the client offline-only.
    pub remote_url: Option<String>,
    pub client_id: String,
    pub auth_token: Option<String>,
    pub request_timeout_ms: u64,
    pub auto_sync_interval_secs: u64,
    /// Failed attempts after which an entry is parked as poisoned.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Random spread applied to each delay, as a fraction (0.2 = ±20%).
    pub backoff_jitter: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            client_id: default_client_id(),
            auth_token: None,
            request_timeout_ms: 5_000,
            auto_sync_interval_secs: 30,
            max_attempts: 8,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            backoff_jitter: 0.2,
        }
    }
}

impl SyncConfig {
    /// Load sync configuration from {data_dir}/sync.json or fall back to the
    /// environment.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let path = data_dir.join(CONFIG_FILE);

        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<SyncConfig>(&content) {
                    Ok(config) => {
                        tracing::info!(
                            "Loaded sync config: client_id={}, remote={}",
                            config.client_id,
                            config.remote_url.as_deref().unwrap_or("<none>")
                        );
                        return config;
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse sync.json: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read sync.json: {}, using defaults", e);
                }
            }
        }

        let config = Self::from_env();
        tracing::info!(
            "No sync.json found, using environment: client_id={}, remote={}",
            config.client_id,
            config.remote_url.as_deref().unwrap_or("<none>")
        );
        config
    }

    /// `SUPPORTDESK_REMOTE_URL`, `SUPPORTDESK_CLIENT_ID`,
    /// `SUPPORTDESK_AUTH_TOKEN`, `SUPPORTDESK_SYNC_INTERVAL_SECS`,
    /// `SUPPORTDESK_REQUEST_TIMEOUT_MS`, `SUPPORTDESK_MAX_ATTEMPTS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            remote_url: std::env::var("SUPPORTDESK_REMOTE_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            auth_token: std::env::var("SUPPORTDESK_AUTH_TOKEN")
                .ok()
                .filter(|s| !s.is_empty()),
            auto_sync_interval_secs: env_parse("SUPPORTDESK_SYNC_INTERVAL_SECS")
                .unwrap_or(defaults.auto_sync_interval_secs),
            request_timeout_ms: env_parse("SUPPORTDESK_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout_ms),
            max_attempts: env_parse("SUPPORTDESK_MAX_ATTEMPTS")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.max_attempts),
            ..defaults
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_secs(self.auto_sync_interval_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
            self.backoff_jitter,
        )
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn default_client_id() -> String {
    std::env::var("SUPPORTDESK_CLIENT_ID").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string())
    })
}
