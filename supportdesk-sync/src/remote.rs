use crate::config::SyncConfig;
use crate::error::RemoteError;
use crate::types::{PullResponse, PushRequest, PushResponse};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The system of record the sync manager reconciles with.
pub trait RemoteAuthority: Send + Sync + 'static {
    fn push(
        &self,
        request: PushRequest,
    ) -> impl Future<Output = Result<PushResponse, RemoteError>> + Send;

    fn pull(
        &self,
        client_id: &str,
        since: Option<&str>,
    ) -> impl Future<Output = Result<PullResponse, RemoteError>> + Send;
}

/// JSON-over-HTTP client for the remote authority.
pub struct HttpRemote {
    base_url: String,
    auth_token: Option<String>,
    timeout_ms: u64,
    http_client: reqwest::Client,
    last_success: Arc<AtomicU64>, // Unix timestamp in seconds
}

impl HttpRemote {
    /// Fails if `base_url` is not an absolute URL or the HTTP client cannot
    /// be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url)
            .map_err(|e| RemoteError::Client(format!("invalid remote url '{}': {}", base_url, e)))?;
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Client(e.to_string()))?;

        Ok(Self {
            base_url,
            auth_token: None,
            timeout_ms: timeout.as_millis() as u64,
            http_client,
            last_success: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, RemoteError> {
        let url = config
            .remote_url
            .as_deref()
            .ok_or(RemoteError::NotConfigured)?;
        let mut remote = Self::new(url, config.request_timeout())?;
        remote.auth_token = config.auth_token.clone();
        Ok(remote)
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn last_success_timestamp(&self) -> u64 {
        self.last_success.load(Ordering::Relaxed)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_token {
            Some(ref token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn transport_error(&self, url: &str, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout_ms)
        } else {
            RemoteError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            }
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed = response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout(self.timeout_ms)
            } else {
                RemoteError::Decode(format!("{}: {}", url, e))
            }
        })?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.last_success.store(now, Ordering::Relaxed);
        Ok(parsed)
    }
}

impl RemoteAuthority for HttpRemote {
    async fn push(&self, request: PushRequest) -> Result<PushResponse, RemoteError> {
        let url = format!("{}/sync/push", self.base_url);
        let response = self
            .authorize(self.http_client.post(&url).json(&request))
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;
        self.decode(&url, response).await
    }

    async fn pull(&self, client_id: &str, since: Option<&str>) -> Result<PullResponse, RemoteError> {
        let url = format!("{}/sync/pull", self.base_url);
        let mut query = vec![("client_id", client_id)];
        if let Some(since) = since {
            query.push(("since", since));
        }
        let response = self
            .authorize(self.http_client.get(&url).query(&query))
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;
        self.decode(&url, response).await
    }
}
