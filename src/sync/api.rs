//! Sync API Client - HTTP communication with the Oriel preferences endpoint
//!
//! - `GET  /api/user/preferences` (pull)
//! - `PUT  /api/user/preferences` (push)
//!
//! Bodies are plain JSON. The bearer token comes from the external auth
//! collaborator through `set_token`.

use super::models::{PreferenceSet, SyncRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

pub const API_BASE_URL: &str = "https://app.orielsignalfx.com";
const PREFERENCES_PATH: &str = "api/user/preferences";

// ============================================================================
// Transport seam
// ============================================================================

/// Server-side storage of the user's preference record
#[async_trait]
pub trait PreferencesRemote: Send + Sync {
    /// Current server record, `None` if the user has never synced
    async fn fetch(&self) -> Result<Option<SyncRecord>, SyncApiError>;

    /// Replace the server record
    async fn store(&self, record: &SyncRecord) -> Result<PushAck, SyncApiError>;
}

/// Server acknowledgment of a push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAck {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// HTTP client
// ============================================================================

/// API client for the Oriel preferences endpoint
pub struct SyncApiClient {
    client: Client,
    endpoint: Url,
    /// Bearer token (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
}

impl SyncApiClient {
    /// Create new API client; every request is bounded by `timeout`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncApiError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: preferences_endpoint(base_url)?,
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Set access token (after login)
    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    /// Get current token
    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// Clear token (logout)
    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }

    async fn authorized(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, SyncApiError> {
        let token = self.get_token().await.ok_or(SyncApiError::Unauthorized)?;
        Ok(request.bearer_auth(token))
    }
}

#[async_trait]
impl PreferencesRemote for SyncApiClient {
    async fn fetch(&self) -> Result<Option<SyncRecord>, SyncApiError> {
        let request = self.authorized(self.client.get(self.endpoint.clone())).await?;
        let response = request.send().await?;

        // 404 means the user has no server record yet (first sync)
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: PullBody = handle_response(response).await?;
        Ok(Some(match body {
            PullBody::Record(record) => record,
            PullBody::Bare(preferences) => SyncRecord::new(preferences, String::new()),
        }))
    }

    async fn store(&self, record: &SyncRecord) -> Result<PushAck, SyncApiError> {
        let request = self
            .authorized(self.client.put(self.endpoint.clone()).json(record))
            .await?;
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(handle_error(response).await);
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(PushAck {
                success: true,
                timestamp: record.timestamp,
            });
        }

        serde_json::from_str(&text).map_err(|_| SyncApiError::InvalidResponse)
    }
}

fn preferences_endpoint(base_url: &str) -> Result<Url, SyncApiError> {
    let mut base = Url::parse(base_url).map_err(|e| SyncApiError::InvalidUrl(e.to_string()))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(PREFERENCES_PATH)
        .map_err(|e| SyncApiError::InvalidUrl(e.to_string()))
}

/// Servers answer either with a full record or a bare preference set
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PullBody {
    Record(SyncRecord),
    Bare(PreferenceSet),
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Rejected payload: {0}")]
    Validation(String),

    #[error("Unauthorized - login required")]
    Unauthorized,

    #[error("Unexpected response ({status}): {message}")]
    UnexpectedStatus { status: u16, message: String },

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Invalid base URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for SyncApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncApiError::Timeout
        } else if e.is_decode() {
            SyncApiError::InvalidResponse
        } else {
            SyncApiError::Network(e.to_string())
        }
    }
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncApiError> {
    let status = response.status();

    if status.is_success() {
        response.json::<T>().await
            .map_err(|_| SyncApiError::InvalidResponse)
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to SyncApiError
async fn handle_error(response: reqwest::Response) -> SyncApiError {
    let status = response.status();
    let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());

    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => SyncApiError::Validation(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncApiError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => SyncApiError::RateLimited,
        s if s.is_server_error() => SyncApiError::Server {
            status: s.as_u16(),
            message,
        },
        s => SyncApiError::UnexpectedStatus {
            status: s.as_u16(),
            message,
        },
    }
}

// ============================================================================
// Tests
// ============================================================================
