//! HTTP client for the remote data service.
//!
//! Endpoints are JSON over HTTPS with bearer token authentication.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, warn};

use super::{ApiError, ApiResult, RemoteService};
use crate::models::{ChapterMeta, IdentityRecord, ProgressRecord, ProgressWrite};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Deserialize)]
struct ChapterListResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    chapters: Vec<ChapterMeta>,
    #[serde(default)]
    error: Option<String>,
}

/// API client for the remote data service.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> ApiResult<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            return Err(ApiError::InvalidConfig(format!(
                "API base URL must start with http:// or https://, got '{}'",
                base_url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url,
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth_headers(&self) -> ApiResult<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(ref token) = self.token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ApiError::InvalidConfig(format!("Invalid token: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> ApiResult<Option<Response>> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Send a request, backing off exponentially while rate limited.
    async fn send<F>(&self, url: &str, build: F) -> ApiResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build(&self.client)
                .headers(self.auth_headers()?)
                .send()
                .await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    async fn send_json<T, F>(&self, url: &str, build: F) -> ApiResult<T>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let response = self.send(url, build).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse response from {}: {}", url, e))
        })
    }
}

#[async_trait]
impl RemoteService for ApiClient {
    async fn fetch_chapter_list(&self, content_id: &str) -> ApiResult<Vec<ChapterMeta>> {
        let url = self.url(&format!("/contents/{}/chapters", content_id));
        let result: ApiResult<ChapterListResponse> =
            self.send_json(&url, |c| c.get(&url)).await;

        match result {
            Ok(response) if response.success => {
                debug!(content_id = content_id, count = response.chapters.len(), "Fetched chapter list");
                Ok(response.chapters)
            }
            Ok(response) => {
                warn!(
                    content_id = content_id,
                    error = response.error.as_deref().unwrap_or("unknown"),
                    "Chapter list request was not successful"
                );
                Ok(Vec::new())
            }
            // No list yet is an empty list, not an error
            Err(ApiError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn fetch_identity(&self) -> ApiResult<IdentityRecord> {
        let url = self.url("/auth/me");
        self.send_json(&url, |c| c.get(&url)).await
    }

    async fn read_progress(
        &self,
        owner_id: &str,
        content_id: &str,
    ) -> ApiResult<Option<ProgressRecord>> {
        let url = self.url("/progress");
        let records: Vec<ProgressRecord> = self
            .send_json(&url, |c| {
                c.get(&url)
                    .query(&[("owner_id", owner_id), ("content_id", content_id)])
            })
            .await?;
        Ok(records.into_iter().next())
    }

    async fn write_progress(&self, write: &ProgressWrite) -> ApiResult<ProgressRecord> {
        let url = self.url("/progress");
        self.send_json(&url, |c| c.put(&url).json(write)).await
    }

    async fn logout(&self) -> ApiResult<()> {
        let url = self.url("/auth/logout");
        self.send(&url, |c| c.post(&url)).await?;
        Ok(())
    }
}
