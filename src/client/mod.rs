//! Resilient provider API client.
//!
//! Every outbound call runs through the same pipeline, in order: sliding-
//! window rate limiter, request deduplication, bearer-token injection from
//! the token manager, bounded retry on transport/5xx failures, one forced
//! refresh + replay on auth failure, and a `Retry-After` wait on 429 that
//! does not consume the transport retry budget.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use futures::FutureExt;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

pub mod classify;
mod dedup;
mod rate;

pub use classify::FaultKind;
pub use rate::{Admission, RateLimiter, DEFAULT_REQUESTS_PER_MINUTE};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::manager::TokenManager;
use classify::classify;
use dedup::InFlightRequests;

/// Fallback wait when a 429 carries no `Retry-After` header.
const RETRY_AFTER_FALLBACK_SECS: u64 = 5;

/// Client tuning. `new` fills in the documented defaults.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    /// Bounded retries for transport errors and 5xx responses.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub requests_per_minute: u32,
    pub request_timeout_secs: u64,
    /// Separate budget for 429 retries; they do not consume `max_retries`.
    pub max_rate_limit_retries: u32,
}

impl ClientOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            max_retries: 3,
            retry_delay_ms: 500,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            request_timeout_secs: 30,
            max_rate_limit_retries: 3,
        }
    }
}

/// Materialized response: status plus body text, cloneable so deduplicated
/// callers can share one result.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body)
            .map_err(|e| Error::Transport(format!("invalid response body: {e}")))
    }
}

/// HTTP client for the provider API with cross-cutting resilience policies.
///
/// Cheap to clone; clones share the rate window and dedup map. Two
/// *independent* instances deliberately do not share them.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    manager: TokenManager,
    provider: String,
    tenant_id: String,
    http: reqwest::Client,
    limiter: RateLimiter,
    in_flight: InFlightRequests,
    options: ClientOptions,
}

impl ApiClient {
    pub fn new(
        manager: TokenManager,
        provider: impl Into<String>,
        tenant_id: impl Into<String>,
        options: ClientOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(options.request_timeout_secs))
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                manager,
                provider: provider.into(),
                tenant_id: tenant_id.into(),
                http,
                limiter: RateLimiter::new(options.requests_per_minute, clock),
                in_flight: InFlightRequests::new(),
                options,
            }),
        })
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.request(Method::DELETE, path, None).await
    }

    /// Run one request through the full pipeline.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<ApiResponse> {
        // 1. Rate limiter gate.
        self.inner.limiter.acquire().await;

        // 2. Dedup gate: identical concurrent requests share one execution.
        let body_bytes = body
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| Error::Transport(format!("unserializable request body: {e}")))?;
        let key = dedup::request_key(method.as_str(), path, body_bytes.as_deref());

        let inner = self.inner.clone();
        let work_method = method.clone();
        let work_path = path.to_string();
        let work = async move {
            ClientInner::execute(inner, work_method, work_path, body)
                .await
                .map_err(Arc::new)
        }
        .boxed();

        self.inner
            .in_flight
            .run(key, work)
            .await
            .map_err(|err| match Arc::try_unwrap(err) {
                // Sole caller: hand back the typed error directly.
                Ok(inner) => inner,
                Err(shared) => Error::Shared(shared),
            })
    }
}

impl ClientInner {
    /// Steps 3-6 of the pipeline: token injection, bounded retry, one auth
    /// replay, 429 recovery.
    async fn execute(
        inner: Arc<ClientInner>,
        method: Method,
        path: String,
        body: Option<serde_json::Value>,
    ) -> Result<ApiResponse> {
        let url = format!("{}{}", inner.options.base_url, path);
        let mut transport_attempts: u32 = 0;
        let mut rate_limit_retries: u32 = 0;
        let mut auth_replayed = false;

        loop {
            // 3. Bearer token from the manager (may itself refresh).
            let token = inner
                .manager
                .get_access_token(&inner.provider, &inner.tenant_id)
                .await?;

            let mut request = inner
                .http
                .request(method.clone(), &url)
                .bearer_auth(&token)
                .header("Accept", "application/json");
            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    // 4. Transport failure: bounded retry with backoff.
                    if transport_attempts < inner.options.max_retries {
                        let delay = backoff_delay(&inner.options, transport_attempts);
                        warn!(
                            method = %method, path = %path,
                            attempt = transport_attempts, error = %err,
                            "transport failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        transport_attempts += 1;
                        continue;
                    }
                    return Err(err.into());
                }
            };

            let status = response.status().as_u16();
            let retry_after = parse_retry_after(response.headers());
            let body_text = response.text().await.unwrap_or_default();

            if (200..300).contains(&status) {
                return Ok(ApiResponse {
                    status,
                    body: body_text,
                });
            }

            match classify(status, &body_text) {
                // 5. Auth failure: one forced refresh + replay, then surface.
                FaultKind::Auth => {
                    if auth_replayed {
                        return Err(Error::Authentication { status });
                    }
                    warn!(
                        method = %method, path = %path, status,
                        "authentication failure, forcing token refresh and replaying once"
                    );
                    inner
                        .manager
                        .refresh_token(&inner.provider, &inner.tenant_id)
                        .await?;
                    auth_replayed = true;
                }
                // 6. 429: honor Retry-After on its own budget.
                FaultKind::RateLimited => {
                    if rate_limit_retries >= inner.options.max_rate_limit_retries {
                        return Err(Error::RateLimitExceeded);
                    }
                    let wait = retry_after.unwrap_or(RETRY_AFTER_FALLBACK_SECS);
                    debug!(
                        method = %method, path = %path, wait_secs = wait,
                        "provider throttled request, waiting per Retry-After"
                    );
                    tokio::time::sleep(StdDuration::from_secs(wait)).await;
                    rate_limit_retries += 1;
                }
                kind => {
                    // 5xx is transient; non-auth 4xx is a caller error and
                    // surfaces immediately.
                    if status >= 500 && transport_attempts < inner.options.max_retries {
                        let delay = backoff_delay(&inner.options, transport_attempts);
                        warn!(
                            method = %method, path = %path, status,
                            attempt = transport_attempts,
                            "server error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        transport_attempts += 1;
                        continue;
                    }
                    return Err(Error::Provider { status, kind });
                }
            }
        }
    }
}

fn backoff_delay(options: &ClientOptions, attempt: u32) -> StdDuration {
    StdDuration::from_millis(options.retry_delay_ms.saturating_mul(1 << attempt))
}

/// Seconds to wait from a `Retry-After` header. Only the delta-seconds form
/// is supported; the HTTP-date form falls back to the fixed default.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("17"));
        assert_eq!(parse_retry_after(&headers), Some(17));
    }

    #[test]
    fn test_parse_retry_after_missing_or_date() {
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);

        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let options = ClientOptions::new("http://example.invalid");
        assert_eq!(backoff_delay(&options, 0), StdDuration::from_millis(500));
        assert_eq!(backoff_delay(&options, 1), StdDuration::from_millis(1000));
        assert_eq!(backoff_delay(&options, 2), StdDuration::from_millis(2000));
    }

    #[test]
    fn test_api_response_json() {
        let response = ApiResponse {
            status: 200,
            body: r#"{"Invoice": {"Id": "42"}}"#.to_string(),
        };
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["Invoice"]["Id"], "42");

        let bad = ApiResponse {
            status: 200,
            body: "not json".to_string(),
        };
        assert!(bad.json::<serde_json::Value>().is_err());
    }
}
