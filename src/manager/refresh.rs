//! OAuth2 token endpoint calls: refresh_token and authorization_code grants.
//!
//! Both grants authenticate with HTTP Basic (`base64(client_id:client_secret)`)
//! as the provider documents. Responses map into a [`TokenSet`] for the store.

use serde::Deserialize;
use tracing::debug;

use crate::client::classify::{classify, FaultKind};
use crate::error::{Error, Result};
use crate::store::{TokenSet, DEFAULT_TENANT};

/// Per-provider/tenant refresh configuration, registered with the manager at
/// initialization and immutable for its lifetime.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub provider: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub token_endpoint: String,
    /// Minutes before expiry at which `get_access_token` refreshes preemptively.
    pub refresh_before_expiry_mins: i64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub enable_auto_refresh: bool,
    pub enable_circuit_breaker: bool,
    /// Legacy tokens from the environment, migrated into the store once.
    pub env_tokens: Option<EnvTokens>,
}

/// Environment-provided legacy tokens for one-time migration.
#[derive(Debug, Clone)]
pub struct EnvTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub realm_id: Option<String>,
}

impl RefreshConfig {
    pub fn new(
        provider: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            tenant_id: DEFAULT_TENANT.to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_endpoint: token_endpoint.into(),
            refresh_before_expiry_mins: 5,
            max_retries: 3,
            retry_delay_ms: 1000,
            enable_auto_refresh: true,
            enable_circuit_breaker: true,
            env_tokens: None,
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.tenant_id)
    }
}

/// Standard OAuth2 token response plus QuickBooks' refresh-token TTL field.
#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default, alias = "x_refresh_token_expires_in")]
    refresh_token_expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default, alias = "realmId")]
    realm_id: Option<String>,
}

impl TokenEndpointResponse {
    fn into_token_set(self) -> TokenSet {
        TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type,
            expires_in_secs: self.expires_in,
            refresh_expires_in_secs: self.refresh_token_expires_in,
            scope: self.scope,
            realm_id: self.realm_id,
            company_id: None,
        }
    }
}

/// POST grant_type=refresh_token to the provider's token endpoint.
pub(crate) async fn refresh_access_token(
    http: &reqwest::Client,
    config: &RefreshConfig,
    refresh_token: &str,
) -> Result<TokenSet> {
    debug!(provider = %config.provider, endpoint = %config.token_endpoint, "refreshing access token");
    post_token_request(
        http,
        config,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ],
    )
    .await
}

/// POST grant_type=authorization_code to the provider's token endpoint.
pub(crate) async fn exchange_authorization_code(
    http: &reqwest::Client,
    config: &RefreshConfig,
    code: &str,
    redirect_uri: &str,
) -> Result<TokenSet> {
    debug!(provider = %config.provider, endpoint = %config.token_endpoint, "exchanging authorization code");
    post_token_request(
        http,
        config,
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ],
    )
    .await
}

async fn post_token_request(
    http: &reqwest::Client,
    config: &RefreshConfig,
    form: &[(&str, &str)],
) -> Result<TokenSet> {
    let response = http
        .post(&config.token_endpoint)
        .basic_auth(&config.client_id, Some(&config.client_secret))
        .header("Accept", "application/json")
        .form(form)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let kind = classify(status.as_u16(), &body);
        debug!(provider = %config.provider, status = %status, kind = ?kind, "token endpoint rejected request");
        return Err(Error::Provider {
            status: status.as_u16(),
            kind,
        });
    }

    let parsed: TokenEndpointResponse = response.json().await?;
    Ok(parsed.into_token_set())
}

/// A non-auth 4xx from the token endpoint is a caller error, not a transient
/// condition; retrying it cannot succeed.
pub(crate) fn is_retriable(err: &Error) -> bool {
    match err {
        Error::Transport(_) => true,
        Error::Provider { status, kind } => *status >= 500 || *kind == FaultKind::RateLimited,
        _ => false,
    }
}
