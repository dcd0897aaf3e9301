//! Environment-driven settings.
//!
//! All knobs come from `LEDGERSYNC_*` env vars with parse-or-default
//! semantics; only the secrets and client credentials are hard requirements.

use anyhow::{Context, Result};

use crate::manager::{EnvTokens, RefreshConfig};
use crate::store::DEFAULT_TENANT;

/// Intuit's production token endpoint.
const DEFAULT_QBO_TOKEN_ENDPOINT: &str =
    "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer";

/// QuickBooks Online API base.
const DEFAULT_QBO_API_BASE_URL: &str = "https://quickbooks.api.intuit.com";

/// Top-level runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Master secret the token encryption key is derived from.
    pub master_secret: String,
    /// SQLite database path for the token store.
    pub database_path: String,
    pub tenant_id: String,
    pub requests_per_minute: u32,
    pub request_timeout_secs: u64,
    pub quickbooks: Option<ProviderSettings>,
}

/// Per-provider OAuth2 credentials and endpoints.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub provider: String,
    pub client_id: String,
    pub client_secret: String,
    pub token_endpoint: String,
    pub api_base_url: String,
    pub realm_id: Option<String>,
    /// Legacy tokens from the environment, migrated into the store once.
    pub env_access_token: Option<String>,
    pub env_refresh_token: Option<String>,
}

impl Settings {
    /// Build from env vars, falling back to defaults for everything except
    /// the master secret.
    pub fn from_env() -> Result<Self> {
        let master_secret = std::env::var("LEDGERSYNC_MASTER_SECRET")
            .context("LEDGERSYNC_MASTER_SECRET must be set")?;

        let database_path =
            std::env::var("LEDGERSYNC_DB_PATH").unwrap_or_else(|_| "ledgersync.db".to_string());
        let tenant_id =
            std::env::var("LEDGERSYNC_TENANT_ID").unwrap_or_else(|_| DEFAULT_TENANT.to_string());

        let mut requests_per_minute = crate::client::DEFAULT_REQUESTS_PER_MINUTE;
        if let Ok(v) = std::env::var("LEDGERSYNC_RATE_LIMIT_PER_MINUTE") {
            if let Ok(n) = v.parse::<u32>() {
                requests_per_minute = n;
            }
        }

        let mut request_timeout_secs = 30;
        if let Ok(v) = std::env::var("LEDGERSYNC_REQUEST_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                request_timeout_secs = n;
            }
        }

        let quickbooks = match (
            std::env::var("LEDGERSYNC_QBO_CLIENT_ID"),
            std::env::var("LEDGERSYNC_QBO_CLIENT_SECRET"),
        ) {
            (Ok(client_id), Ok(client_secret)) => Some(ProviderSettings {
                provider: "quickbooks".to_string(),
                client_id,
                client_secret,
                token_endpoint: std::env::var("LEDGERSYNC_QBO_TOKEN_ENDPOINT")
                    .unwrap_or_else(|_| DEFAULT_QBO_TOKEN_ENDPOINT.to_string()),
                api_base_url: std::env::var("LEDGERSYNC_QBO_API_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_QBO_API_BASE_URL.to_string()),
                realm_id: std::env::var("LEDGERSYNC_QBO_REALM_ID").ok(),
                env_access_token: std::env::var("LEDGERSYNC_QBO_ACCESS_TOKEN").ok(),
                env_refresh_token: std::env::var("LEDGERSYNC_QBO_REFRESH_TOKEN").ok(),
            }),
            _ => None,
        };

        Ok(Self {
            master_secret,
            database_path,
            tenant_id,
            requests_per_minute,
            request_timeout_secs,
            quickbooks,
        })
    }

    /// Refresh configs for every provider with credentials present.
    pub fn refresh_configs(&self) -> Vec<RefreshConfig> {
        self.quickbooks
            .iter()
            .map(|p| {
                let mut config = RefreshConfig::new(
                    p.provider.clone(),
                    p.client_id.clone(),
                    p.client_secret.clone(),
                    p.token_endpoint.clone(),
                );
                config.tenant_id = self.tenant_id.clone();
                config.env_tokens = p.env_access_token.as_ref().map(|access| EnvTokens {
                    access_token: access.clone(),
                    refresh_token: p.env_refresh_token.clone(),
                    realm_id: p.realm_id.clone(),
                });
                config
            })
            .collect()
    }

    /// Client tuning for a provider API at `base_url`.
    pub fn client_options(&self, base_url: impl Into<String>) -> crate::client::ClientOptions {
        let mut options = crate::client::ClientOptions::new(base_url);
        options.requests_per_minute = self.requests_per_minute;
        options.request_timeout_secs = self.request_timeout_secs;
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_configs_carry_env_tokens() {
        let settings = Settings {
            master_secret: "secret".to_string(),
            database_path: ":memory:".to_string(),
            tenant_id: "acme".to_string(),
            requests_per_minute: 500,
            request_timeout_secs: 30,
            quickbooks: Some(ProviderSettings {
                provider: "quickbooks".to_string(),
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                token_endpoint: DEFAULT_QBO_TOKEN_ENDPOINT.to_string(),
                api_base_url: DEFAULT_QBO_API_BASE_URL.to_string(),
                realm_id: Some("1234567890".to_string()),
                env_access_token: Some("legacy-access-token-0001".to_string()),
                env_refresh_token: Some("legacy-refresh-token-001".to_string()),
            }),
        };

        let configs = settings.refresh_configs();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].provider, "quickbooks");
        assert_eq!(configs[0].tenant_id, "acme");
        let env = configs[0].env_tokens.as_ref().unwrap();
        assert_eq!(env.access_token, "legacy-access-token-0001");
        assert_eq!(env.realm_id.as_deref(), Some("1234567890"));

        let options = settings.client_options(DEFAULT_QBO_API_BASE_URL);
        assert_eq!(options.base_url, DEFAULT_QBO_API_BASE_URL);
        assert_eq!(options.requests_per_minute, 500);
        assert_eq!(options.request_timeout_secs, 30);
    }

    #[test]
    fn test_no_provider_without_credentials() {
        let settings = Settings {
            master_secret: "secret".to_string(),
            database_path: ":memory:".to_string(),
            tenant_id: DEFAULT_TENANT.to_string(),
            requests_per_minute: 500,
            request_timeout_secs: 30,
            quickbooks: None,
        };
        assert!(settings.refresh_configs().is_empty());
    }
}
