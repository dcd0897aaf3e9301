//! Token lifecycle orchestration.
//!
//! The [`TokenManager`] is the single source of truth for "what is the
//! current valid access token for provider X" and the only component allowed
//! to trigger a refresh. Refreshes are single-flight per `(provider,
//! tenant_id)`: concurrent callers share one in-progress refresh instead of
//! issuing duplicates, because a provider refresh token is often single-use
//! and a duplicate refresh can invalidate it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::Duration;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

mod breaker;
mod refresh;

pub use breaker::{
    CircuitBreaker, CircuitStatus, Decision, DEFAULT_COOLDOWN_SECS, DEFAULT_FAILURE_THRESHOLD,
};
pub use refresh::{EnvTokens, RefreshConfig};

use crate::clock::Clock;
use crate::crypto::mask_token;
use crate::error::{Error, Result};
use crate::store::{StoredTokens, TokenSet, TokenStorageConfig, TokenStore};

/// Fixed timeout for token endpoint calls.
const REFRESH_REQUEST_TIMEOUT_SECS: u64 = 30;

type SharedRefresh = Shared<BoxFuture<'static, std::result::Result<StoredTokens, Arc<Error>>>>;

/// Manager-level tuning. Defaults match the breaker module's constants.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: i64,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            breaker_threshold: DEFAULT_FAILURE_THRESHOLD,
            breaker_cooldown_secs: DEFAULT_COOLDOWN_SECS,
        }
    }
}

/// Orchestrates refresh-before-expiry, single-flight refresh, retry with
/// backoff, and a per-provider/tenant circuit breaker.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<TokenStore>,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    configs: Mutex<HashMap<String, RefreshConfig>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    in_flight: Mutex<HashMap<String, SharedRefresh>>,
    options: ManagerOptions,
    shut_down: AtomicBool,
}

impl TokenManager {
    pub fn new(store: Arc<TokenStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_options(store, clock, ManagerOptions::default())
    }

    pub fn with_options(
        store: Arc<TokenStore>,
        clock: Arc<dyn Clock>,
        options: ManagerOptions,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(REFRESH_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                http,
                clock,
                configs: Mutex::new(HashMap::new()),
                breakers: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                options,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Register provider/tenant configs and migrate any environment-provided
    /// legacy tokens into the store (idempotent: skipped when a record
    /// already exists).
    pub fn initialize(&self, configs: Vec<RefreshConfig>) -> Result<()> {
        for config in configs {
            self.migrate_env_tokens(&config)?;
            let key = config.key();
            info!(provider = %config.provider, tenant = %config.tenant_id, "registered refresh config");
            self.inner.configs.lock().unwrap().insert(key, config);
        }
        Ok(())
    }

    /// One-time migration of env-provided tokens. Returns true if a record
    /// was written.
    pub fn migrate_env_tokens(&self, config: &RefreshConfig) -> Result<bool> {
        let Some(env) = &config.env_tokens else {
            return Ok(false);
        };
        let scfg = storage_config(config);
        if self.inner.store.get_tokens(&scfg)?.is_some() {
            debug!(provider = %config.provider, "stored tokens exist, skipping env migration");
            return Ok(false);
        }

        let mut tokens = TokenSet::new(env.access_token.clone());
        tokens.refresh_token = env.refresh_token.clone();
        tokens.realm_id = env.realm_id.clone();
        self.inner.store.save_tokens(&tokens, &scfg)?;
        info!(
            provider = %config.provider,
            tenant = %config.tenant_id,
            access_token = %mask_token(&env.access_token, 4),
            "migrated environment tokens into store"
        );
        Ok(true)
    }

    /// Current valid access token, refreshing first if the stored one is due
    /// to expire and auto-refresh is enabled for this provider.
    pub async fn get_access_token(&self, provider: &str, tenant_id: &str) -> Result<String> {
        self.ensure_running()?;
        let config = self.config_for(provider, tenant_id)?;
        let scfg = storage_config(&config);

        if config.enable_auto_refresh && self.token_needs_refresh(&config, &scfg) {
            self.refresh_token(provider, tenant_id).await?;
        }

        match self.inner.store.get_tokens(&scfg)? {
            Some(stored) => Ok(stored.access_token),
            None => Err(Error::NoTokens {
                provider: provider.to_string(),
                tenant_id: tenant_id.to_string(),
            }),
        }
    }

    /// Refresh the stored tokens, sharing one in-flight refresh among all
    /// concurrent callers for this provider/tenant.
    pub async fn refresh_token(&self, provider: &str, tenant_id: &str) -> Result<StoredTokens> {
        self.ensure_running()?;
        let key = format!("{provider}:{tenant_id}");

        let fut = {
            let mut in_flight = self.inner.in_flight.lock().unwrap();
            if let Some(existing) = in_flight.get(&key) {
                debug!(key = %key, "joining in-flight refresh");
                existing.clone()
            } else {
                let inner = self.inner.clone();
                let fut_key = key.clone();
                let fut: SharedRefresh = async move {
                    let result = Inner::do_refresh(&inner, &fut_key).await.map_err(Arc::new);
                    // Always clear the entry once settled, success or failure.
                    inner.in_flight.lock().unwrap().remove(&fut_key);
                    result
                }
                .boxed()
                .shared();
                in_flight.insert(key, fut.clone());
                fut
            }
        };

        fut.await.map_err(|err| match Arc::try_unwrap(err) {
            // Sole caller: hand back the typed error directly.
            Ok(inner) => inner,
            Err(shared) => Error::Shared(shared),
        })
    }

    /// Exchange an authorization code for tokens and persist them.
    pub async fn exchange_authorization_code(
        &self,
        provider: &str,
        tenant_id: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<StoredTokens> {
        self.ensure_running()?;
        let config = self.config_for(provider, tenant_id)?;
        let scfg = storage_config(&config);

        let tokens =
            refresh::exchange_authorization_code(&self.inner.http, &config, code, redirect_uri)
                .await?;
        self.inner.store.save_tokens(&tokens, &scfg)?;

        self.inner.store.get_tokens(&scfg)?.ok_or(Error::NoTokens {
            provider: provider.to_string(),
            tenant_id: tenant_id.to_string(),
        })
    }

    /// Explicit revocation: delete the stored record.
    pub fn revoke(&self, provider: &str, tenant_id: &str) -> Result<bool> {
        self.ensure_running()?;
        let config = self.config_for(provider, tenant_id)?;
        self.inner.store.delete_tokens(&storage_config(&config))
    }

    /// Stop accepting new operations. In-flight refreshes settle on their
    /// own; HTTP calls already sent are allowed to complete so storage is
    /// never left ambiguous.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        info!("token manager shut down");
    }

    /// Breaker status, for operational introspection.
    pub fn circuit_status(&self, provider: &str, tenant_id: &str) -> Option<CircuitStatus> {
        let key = format!("{provider}:{tenant_id}");
        self.inner
            .breakers
            .lock()
            .unwrap()
            .get(&key)
            .map(|b| b.status())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(Error::ManagerShutdown);
        }
        Ok(())
    }

    fn config_for(&self, provider: &str, tenant_id: &str) -> Result<RefreshConfig> {
        self.inner
            .configs
            .lock()
            .unwrap()
            .get(&format!("{provider}:{tenant_id}"))
            .cloned()
            .ok_or_else(|| Error::NotConfigured {
                provider: provider.to_string(),
                tenant_id: tenant_id.to_string(),
            })
    }

    /// Expiry check against the config's preemptive-refresh window.
    /// Fail-safe: missing record or read error reports "needs refresh".
    fn token_needs_refresh(&self, config: &RefreshConfig, scfg: &TokenStorageConfig) -> bool {
        match self.inner.store.get_token_expiry(scfg) {
            Ok(Some(expires_at)) => {
                let threshold = expires_at - Duration::minutes(config.refresh_before_expiry_mins);
                self.inner.clock.now() >= threshold
            }
            Ok(None) => true,
            Err(_) => true,
        }
    }
}

impl Inner {
    fn breaker_for(self: &Arc<Self>, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_settings(
                    self.clock.clone(),
                    self.options.breaker_threshold,
                    self.options.breaker_cooldown_secs,
                ))
            })
            .clone()
    }

    /// The actual refresh procedure: breaker gate, HTTP call, persistence,
    /// retry with exponential backoff.
    async fn do_refresh(self: &Arc<Self>, key: &str) -> Result<StoredTokens> {
        let config = self
            .configs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| {
                let (provider, tenant_id) = split_key(key);
                Error::NotConfigured {
                    provider,
                    tenant_id,
                }
            })?;
        let scfg = storage_config(&config);
        let breaker = self.breaker_for(key);

        let mut attempt: u32 = 0;
        loop {
            if config.enable_circuit_breaker && breaker.check() == Decision::Reject {
                return Err(Error::CircuitOpen {
                    provider: config.provider.clone(),
                    tenant_id: config.tenant_id.clone(),
                });
            }

            // Read the current record. Failures here never reached the
            // network, so they are no verdict on provider health: an admitted
            // HALF_OPEN trial must be given back, not left leased forever.
            let read = self.store.get_tokens(&scfg).and_then(|row| {
                let current = row.ok_or_else(|| Error::NoTokens {
                    provider: config.provider.clone(),
                    tenant_id: config.tenant_id.clone(),
                })?;
                let refresh_token =
                    current
                        .refresh_token
                        .clone()
                        .ok_or_else(|| Error::RefreshFailed {
                            provider: config.provider.clone(),
                            tenant_id: config.tenant_id.clone(),
                            cause: "no refresh token on record".to_string(),
                        })?;
                Ok((current, refresh_token))
            });
            let (current, refresh_token) = match read {
                Ok(pair) => pair,
                Err(err) => {
                    if config.enable_circuit_breaker {
                        breaker.release_trial();
                    }
                    return Err(err);
                }
            };

            match refresh::refresh_access_token(&self.http, &config, &refresh_token).await {
                Ok(mut tokens) => {
                    if config.enable_circuit_breaker {
                        breaker.record_success();
                    }
                    // Rotate the refresh token only when the provider issued
                    // a new one; otherwise the prior token stays valid.
                    if tokens.refresh_token.is_none() {
                        tokens.refresh_token = Some(refresh_token);
                        tokens.refresh_expires_in_secs = None;
                    }
                    // Provider identifiers rarely come back on refresh; keep
                    // what the record already knows.
                    tokens.realm_id = tokens.realm_id.or(current.realm_id);
                    tokens.company_id = tokens.company_id.or(current.company_id);
                    tokens.scope = tokens.scope.or(current.scope);

                    self.store.save_tokens(&tokens, &scfg)?;
                    info!(
                        provider = %config.provider,
                        tenant = %config.tenant_id,
                        access_token = %mask_token(&tokens.access_token, 4),
                        "token refresh succeeded"
                    );

                    return self.store.get_tokens(&scfg)?.ok_or(Error::NoTokens {
                        provider: config.provider.clone(),
                        tenant_id: config.tenant_id.clone(),
                    });
                }
                Err(err) => {
                    if config.enable_circuit_breaker {
                        breaker.record_failure();
                    }
                    if let Err(telemetry_err) =
                        self.store.record_refresh_failure(&err.to_string(), &scfg)
                    {
                        warn!(error = %telemetry_err, "failed to record refresh failure");
                    }

                    if attempt < config.max_retries && refresh::is_retriable(&err) {
                        let delay = config.retry_delay_ms.saturating_mul(1 << attempt);
                        warn!(
                            provider = %config.provider,
                            attempt,
                            delay_ms = delay,
                            error = %err,
                            "token refresh failed, retrying"
                        );
                        tokio::time::sleep(StdDuration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(Error::RefreshFailed {
                        provider: config.provider.clone(),
                        tenant_id: config.tenant_id.clone(),
                        cause: err.to_string(),
                    });
                }
            }
        }
    }
}

fn storage_config(config: &RefreshConfig) -> TokenStorageConfig {
    TokenStorageConfig::new(config.provider.clone()).with_tenant(config.tenant_id.clone())
}

fn split_key(key: &str) -> (String, String) {
    match key.split_once(':') {
        Some((provider, tenant)) => (provider.to_string(), tenant.to_string()),
        None => (key.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::TokenCrypto;
    use chrono::Utc;

    fn manager() -> (TokenManager, Arc<TokenStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let crypto = Arc::new(TokenCrypto::new("test-master-secret").unwrap());
        let store = Arc::new(TokenStore::in_memory(crypto, clock.clone()).unwrap());
        let manager = TokenManager::new(store.clone(), clock.clone()).unwrap();
        (manager, store, clock)
    }

    fn config_for_endpoint(endpoint: &str) -> RefreshConfig {
        RefreshConfig::new("quickbooks", "client-id", "client-secret", endpoint)
    }

    fn seed_tokens(store: &TokenStore, expires_in_secs: i64) {
        let mut tokens = TokenSet::new("seed-access-token-000001");
        tokens.refresh_token = Some("seed-refresh-token-00001".to_string());
        tokens.expires_in_secs = Some(expires_in_secs);
        store
            .save_tokens(&tokens, &TokenStorageConfig::new("quickbooks"))
            .unwrap();
    }

    #[tokio::test]
    async fn test_env_migration_is_idempotent() {
        let (manager, store, _) = manager();
        let mut config = config_for_endpoint("http://unused.invalid/tokens");
        config.env_tokens = Some(EnvTokens {
            access_token: "legacy-access-token-0001".to_string(),
            refresh_token: Some("legacy-refresh-token-001".to_string()),
            realm_id: Some("1234567890".to_string()),
        });

        manager.initialize(vec![config.clone()]).unwrap();
        assert!(!manager.migrate_env_tokens(&config).unwrap());

        let stored = store
            .get_tokens(&TokenStorageConfig::new("quickbooks"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.access_token, "legacy-access-token-0001");
        // refresh_count still 0: the second initialize did not re-upsert.
        assert_eq!(stored.refresh_count, 0);
    }

    #[tokio::test]
    async fn test_get_access_token_returns_stored_when_valid() {
        let (manager, store, _) = manager();
        manager
            .initialize(vec![config_for_endpoint("http://unused.invalid/tokens")])
            .unwrap();
        seed_tokens(&store, 3600);

        let token = manager
            .get_access_token("quickbooks", "default")
            .await
            .unwrap();
        assert_eq!(token, "seed-access-token-000001");
    }

    #[tokio::test]
    async fn test_unconfigured_provider_rejected() {
        let (manager, _, _) = manager();
        let err = manager
            .get_access_token("quickbooks", "default")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_fails_fast() {
        let (manager, store, _) = manager();
        manager
            .initialize(vec![config_for_endpoint("http://unused.invalid/tokens")])
            .unwrap();
        seed_tokens(&store, 3600);

        manager.shutdown();
        let err = manager
            .get_access_token("quickbooks", "default")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManagerShutdown));
        let err = manager.refresh_token("quickbooks", "default").await.unwrap_err();
        assert!(matches!(err, Error::ManagerShutdown));
    }

    #[tokio::test]
    async fn test_refresh_rotates_when_provider_returns_new_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/tokens")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "access_token": "rotated-access-token-0001",
                    "refresh_token": "rotated-refresh-token-001",
                    "expires_in": 3600,
                    "x_refresh_token_expires_in": 8726400
                }"#,
            )
            .create_async()
            .await;

        let (manager, store, _) = manager();
        manager
            .initialize(vec![config_for_endpoint(&format!("{}/tokens", server.url()))])
            .unwrap();
        seed_tokens(&store, 60);

        let stored = manager.refresh_token("quickbooks", "default").await.unwrap();
        assert_eq!(stored.access_token, "rotated-access-token-0001");
        assert_eq!(stored.refresh_token.as_deref(), Some("rotated-refresh-token-001"));
        assert_eq!(stored.refresh_count, 1);
    }

    #[tokio::test]
    async fn test_refresh_retains_prior_refresh_token_when_not_rotated() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/tokens")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "fresh-access-token-00001", "expires_in": 3600}"#)
            .create_async()
            .await;

        let (manager, store, _) = manager();
        manager
            .initialize(vec![config_for_endpoint(&format!("{}/tokens", server.url()))])
            .unwrap();
        seed_tokens(&store, 60);

        let stored = manager.refresh_token("quickbooks", "default").await.unwrap();
        assert_eq!(stored.access_token, "fresh-access-token-00001");
        assert_eq!(stored.refresh_token.as_deref(), Some("seed-refresh-token-00001"));
    }

    #[tokio::test]
    async fn test_refresh_failure_updates_telemetry() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/tokens")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error": "invalid_grant"}"#)
            .create_async()
            .await;

        let (manager, store, _) = manager();
        let mut config = config_for_endpoint(&format!("{}/tokens", server.url()));
        config.max_retries = 0;
        manager.initialize(vec![config]).unwrap();
        seed_tokens(&store, 60);

        let err = manager.refresh_token("quickbooks", "default").await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailed { .. } | Error::Shared(_)));

        let stored = store
            .get_tokens(&TokenStorageConfig::new("quickbooks"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.failed_refresh_count, 1);
        assert!(stored.last_refresh_error.is_some());
    }

    #[tokio::test]
    async fn test_refresh_without_stored_tokens_fails() {
        let (manager, _, _) = manager();
        manager
            .initialize(vec![config_for_endpoint("http://unused.invalid/tokens")])
            .unwrap();

        let err = manager.refresh_token("quickbooks", "default").await.unwrap_err();
        assert!(matches!(err, Error::Shared(_) | Error::NoTokens { .. }));
    }

    #[tokio::test]
    async fn test_revoke_deletes_record() {
        let (manager, store, _) = manager();
        manager
            .initialize(vec![config_for_endpoint("http://unused.invalid/tokens")])
            .unwrap();
        seed_tokens(&store, 3600);

        assert!(manager.revoke("quickbooks", "default").unwrap());
        assert!(store
            .get_tokens(&TokenStorageConfig::new("quickbooks"))
            .unwrap()
            .is_none());
    }
}
