use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use ledgersync::clock::SystemClock;
use ledgersync::config::Settings;
use ledgersync::crypto::{mask_token, TokenCrypto};
use ledgersync::manager::TokenManager;
use ledgersync::store::{TokenStorageConfig, TokenStore};

/// Maintenance entry point: opens the token store, migrates any legacy
/// environment tokens, and reports per-provider token status.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledgersync=info".into()),
        )
        .init();

    let settings = Settings::from_env()?;
    info!(db = %settings.database_path, "ledgersync starting");

    let clock = Arc::new(SystemClock);
    let crypto = Arc::new(TokenCrypto::new(&settings.master_secret)?);
    let store = Arc::new(TokenStore::new(
        &settings.database_path,
        crypto,
        clock.clone(),
    )?);

    let manager = TokenManager::new(store.clone(), clock)?;
    let configs = settings.refresh_configs();
    if configs.is_empty() {
        warn!("no provider credentials configured, nothing to manage");
        return Ok(());
    }

    let providers: Vec<(String, String)> = configs
        .iter()
        .map(|c| (c.provider.clone(), c.tenant_id.clone()))
        .collect();
    manager.initialize(configs)?;

    for (provider, tenant_id) in providers {
        let scfg = TokenStorageConfig::new(provider.clone()).with_tenant(tenant_id.clone());
        match store.get_tokens(&scfg)? {
            Some(stored) => info!(
                provider = %provider,
                tenant = %tenant_id,
                access_token = %mask_token(&stored.access_token, 4),
                expires_at = %stored.expires_at,
                refresh_count = stored.refresh_count,
                failed_refresh_count = stored.failed_refresh_count,
                "token status"
            ),
            None => warn!(
                provider = %provider,
                tenant = %tenant_id,
                "no tokens on record; complete the authorization flow first"
            ),
        }
    }

    Ok(())
}
