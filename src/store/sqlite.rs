//! SQLite-backed encrypted token store.
//!
//! # Schema
//! ```sql
//! CREATE TABLE oauth_tokens (
//!     id INTEGER PRIMARY KEY,
//!     provider TEXT NOT NULL,
//!     tenant_id TEXT NOT NULL,
//!     access_token TEXT NOT NULL,        -- "<ciphertext>:<authTag>"
//!     refresh_token TEXT,                -- "<ciphertext>:<authTag>"
//!     token_type TEXT NOT NULL,
//!     expires_at TEXT NOT NULL,
//!     refresh_token_expires_at TEXT,
//!     scope TEXT,
//!     realm_id TEXT,
//!     company_id TEXT,
//!     encryption_iv TEXT NOT NULL,       -- shared by both ciphertexts
//!     last_refreshed_at TEXT,
//!     refresh_count INTEGER NOT NULL,
//!     failed_refresh_count INTEGER NOT NULL,
//!     last_refresh_error TEXT,
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL,
//!     UNIQUE(provider, tenant_id)
//! );
//! ```
//!
//! # Thread safety
//! - Connection is wrapped in Mutex for safe concurrent access
//! - The upsert is a single conditional statement, so concurrent writers for
//!   one `(provider, tenant_id)` cannot interleave into a record whose
//!   ciphertexts and IV disagree

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::{
    cache_key, validate_token_format, CachedTokenMeta, StoredTokens, TokenCache, TokenSet,
    TokenStorageConfig, TokenUpdate, DEFAULT_ACCESS_TTL_SECS, DEFAULT_REFRESH_TTL_SECS,
    EXPIRY_BUFFER_SECS,
};
use crate::clock::Clock;
use crate::crypto::{mask_token, TokenCrypto};
use crate::error::{Error, Result};

/// Encrypted OAuth token storage, one row per `(provider, tenant_id)`.
pub struct TokenStore {
    conn: Mutex<Connection>,
    crypto: Arc<TokenCrypto>,
    clock: Arc<dyn Clock>,
    cache: Option<Arc<dyn TokenCache>>,
}

impl TokenStore {
    /// Create or open a token store at `db_path`.
    pub fn new<P: AsRef<Path>>(
        db_path: P,
        crypto: Arc<TokenCrypto>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            crypto,
            clock,
            cache: None,
        })
    }

    /// In-memory store, used by tests and the maintenance binary's dry runs.
    pub fn in_memory(crypto: Arc<TokenCrypto>, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            crypto,
            clock,
            cache: None,
        })
    }

    /// Attach a metadata cache. The cache only ever receives masked tokens.
    pub fn with_cache(mut self, cache: Arc<dyn TokenCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_tokens (
                id INTEGER PRIMARY KEY,
                provider TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                token_type TEXT NOT NULL DEFAULT 'Bearer',
                expires_at TEXT NOT NULL,
                refresh_token_expires_at TEXT,
                scope TEXT,
                realm_id TEXT,
                company_id TEXT,
                encryption_iv TEXT NOT NULL,
                last_refreshed_at TEXT,
                refresh_count INTEGER NOT NULL DEFAULT 0,
                failed_refresh_count INTEGER NOT NULL DEFAULT 0,
                last_refresh_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(provider, tenant_id)
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_provider_tenant ON oauth_tokens(provider, tenant_id)",
            [],
        )?;
        Ok(())
    }

    /// Validate, encrypt, and upsert a token set.
    ///
    /// Both ciphertexts share one freshly generated IV so the record stays
    /// internally consistent. On conflict the existing row is replaced in a
    /// single statement: `refresh_count` increments, failure telemetry clears.
    pub fn save_tokens(&self, tokens: &TokenSet, cfg: &TokenStorageConfig) -> Result<()> {
        validate_token_format(&tokens.access_token, "access_token")?;
        if let Some(refresh) = &tokens.refresh_token {
            validate_token_format(refresh, "refresh_token")?;
        }

        let now = self.clock.now();
        let expires_at =
            now + Duration::seconds(tokens.expires_in_secs.unwrap_or(DEFAULT_ACCESS_TTL_SECS));
        let refresh_expires_at = tokens.refresh_token.as_ref().map(|_| {
            now + Duration::seconds(
                tokens
                    .refresh_expires_in_secs
                    .unwrap_or(DEFAULT_REFRESH_TTL_SECS),
            )
        });

        let iv = self.crypto.generate_iv();
        let access_env = self.crypto.encrypt_with_iv(&tokens.access_token, &iv)?;
        let refresh_blob = tokens
            .refresh_token
            .as_ref()
            .map(|t| self.crypto.encrypt_with_iv(t, &iv))
            .transpose()?
            .map(|env| format!("{}:{}", env.ciphertext, env.tag));

        let token_type = tokens.token_type.clone().unwrap_or_else(|| "Bearer".into());
        let now_str = now.to_rfc3339();

        self.conn.lock().unwrap().execute(
            r#"
            INSERT INTO oauth_tokens (
                provider, tenant_id,
                access_token, refresh_token, token_type,
                expires_at, refresh_token_expires_at,
                scope, realm_id, company_id, encryption_iv,
                last_refreshed_at, refresh_count, failed_refresh_count, last_refresh_error,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL, 0, 0, NULL, ?12, ?12)
            ON CONFLICT(provider, tenant_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_type = excluded.token_type,
                expires_at = excluded.expires_at,
                refresh_token_expires_at = excluded.refresh_token_expires_at,
                scope = excluded.scope,
                realm_id = excluded.realm_id,
                company_id = excluded.company_id,
                encryption_iv = excluded.encryption_iv,
                last_refreshed_at = excluded.updated_at,
                refresh_count = refresh_count + 1,
                failed_refresh_count = 0,
                last_refresh_error = NULL,
                updated_at = excluded.updated_at
            "#,
            params![
                cfg.provider,
                cfg.tenant_id,
                format!("{}:{}", access_env.ciphertext, access_env.tag),
                refresh_blob,
                token_type,
                expires_at.to_rfc3339(),
                refresh_expires_at.map(|t| t.to_rfc3339()),
                tokens.scope,
                tokens.realm_id,
                tokens.company_id,
                iv,
                now_str,
            ],
        )?;

        debug!(
            provider = %cfg.provider,
            tenant = %cfg.tenant_id,
            access_token = %mask_token(&tokens.access_token, 4),
            "saved tokens"
        );

        if cfg.use_cache {
            self.write_cache_meta(cfg, tokens, expires_at);
        }

        Ok(())
    }

    /// Read and decrypt the record for this provider/tenant.
    ///
    /// The cache is consulted first when enabled, but cached entries carry no
    /// secrets, so a hit only confirms existence; tokens always come from the
    /// decrypted row.
    pub fn get_tokens(&self, cfg: &TokenStorageConfig) -> Result<Option<StoredTokens>> {
        if cfg.use_cache {
            if let Some(cache) = &self.cache {
                if cache.get(&cache_key(&cfg.provider, &cfg.tenant_id)).is_some() {
                    debug!(
                        provider = %cfg.provider,
                        tenant = %cfg.tenant_id,
                        "cache hit (metadata only), reading secrets from storage"
                    );
                }
            }
        }

        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                r#"
                SELECT access_token, refresh_token, token_type,
                       expires_at, refresh_token_expires_at,
                       scope, realm_id, company_id, encryption_iv,
                       last_refreshed_at, refresh_count, failed_refresh_count, last_refresh_error
                FROM oauth_tokens
                WHERE provider = ?1 AND tenant_id = ?2
                "#,
                params![cfg.provider, cfg.tenant_id],
                |row| {
                    Ok(RawRow {
                        access_token: row.get(0)?,
                        refresh_token: row.get(1)?,
                        token_type: row.get(2)?,
                        expires_at: row.get(3)?,
                        refresh_token_expires_at: row.get(4)?,
                        scope: row.get(5)?,
                        realm_id: row.get(6)?,
                        company_id: row.get(7)?,
                        encryption_iv: row.get(8)?,
                        last_refreshed_at: row.get(9)?,
                        refresh_count: row.get(10)?,
                        failed_refresh_count: row.get(11)?,
                        last_refresh_error: row.get(12)?,
                    })
                },
            )
            .optional()?;
        drop(conn);

        row.map(|raw| self.decrypt_row(raw)).transpose()
    }

    /// Partial update. Fields present in `update` replace stored values; the
    /// rest are decrypted and re-enveloped unchanged under one fresh IV, so
    /// the record's single-IV invariant holds across the rewrite.
    pub fn update_tokens(&self, update: &TokenUpdate, cfg: &TokenStorageConfig) -> Result<()> {
        let current = self.get_tokens(cfg)?.ok_or_else(|| Error::NoTokens {
            provider: cfg.provider.clone(),
            tenant_id: cfg.tenant_id.clone(),
        })?;

        if let Some(token) = &update.access_token {
            validate_token_format(token, "access_token")?;
        }
        if let Some(token) = &update.refresh_token {
            validate_token_format(token, "refresh_token")?;
        }

        let now = self.clock.now();
        let access_token = update
            .access_token
            .clone()
            .unwrap_or(current.access_token);
        let refresh_token = update
            .refresh_token
            .clone()
            .or(current.refresh_token);
        let expires_at = match update.expires_in_secs {
            Some(secs) => now + Duration::seconds(secs),
            None => current.expires_at,
        };
        let refresh_expires_at = match update.refresh_expires_in_secs {
            Some(secs) => Some(now + Duration::seconds(secs)),
            None => current.refresh_token_expires_at,
        };

        let iv = self.crypto.generate_iv();
        let access_env = self.crypto.encrypt_with_iv(&access_token, &iv)?;
        let refresh_blob = refresh_token
            .as_ref()
            .map(|t| self.crypto.encrypt_with_iv(t, &iv))
            .transpose()?
            .map(|env| format!("{}:{}", env.ciphertext, env.tag));

        let affected = self.conn.lock().unwrap().execute(
            r#"
            UPDATE oauth_tokens SET
                access_token = ?3,
                refresh_token = ?4,
                expires_at = ?5,
                refresh_token_expires_at = ?6,
                scope = COALESCE(?7, scope),
                realm_id = COALESCE(?8, realm_id),
                company_id = COALESCE(?9, company_id),
                encryption_iv = ?10,
                updated_at = ?11
            WHERE provider = ?1 AND tenant_id = ?2
            "#,
            params![
                cfg.provider,
                cfg.tenant_id,
                format!("{}:{}", access_env.ciphertext, access_env.tag),
                refresh_blob,
                expires_at.to_rfc3339(),
                refresh_expires_at.map(|t| t.to_rfc3339()),
                update.scope,
                update.realm_id,
                update.company_id,
                iv,
                now.to_rfc3339(),
            ],
        )?;

        if affected == 0 {
            return Err(Error::NoTokens {
                provider: cfg.provider.clone(),
                tenant_id: cfg.tenant_id.clone(),
            });
        }

        if cfg.use_cache {
            if let Some(cache) = &self.cache {
                cache.del(&cache_key(&cfg.provider, &cfg.tenant_id));
            }
        }

        Ok(())
    }

    /// Remove the record and invalidate its cache entry.
    pub fn delete_tokens(&self, cfg: &TokenStorageConfig) -> Result<bool> {
        let affected = self.conn.lock().unwrap().execute(
            "DELETE FROM oauth_tokens WHERE provider = ?1 AND tenant_id = ?2",
            params![cfg.provider, cfg.tenant_id],
        )?;

        if let Some(cache) = &self.cache {
            cache.del(&cache_key(&cfg.provider, &cfg.tenant_id));
        }

        Ok(affected > 0)
    }

    /// Record a failed refresh attempt. No-op when the record is gone.
    pub fn record_refresh_failure(&self, error: &str, cfg: &TokenStorageConfig) -> Result<()> {
        self.conn.lock().unwrap().execute(
            r#"
            UPDATE oauth_tokens SET
                failed_refresh_count = failed_refresh_count + 1,
                last_refresh_error = ?3,
                updated_at = ?4
            WHERE provider = ?1 AND tenant_id = ?2
            "#,
            params![
                cfg.provider,
                cfg.tenant_id,
                error,
                self.clock.now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// True when the access token expires within the 5-minute safety buffer.
    ///
    /// Fail-safe: a missing record or any read error reports expired.
    pub fn is_token_expired(&self, cfg: &TokenStorageConfig) -> bool {
        match self.get_token_expiry(cfg) {
            Ok(Some(expires_at)) => {
                self.clock.now() >= expires_at - Duration::seconds(EXPIRY_BUFFER_SECS)
            }
            Ok(None) => true,
            Err(err) => {
                warn!(
                    provider = %cfg.provider,
                    tenant = %cfg.tenant_id,
                    error = %err,
                    "expiry check failed, treating token as expired"
                );
                true
            }
        }
    }

    /// Access token expiry, if a record exists.
    pub fn get_token_expiry(&self, cfg: &TokenStorageConfig) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let expires_at: Option<String> = conn
            .query_row(
                "SELECT expires_at FROM oauth_tokens WHERE provider = ?1 AND tenant_id = ?2",
                params![cfg.provider, cfg.tenant_id],
                |row| row.get(0),
            )
            .optional()?;

        expires_at
            .map(|s| parse_timestamp(&s))
            .transpose()
    }

    fn decrypt_row(&self, raw: RawRow) -> Result<StoredTokens> {
        let (access_ct, access_tag) = split_envelope(&raw.access_token)?;
        let access_token = self
            .crypto
            .decrypt(access_ct, &raw.encryption_iv, access_tag)?;

        let refresh_token = raw
            .refresh_token
            .as_deref()
            .map(|blob| {
                let (ct, tag) = split_envelope(blob)?;
                self.crypto.decrypt(ct, &raw.encryption_iv, tag)
            })
            .transpose()?;

        Ok(StoredTokens {
            access_token,
            refresh_token,
            token_type: raw.token_type,
            expires_at: parse_timestamp(&raw.expires_at)?,
            refresh_token_expires_at: raw
                .refresh_token_expires_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            scope: raw.scope,
            realm_id: raw.realm_id,
            company_id: raw.company_id,
            last_refreshed_at: raw
                .last_refreshed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            refresh_count: raw.refresh_count,
            failed_refresh_count: raw.failed_refresh_count,
            last_refresh_error: raw.last_refresh_error,
        })
    }

    fn write_cache_meta(&self, cfg: &TokenStorageConfig, tokens: &TokenSet, expires_at: DateTime<Utc>) {
        if let Some(cache) = &self.cache {
            let meta = CachedTokenMeta {
                access_token_masked: mask_token(&tokens.access_token, 4),
                refresh_token_masked: tokens.refresh_token.as_deref().map(|t| mask_token(t, 4)),
                expires_at,
                cached_at: self.clock.now(),
            };
            cache.setex(
                &cache_key(&cfg.provider, &cfg.tenant_id),
                meta,
                cfg.cache_expiry_secs,
            );
        }
    }
}

struct RawRow {
    access_token: String,
    refresh_token: Option<String>,
    token_type: String,
    expires_at: String,
    refresh_token_expires_at: Option<String>,
    scope: Option<String>,
    realm_id: Option<String>,
    company_id: Option<String>,
    encryption_iv: String,
    last_refreshed_at: Option<String>,
    refresh_count: i64,
    failed_refresh_count: i64,
    last_refresh_error: Option<String>,
}

/// Split a stored `<ciphertext>:<authTag>` blob.
fn split_envelope(blob: &str) -> Result<(&str, &str)> {
    blob.split_once(':')
        .ok_or_else(|| Error::Storage("malformed token envelope in storage".to_string()))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("invalid timestamp in storage: {e}")))
}
