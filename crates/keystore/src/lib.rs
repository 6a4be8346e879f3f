//! SQL-backed project API keys.
//!
//! Authoritative store for the credential subsystem: one `api_keys` row per
//! project, at most one active at a time. Keys are issued as
//! `sa_live_` + 32 hex chars, stored only as a SHA-256 hash plus a short
//! prefix for operator correlation, and validated by hash lookup. SQLite or
//! Postgres is selected from the DSN scheme.

pub mod error;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{
    any::{AnyPoolOptions, AnyRow},
    AnyPool, Row,
};
use std::sync::Once;
use tracing::warn;

pub use error::{KeyStoreError, Result};

/// Length of the stored plaintext prefix (`sa_live_` + 4 hex chars).
pub const KEY_PREFIX_LEN: usize = 12;

/// Supported database backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseDriver {
    Sqlite,
    Postgres,
}

/// A stored API key row. The hash never leaves this crate.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub project_id: String,
    key_hash: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub description: Option<String>,
}

/// Public view of a key row, safe to serialize into HTTP responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyInfo {
    pub id: i64,
    pub project_id: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<ApiKeyRecord> for ApiKeyInfo {
    fn from(record: ApiKeyRecord) -> Self {
        ApiKeyInfo {
            id: record.id,
            project_id: record.project_id,
            key_prefix: record.key_prefix,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
            is_active: record.is_active,
            created_by: record.created_by,
            description: record.description,
        }
    }
}

/// A freshly issued key. The plaintext exists only here, once.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedKey {
    pub api_key: String,
    #[serde(flatten)]
    pub info: ApiKeyInfo,
}

/// Generate a new plaintext key: `sa_live_` + 32 lowercase hex chars.
pub fn generate_key() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut hex = String::with_capacity(32);
    for b in bytes {
        hex.push_str(&format!("{:02x}", b));
    }
    format!("sa_live_{}", hex)
}

/// SHA-256 hex digest of a plaintext key.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cheap shape check applied before any database lookup.
pub fn valid_key_format(key: &str) -> bool {
    key.starts_with("sa_live_") || key.starts_with("sa_test_")
}

/// Entry point to the API key store.
#[derive(Clone)]
pub struct KeyStore {
    pool: AnyPool,
    driver: DatabaseDriver,
}

impl KeyStore {
    /// Connect to the store and bootstrap the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        static DRIVERS: Once = Once::new();
        DRIVERS.call_once(|| {
            sqlx::any::install_default_drivers();
        });

        let driver = if database_url.starts_with("postgres://")
            || database_url.starts_with("postgresql://")
        {
            DatabaseDriver::Postgres
        } else {
            DatabaseDriver::Sqlite
        };

        // In-memory SQLite must stay on a single connection or each pooled
        // connection sees its own empty database.
        let max_connections = match driver {
            DatabaseDriver::Sqlite if database_url.contains(":memory:") => 1,
            _ => 8,
        };

        let pool = AnyPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let store = Self { pool, driver };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn driver(&self) -> DatabaseDriver {
        self.driver
    }

    async fn ensure_schema(&self) -> Result<()> {
        let ddl = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
                CREATE TABLE IF NOT EXISTS api_keys (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL UNIQUE,
                    key_hash TEXT NOT NULL,
                    key_prefix TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    last_used_at TEXT,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_by TEXT,
                    description TEXT
                )
                "#
            }
            DatabaseDriver::Postgres => {
                r#"
                CREATE TABLE IF NOT EXISTS api_keys (
                    id SERIAL PRIMARY KEY,
                    project_id VARCHAR(64) NOT NULL UNIQUE,
                    key_hash TEXT NOT NULL,
                    key_prefix VARCHAR(20) NOT NULL,
                    created_at TEXT NOT NULL,
                    last_used_at TEXT,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_by TEXT,
                    description TEXT
                )
                "#
            }
        };
        sqlx::query(ddl).execute(&self.pool).await?;

        let prefix_index =
            "CREATE INDEX IF NOT EXISTS idx_api_keys_prefix ON api_keys (key_prefix)";
        sqlx::query(prefix_index).execute(&self.pool).await?;

        // Partial index backing the one-active-key-per-project invariant.
        let active_index = "CREATE UNIQUE INDEX IF NOT EXISTS idx_api_keys_active \
             ON api_keys (project_id) WHERE is_active = 1";
        sqlx::query(active_index).execute(&self.pool).await?;
        Ok(())
    }

    /// Issue a key for a project.
    ///
    /// Fails with [`KeyStoreError::ActiveKeyExists`] while an active key is in
    /// place; after a revoke the project's row is rewritten with fresh
    /// material and the old hash stops validating.
    pub async fn create_key(
        &self,
        project_id: &str,
        created_by: Option<&str>,
        description: Option<&str>,
    ) -> Result<IssuedKey> {
        if self.find_active(project_id).await?.is_some() {
            return Err(KeyStoreError::ActiveKeyExists(project_id.to_string()));
        }

        let api_key = generate_key();
        let key_hash = hash_key(&api_key);
        let key_prefix = api_key[..KEY_PREFIX_LEN].to_string();
        let now = Utc::now();

        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
                INSERT INTO api_keys
                    (project_id, key_hash, key_prefix, created_at, last_used_at, is_active, created_by, description)
                VALUES (?, ?, ?, ?, NULL, 1, ?, ?)
                ON CONFLICT(project_id) DO UPDATE SET
                    key_hash = excluded.key_hash,
                    key_prefix = excluded.key_prefix,
                    created_at = excluded.created_at,
                    last_used_at = NULL,
                    is_active = 1,
                    created_by = excluded.created_by,
                    description = excluded.description
                "#
            }
            DatabaseDriver::Postgres => {
                r#"
                INSERT INTO api_keys
                    (project_id, key_hash, key_prefix, created_at, last_used_at, is_active, created_by, description)
                VALUES ($1, $2, $3, $4, NULL, 1, $5, $6)
                ON CONFLICT(project_id) DO UPDATE SET
                    key_hash = excluded.key_hash,
                    key_prefix = excluded.key_prefix,
                    created_at = excluded.created_at,
                    last_used_at = NULL,
                    is_active = 1,
                    created_by = excluded.created_by,
                    description = excluded.description
                "#
            }
        };
        sqlx::query(insert)
            .bind(project_id)
            .bind(&key_hash)
            .bind(&key_prefix)
            .bind(now.to_rfc3339())
            .bind(created_by)
            .bind(description)
            .execute(&self.pool)
            .await?;

        let record = self
            .find_active(project_id)
            .await?
            .ok_or_else(|| KeyStoreError::Decode(format!("key inserted but missing ({project_id})")))?;

        Ok(IssuedKey {
            api_key,
            info: record.into(),
        })
    }

    /// Check a presented key for a project.
    ///
    /// On a match, `last_used_at` is touched on a detached task; validation
    /// never waits for the bookkeeping write.
    pub async fn validate_key(&self, project_id: &str, presented: &str) -> Result<bool> {
        if !valid_key_format(presented) {
            return Ok(false);
        }
        let key_hash = hash_key(presented);

        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM api_keys WHERE project_id = ? AND key_hash = ? AND is_active = 1"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM api_keys WHERE project_id = $1 AND key_hash = $2 AND is_active = 1"
            }
        };
        let row = sqlx::query(select)
            .bind(project_id)
            .bind(&key_hash)
            .fetch_optional(&self.pool)
            .await?;

        if row.is_none() {
            return Ok(false);
        }

        let pool = self.pool.clone();
        let driver = self.driver;
        let project = project_id.to_string();
        tokio::spawn(async move {
            let update = match driver {
                DatabaseDriver::Sqlite => {
                    "UPDATE api_keys SET last_used_at = ? WHERE project_id = ?"
                }
                DatabaseDriver::Postgres => {
                    "UPDATE api_keys SET last_used_at = $1 WHERE project_id = $2"
                }
            };
            if let Err(e) = sqlx::query(update)
                .bind(Utc::now().to_rfc3339())
                .bind(&project)
                .execute(&pool)
                .await
            {
                warn!("Failed to touch last_used_at for {}: {}", project, e);
            }
        });

        Ok(true)
    }

    /// The project's active key row, if any.
    pub async fn describe(&self, project_id: &str) -> Result<Option<ApiKeyInfo>> {
        Ok(self.find_active(project_id).await?.map(Into::into))
    }

    /// Deactivate the project's key. Returns false when none was active.
    pub async fn revoke(&self, project_id: &str) -> Result<bool> {
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE api_keys SET is_active = 0 WHERE project_id = ? AND is_active = 1"
            }
            DatabaseDriver::Postgres => {
                "UPDATE api_keys SET is_active = 0 WHERE project_id = $1 AND is_active = 1"
            }
        };
        let result = sqlx::query(update)
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All active key rows, newest first.
    pub async fn list_active(&self) -> Result<Vec<ApiKeyInfo>> {
        let rows = sqlx::query("SELECT * FROM api_keys WHERE is_active = 1 ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| map_record(&row).map(Into::into))
            .collect()
    }

    async fn find_active(&self, project_id: &str) -> Result<Option<ApiKeyRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM api_keys WHERE project_id = ? AND is_active = 1"
            }
            DatabaseDriver::Postgres => {
                "SELECT * FROM api_keys WHERE project_id = $1 AND is_active = 1"
            }
        };
        let row = sqlx::query(select)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_record(&r)).transpose()
    }
}

fn map_record(row: &AnyRow) -> Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: get_int(row, "id")?,
        project_id: row.try_get("project_id")?,
        key_hash: row.try_get("key_hash")?,
        key_prefix: row.try_get("key_prefix")?,
        created_at: parse_datetime(&row.try_get::<String, _>("created_at")?)?,
        last_used_at: row
            .try_get::<Option<String>, _>("last_used_at")?
            .map(|s| parse_datetime(&s))
            .transpose()?,
        is_active: get_int(row, "is_active")? != 0,
        created_by: row.try_get("created_by")?,
        description: row.try_get("description")?,
    })
}

// SQLite surfaces INTEGER as i64 through the Any driver, Postgres as i32.
fn get_int(row: &AnyRow, column: &str) -> Result<i64> {
    row.try_get::<i64, _>(column)
        .or_else(|_| row.try_get::<i32, _>(column).map(i64::from))
        .map_err(KeyStoreError::Sql)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| KeyStoreError::Decode(format!("bad timestamp '{s}': {e}")))
}
