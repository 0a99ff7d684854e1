//! PostgreSQL-backed key/value store

use super::KvStore;
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;

/// Key/value store over a single PostgreSQL table
pub struct PgKvStore {
    pool: PgPool,
}

impl PgKvStore {
    /// Connect to the configured database
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the backing table if missing
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relayer_kv (
                key TEXT PRIMARY KEY,
                value BYTEA NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Key/value store migrations complete");
        Ok(())
    }
}

#[async_trait]
impl KvStore for PgKvStore {
    async fn get(&self, key: &str) -> RelayerResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM relayer_kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO relayer_kv (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key)
            DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> RelayerResult<()> {
        sqlx::query("DELETE FROM relayer_kv WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> RelayerResult<Vec<(String, Vec<u8>)>> {
        let rows = sqlx::query(
            r#"
            SELECT key, value FROM relayer_kv
            WHERE starts_with(key, $1)
            ORDER BY key COLLATE "C"
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("key"), row.get::<Vec<u8>, _>("value")))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> RelayerResult<bool> {
        let rows_affected = match (expected, new) {
            (None, Some(value)) => sqlx::query(
                r#"
                INSERT INTO relayer_kv (key, value, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            (Some(current), Some(value)) => sqlx::query(
                r#"
                UPDATE relayer_kv SET value = $2, updated_at = NOW()
                WHERE key = $1 AND value = $3
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(current)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            (Some(current), None) => {
                sqlx::query("DELETE FROM relayer_kv WHERE key = $1 AND value = $2")
                    .bind(key)
                    .bind(current)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            }
            (None, None) => {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM relayer_kv WHERE key = $1)")
                        .bind(key)
                        .fetch_one(&self.pool)
                        .await?;
                u64::from(!exists)
            }
        };

        Ok(rows_affected == 1)
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| RelayerError::Storage(e.to_string()))?;
        Ok(())
    }
}
