//! PostgreSQL-backed work queue
//!
//! Consumers claim a row with `FOR UPDATE SKIP LOCKED` and hide it for the
//! visibility timeout. A consumer that dies without acking lets the claim
//! lapse and the message is delivered again.

use super::{AckHandle, Broker, Delivery, DeliveryStream};
use crate::config::BrokerConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PgBroker {
    pub fn new(pool: PgPool, config: &BrokerConfig) -> Self {
        Self {
            pool,
            visibility_timeout: config.visibility_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Create the queue table if missing
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relayer_queue (
                id UUID PRIMARY KEY,
                queue TEXT NOT NULL,
                payload BYTEA NOT NULL,
                available_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                claimed_until TIMESTAMPTZ,
                deliveries INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(broker_error)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_relayer_queue_available
            ON relayer_queue (queue, available_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(broker_error)?;

        info!("Broker migrations complete");
        Ok(())
    }

    /// Claim the next visible message, if any
    async fn claim(&self, queue: &str) -> RelayerResult<Option<Delivery>> {
        let row = sqlx::query(
            r#"
            UPDATE relayer_queue
            SET claimed_until = NOW() + ($2::BIGINT * INTERVAL '1 millisecond'),
                deliveries = deliveries + 1
            WHERE id = (
                SELECT id FROM relayer_queue
                WHERE queue = $1
                  AND available_at <= NOW()
                  AND (claimed_until IS NULL OR claimed_until < NOW())
                ORDER BY available_at, created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, payload, deliveries
            "#,
        )
        .bind(queue)
        .bind(self.visibility_timeout.as_millis() as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(broker_error)?;

        Ok(row.map(|row| {
            let id: Uuid = row.get("id");
            let deliveries: i32 = row.get("deliveries");
            if deliveries > 1 {
                debug!("Redelivering message {} on {} (delivery {})", id, queue, deliveries);
            }
            Delivery {
                payload: row.get("payload"),
                handle: AckHandle {
                    queue: queue.to_string(),
                    id,
                },
            }
        }))
    }
}

/// Queue failures are transient; they must not stop the process like
/// event store failures do.
fn broker_error(err: sqlx::Error) -> RelayerError {
    RelayerError::Broker(err.to_string())
}

#[async_trait]
impl Broker for PgBroker {
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        delay: Option<Duration>,
    ) -> RelayerResult<()> {
        let delay_ms = delay.map(|d| d.as_millis() as i64).unwrap_or(0);
        sqlx::query(
            r#"
            INSERT INTO relayer_queue (id, queue, payload, available_at)
            VALUES ($1, $2, $3, NOW() + ($4::BIGINT * INTERVAL '1 millisecond'))
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(queue)
        .bind(payload)
        .bind(delay_ms)
        .execute(&self.pool)
        .await
        .map_err(broker_error)?;

        Ok(())
    }

    async fn consume(&self, queue: &str) -> RelayerResult<DeliveryStream> {
        let broker = self.clone();
        let queue = queue.to_string();
        let stream = futures::stream::unfold((broker, queue), |(broker, queue)| async move {
            loop {
                match broker.claim(&queue).await {
                    Ok(Some(delivery)) => return Some((Ok(delivery), (broker, queue))),
                    Ok(None) => tokio::time::sleep(broker.poll_interval).await,
                    Err(e) => return Some((Err(e), (broker, queue))),
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, handle: &AckHandle) -> RelayerResult<()> {
        sqlx::query("DELETE FROM relayer_queue WHERE id = $1")
            .bind(handle.id)
            .execute(&self.pool)
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    async fn nack(&self, handle: &AckHandle, requeue: bool) -> RelayerResult<()> {
        let query = if requeue {
            "UPDATE relayer_queue SET claimed_until = NULL, available_at = NOW() WHERE id = $1"
        } else {
            "DELETE FROM relayer_queue WHERE id = $1"
        };
        sqlx::query(query)
            .bind(handle.id)
            .execute(&self.pool)
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(broker_error)?;
        Ok(())
    }
}
