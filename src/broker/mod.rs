//! Task queue transport between the listeners and the dispatcher
//!
//! Delivery is at-least-once: a message stays owned by its consumer until it
//! is acknowledged, and is handed out again if it is negatively acknowledged
//! with `requeue` (or, for the PostgreSQL broker, if its claim times out).

mod memory;
mod postgres;

pub use memory::MemoryBroker;
pub use postgres::PgBroker;

use crate::error::RelayerResult;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use uuid::Uuid;

/// Identifies one delivery for acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckHandle {
    pub queue: String,
    pub id: Uuid,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub handle: AckHandle,
}

pub type DeliveryStream = BoxStream<'static, RelayerResult<Delivery>>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a message, optionally not deliverable before `delay` elapses
    async fn publish(&self, queue: &str, payload: &[u8], delay: Option<Duration>)
        -> RelayerResult<()>;

    /// Stream of deliveries. Several consumers of one queue compete for
    /// messages; each message goes to one of them at a time.
    async fn consume(&self, queue: &str) -> RelayerResult<DeliveryStream>;

    async fn ack(&self, handle: &AckHandle) -> RelayerResult<()>;

    /// Give a delivery back. With `requeue = false` the message is dropped.
    async fn nack(&self, handle: &AckHandle, requeue: bool) -> RelayerResult<()>;

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}
