//! In-process broker for tests and single-process development

use super::{AckHandle, Broker, Delivery, DeliveryStream};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Message {
    id: Uuid,
    payload: Vec<u8>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    delayed: Vec<(Instant, Message)>,
    in_flight: HashMap<Uuid, Message>,
    #[cfg(test)]
    acked: u64,
    #[cfg(test)]
    rejected: u64,
}

impl QueueState {
    /// Move due delayed messages to the ready queue, in due order
    fn promote(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|(due, _)| *due);
        let split = self.delayed.partition_point(|(due, _)| *due <= now);
        for (_, message) in self.delayed.drain(..split) {
            self.ready.push_back(message);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(due, _)| *due).min()
    }

    fn take(&mut self, queue: &str) -> Option<Delivery> {
        let message = self.ready.pop_front()?;
        let delivery = Delivery {
            payload: message.payload.clone(),
            handle: AckHandle {
                queue: queue.to_string(),
                id: message.id,
            },
        };
        self.in_flight.insert(message.id, message);
        Some(delivery)
    }
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
}

/// Broker holding every queue in memory
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

/// Queue counters for tests
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub acked: u64,
    pub rejected: u64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next deliverable message
    async fn next(&self, queue: &str) -> Delivery {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut queues = self.inner.queues.lock().await;
                let state = queues.entry(queue.to_string()).or_default();
                state.promote(Instant::now());
                if let Some(delivery) = state.take(queue) {
                    return delivery;
                }
                state.next_due()
            };

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
impl MemoryBroker {
    /// Next deliverable message, without waiting
    pub async fn try_next(&self, queue: &str) -> Option<Delivery> {
        let mut queues = self.inner.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.promote(Instant::now());
        state.take(queue)
    }

    pub async fn stats(&self, queue: &str) -> QueueStats {
        let queues = self.inner.queues.lock().await;
        queues
            .get(queue)
            .map(|state| QueueStats {
                ready: state.ready.len(),
                delayed: state.delayed.len(),
                in_flight: state.in_flight.len(),
                acked: state.acked,
                rejected: state.rejected,
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        delay: Option<Duration>,
    ) -> RelayerResult<()> {
        let message = Message {
            id: Uuid::new_v4(),
            payload: payload.to_vec(),
        };
        {
            let mut queues = self.inner.queues.lock().await;
            let state = queues.entry(queue.to_string()).or_default();
            match delay.filter(|d| !d.is_zero()) {
                Some(delay) => state.delayed.push((Instant::now() + delay, message)),
                None => state.ready.push_back(message),
            }
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> RelayerResult<DeliveryStream> {
        let broker = self.clone();
        let queue = queue.to_string();
        let stream = futures::stream::unfold((broker, queue), |(broker, queue)| async move {
            let delivery = broker.next(&queue).await;
            Some((Ok(delivery), (broker, queue)))
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, handle: &AckHandle) -> RelayerResult<()> {
        let mut queues = self.inner.queues.lock().await;
        let state = queues.entry(handle.queue.clone()).or_default();
        if state.in_flight.remove(&handle.id).is_none() {
            return Err(RelayerError::Broker(format!(
                "unknown delivery {} on {}",
                handle.id, handle.queue
            )));
        }
        #[cfg(test)]
        {
            state.acked += 1;
        }
        Ok(())
    }

    async fn nack(&self, handle: &AckHandle, requeue: bool) -> RelayerResult<()> {
        {
            let mut queues = self.inner.queues.lock().await;
            let state = queues.entry(handle.queue.clone()).or_default();
            let message = state.in_flight.remove(&handle.id).ok_or_else(|| {
                RelayerError::Broker(format!("unknown delivery {} on {}", handle.id, handle.queue))
            })?;
            if requeue {
                state.ready.push_back(message);
            }
            #[cfg(test)]
            if !requeue {
                state.rejected += 1;
            }
        }
        if requeue {
            self.inner.notify.notify_waiters();
        }
        Ok(())
    }
}
