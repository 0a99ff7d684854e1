//! Task dispatcher
//!
//! Workers consume tasks from the broker, decide each one against the
//! operation state machine and submit the resulting contract call on the
//! target chain. An action is submitted at most once per
//! `(operation, event type)`:
//!
//! 1. the operation lease serializes workers on one operation,
//! 2. a submission intent is written before the call goes out,
//! 3. the execution record is written once the receipt is in.
//!
//! The intent records the transaction hash once the node accepts it. A later
//! attempt that finds an intent with a hash looks the transaction up instead
//! of submitting again. An intent without a hash means a previous holder died
//! mid broadcast; the outcome on chain is unknown, so the task is parked for
//! an operator.

use super::machine;
use super::task::{DeadLetter, Task};
use super::Action;
use crate::broker::{Broker, Delivery};
use crate::chain::{ChainRegistry, LedgerClient, TxReceipt, TxStatus};
use crate::config::DispatcherConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::ChainId;
use crate::metrics;
use crate::state::{EventStore, ExecutionRecord, Lease, LockOutcome, SubmissionIntent};

use chrono::Utc;
use ethers::types::H256;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Queue that receives a copy of every dead-lettered task
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}.dead", queue)
}

/// Result of handling one task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Operation is archived or the task was already dead-lettered
    Discarded,
    /// No action for this event; the operation state was updated
    Recorded { archived: bool },
    Executed(ExecutionRecord),
    /// The action was submitted by an earlier delivery
    AlreadyExecuted,
    /// Publish `task` again after `delay`
    Requeued {
        task: Task,
        delay: Duration,
        reason: String,
    },
    DeadLettered { reason: String },
    /// Payload was not a task
    Rejected { reason: String },
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Discarded => "discarded",
            TaskOutcome::Recorded { .. } => "recorded",
            TaskOutcome::Executed(_) => "executed",
            TaskOutcome::AlreadyExecuted => "already_executed",
            TaskOutcome::Requeued { .. } => "requeued",
            TaskOutcome::DeadLettered { .. } => "dead_lettered",
            TaskOutcome::Rejected { .. } => "rejected",
        }
    }
}

/// Consumes tasks and drives operations forward
pub struct TaskDispatcher {
    store: Arc<EventStore>,
    chains: Arc<ChainRegistry>,
    broker: Arc<dyn Broker>,
    queue: String,
    config: DispatcherConfig,
    instance_id: String,
    dead_letter_queue: Option<String>,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<EventStore>,
        chains: Arc<ChainRegistry>,
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        config: DispatcherConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            chains,
            broker,
            queue: queue.into(),
            config,
            instance_id: instance_id.into(),
            dead_letter_queue: None,
        }
    }

    /// Also publish every dead letter to `{queue}.dead` for consumers
    /// outside this process
    pub fn with_dead_letter_queue(mut self) -> Self {
        self.dead_letter_queue = Some(dead_letter_queue(&self.queue));
        self
    }

    /// Run `workers` competing consumers until shutdown.
    ///
    /// A fatal error in any worker stops all of them.
    pub async fn run(
        self: Arc<Self>,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> RelayerResult<()> {
        info!(
            "Dispatcher {} starting {} workers on queue {}",
            self.instance_id, workers, self.queue
        );

        let mut set = JoinSet::new();
        for n in 0..workers {
            let dispatcher = self.clone();
            let shutdown = shutdown.clone();
            let worker = format!("{}-{}", self.instance_id, n);
            set.spawn(async move { dispatcher.run_worker(worker, shutdown).await });
        }

        while let Some(joined) = set.join_next().await {
            let result = joined
                .map_err(|e| RelayerError::Internal(format!("dispatcher worker panicked: {}", e)))
                .and_then(|result| result);
            if let Err(e) = result {
                error!("Dispatcher worker failed, stopping all workers: {}", e);
                set.abort_all();
                return Err(e);
            }
        }

        info!("Dispatcher {} stopped", self.instance_id);
        Ok(())
    }

    /// Consume and handle deliveries until shutdown.
    ///
    /// A task being handled when shutdown is signalled is finished first.
    pub async fn run_worker(
        &self,
        worker: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> RelayerResult<()> {
        let mut deliveries = self.broker.consume(&self.queue).await?;
        debug!("Worker {} consuming {}", worker, self.queue);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                next = deliveries.next() => next,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!("Worker {}: broker error: {}", worker, e);
                    tokio::time::sleep(self.config.lock_busy_delay()).await;
                    continue;
                }
                None => {
                    warn!("Worker {}: delivery stream closed", worker);
                    break;
                }
            };

            match self.handle_delivery(delivery, &worker).await {
                Ok(outcome) => debug!("Worker {}: task {}", worker, outcome.label()),
                Err(e) if e.is_fatal() => {
                    metrics::raise_alert(
                        "dispatcher_storage",
                        &format!("Worker {} stopping: {}", worker, e),
                    );
                    return Err(e);
                }
                Err(e) => warn!("Worker {}: {}", worker, e),
            }
        }

        debug!("Worker {} stopped", worker);
        Ok(())
    }

    /// Handle one delivery and settle it with the broker.
    ///
    /// Requeues publish the next attempt before the delivery is acked, so a
    /// crash in between produces a duplicate task rather than a lost one.
    pub async fn handle_delivery(
        &self,
        delivery: Delivery,
        worker: &str,
    ) -> RelayerResult<TaskOutcome> {
        let task = match Task::decode(&delivery.payload) {
            Ok(task) => task,
            Err(e) => {
                metrics::raise_alert(
                    "poison_task",
                    &format!("Dropping undecodable task on {}: {}", self.queue, e),
                );
                self.broker.nack(&delivery.handle, false).await?;
                return Ok(TaskOutcome::Rejected {
                    reason: e.to_string(),
                });
            }
        };

        let outcome = match self.process(&task, worker).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => {
                if let Err(nack_err) = self.broker.nack(&delivery.handle, true).await {
                    warn!("Failed to hand back task for {}: {}", task.operation_id, nack_err);
                }
                return Err(e);
            }
            Err(e) if e.is_retryable() => self.retry_or_dead_letter(&task, e).await?,
            Err(e) => self.dead_letter(&task, e.to_string()).await?,
        };

        if let TaskOutcome::Requeued { task: next, delay, .. } = &outcome {
            let published = match next.encode() {
                Ok(bytes) => self.broker.publish(&self.queue, &bytes, Some(*delay)).await,
                Err(e) => Err(e),
            };
            if let Err(e) = published {
                self.broker.nack(&delivery.handle, true).await?;
                return Err(e);
            }
        }

        self.broker.ack(&delivery.handle).await?;
        metrics::record_task_outcome(task.event_type, outcome.label());
        Ok(outcome)
    }

    /// Decide and carry out one task. Does not touch the broker.
    pub async fn process(&self, task: &Task, worker: &str) -> RelayerResult<TaskOutcome> {
        let operation_id = task.operation_id;

        let Some(origin) = task.origin_role() else {
            return self
                .dead_letter(
                    task,
                    format!(
                        "chain {} plays no role in operation {}",
                        task.origin_chain_id, operation_id
                    ),
                )
                .await;
        };
        let decision = match machine::decide(task.event_type, origin) {
            Ok(decision) => decision,
            Err(e) => return self.dead_letter(task, e.to_string()).await,
        };

        if self.store.is_archived(&operation_id).await? {
            debug!(
                "Operation {} archived, discarding {}",
                operation_id, task.event_type
            );
            return Ok(TaskOutcome::Discarded);
        }
        if self
            .store
            .is_dead_lettered(&operation_id, task.event_type)
            .await?
        {
            debug!(
                "{} for operation {} already dead-lettered",
                task.event_type, operation_id
            );
            return Ok(TaskOutcome::Discarded);
        }

        let Some(action) = decision.action else {
            self.record_state(task).await?;
            let archived = decision.terminal && self.store.archive(&operation_id).await?;
            return Ok(TaskOutcome::Recorded { archived });
        };

        if let Some(required) = decision.precondition {
            let state = self.store.get_operation_state(&operation_id).await?;
            if !state.contains_key(&required) {
                let err = RelayerError::PreconditionNotMet {
                    operation_id,
                    missing: required,
                };
                return self.retry_or_dead_letter(task, err).await;
            }
        }

        let Some(target_chain_id) = decision.target.map(|role| task.payload.chain_for(role))
        else {
            return Err(RelayerError::Internal(format!(
                "{} has an action but no target chain",
                task.event_type
            )));
        };
        let ledger = match self.chains.get(target_chain_id) {
            Ok(ledger) => ledger,
            Err(e) => return self.dead_letter(task, e.to_string()).await,
        };

        let mut lease = match self
            .store
            .acquire_lock(&operation_id, worker, self.config.lock_ttl())
            .await?
        {
            LockOutcome::Acquired(lease) => lease,
            LockOutcome::Busy { holder, .. } => {
                metrics::record_lock_contention();
                debug!(
                    "Operation {} held by {}, deferring {}",
                    operation_id, holder, task.event_type
                );
                // Contention is not a failed attempt
                return Ok(TaskOutcome::Requeued {
                    task: task.clone(),
                    delay: self.config.lock_busy_delay(),
                    reason: RelayerError::LockContention(operation_id).to_string(),
                });
            }
        };

        let result = self
            .execute(task, action, target_chain_id, ledger.as_ref(), &mut lease)
            .await;

        let released = self.store.release_lock(&lease).await;
        let outcome = result?;
        if !released? {
            warn!(
                "Lease on operation {} was taken over before release",
                operation_id
            );
        }
        Ok(outcome)
    }

    async fn execute(
        &self,
        task: &Task,
        action: Action,
        target_chain_id: ChainId,
        ledger: &dyn LedgerClient,
        lease: &mut Lease,
    ) -> RelayerResult<TaskOutcome> {
        let operation_id = task.operation_id;
        let event_type = task.event_type;

        if self.store.execution(&operation_id, event_type).await?.is_some() {
            self.record_state(task).await?;
            return Ok(TaskOutcome::AlreadyExecuted);
        }

        if let Some(intent) = self.store.submission_intent(&operation_id, event_type).await? {
            let Some(tx_hash) = intent.tx_hash else {
                return self
                    .dead_letter(
                        task,
                        format!(
                            "ambiguous prior submission by {} at {}",
                            intent.holder, intent.started_at
                        ),
                    )
                    .await;
            };
            if let Some(outcome) = self
                .resume(task, action, target_chain_id, ledger, tx_hash)
                .await?
            {
                return Ok(outcome);
            }
        }

        let mut intent = SubmissionIntent {
            operation_id,
            event_type,
            holder: lease.holder.clone(),
            started_at: Utc::now(),
            tx_hash: None,
        };
        if !self.store.begin_submission(&intent).await? {
            return self
                .dead_letter(task, "ambiguous prior submission: intent already present")
                .await;
        }

        info!(
            "Submitting {} on chain {} for operation {} ({})",
            action, target_chain_id, operation_id, event_type
        );
        let started = Instant::now();

        let tx_hash = match self
            .holding_lease(lease, ledger.send(action, &task.payload))
            .await
        {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                self.store.clear_submission(&operation_id, event_type).await?;
                return self.submission_failed(task, action, target_chain_id, e).await;
            }
        };
        intent.tx_hash = Some(tx_hash);
        self.store.record_broadcast(&intent).await?;

        match self
            .holding_lease(lease, ledger.wait_for_receipt(tx_hash))
            .await
        {
            Ok(receipt) => {
                metrics::record_submission_latency(
                    target_chain_id,
                    started.elapsed().as_secs_f64(),
                );
                self.complete(task, action, target_chain_id, receipt).await
            }
            Err(e) if e.is_retryable() => {
                // Already broadcast: the intent stays so the next attempt
                // looks the transaction up
                metrics::record_submission(target_chain_id, action, "retryable");
                warn!(
                    "Operation {}: {} sent as {:?} but not settled: {}",
                    operation_id, action, tx_hash, e
                );
                self.retry_or_dead_letter(task, e).await
            }
            Err(e) => {
                self.store.clear_submission(&operation_id, event_type).await?;
                self.submission_failed(task, action, target_chain_id, e).await
            }
        }
    }

    /// Settle a transaction an earlier attempt broadcast. `None` means it was
    /// dropped and the action may be sent again.
    async fn resume(
        &self,
        task: &Task,
        action: Action,
        target_chain_id: ChainId,
        ledger: &dyn LedgerClient,
        tx_hash: H256,
    ) -> RelayerResult<Option<TaskOutcome>> {
        let operation_id = task.operation_id;

        match ledger.transaction_status(tx_hash).await? {
            TxStatus::Confirmed(receipt) => {
                info!(
                    "Operation {}: earlier {} in {:?} is confirmed",
                    operation_id, action, tx_hash
                );
                self.complete(task, action, target_chain_id, receipt)
                    .await
                    .map(Some)
            }
            TxStatus::Pending => {
                let err = RelayerError::TransientNetwork {
                    chain_id: target_chain_id,
                    message: format!("{:?} is still pending", tx_hash),
                };
                self.retry_or_dead_letter(task, err).await.map(Some)
            }
            TxStatus::Reverted => {
                metrics::record_submission(target_chain_id, action, "failed");
                self.store
                    .clear_submission(&operation_id, task.event_type)
                    .await?;
                self.dead_letter(task, format!("{} reverted in {:?}", action, tx_hash))
                    .await
                    .map(Some)
            }
            TxStatus::Unknown => {
                warn!(
                    "Operation {}: {} in {:?} was dropped, sending again",
                    operation_id, action, tx_hash
                );
                self.store
                    .clear_submission(&operation_id, task.event_type)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Record a mined action and the state it moves the operation to
    async fn complete(
        &self,
        task: &Task,
        action: Action,
        target_chain_id: ChainId,
        receipt: TxReceipt,
    ) -> RelayerResult<TaskOutcome> {
        let operation_id = task.operation_id;
        metrics::record_submission(target_chain_id, action, "success");

        let record = ExecutionRecord {
            operation_id,
            event_type: task.event_type,
            action,
            target_chain_id,
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            executed_at: Utc::now(),
        };
        if !self.store.record_execution(&record).await? {
            warn!(
                "Execution of {} for operation {} was already recorded",
                action, operation_id
            );
        }
        self.record_state(task).await?;
        self.store
            .clear_submission(&operation_id, task.event_type)
            .await?;

        info!(
            "Operation {}: {} confirmed in {:?}",
            operation_id, action, receipt.tx_hash
        );
        Ok(TaskOutcome::Executed(record))
    }

    async fn submission_failed(
        &self,
        task: &Task,
        action: Action,
        target_chain_id: ChainId,
        err: RelayerError,
    ) -> RelayerResult<TaskOutcome> {
        if err.is_retryable() {
            metrics::record_submission(target_chain_id, action, "retryable");
            warn!(
                "Operation {}: {} failed, will retry: {}",
                task.operation_id, action, err
            );
            self.retry_or_dead_letter(task, err).await
        } else {
            metrics::record_submission(target_chain_id, action, "failed");
            self.dead_letter(task, err.to_string()).await
        }
    }

    /// Drive `work` while renewing the lease, so a slow node does not let
    /// the lease expire under us.
    async fn holding_lease<T>(
        &self,
        lease: &mut Lease,
        work: impl Future<Output = RelayerResult<T>>,
    ) -> RelayerResult<T> {
        let ttl = self.config.lock_ttl();
        let mut renew = tokio::time::interval((ttl / 3).max(Duration::from_millis(10)));
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renew.tick().await;

        tokio::pin!(work);

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = renew.tick() => match self.store.renew_lock(lease, ttl).await {
                    Ok(Some(renewed)) => *lease = renewed,
                    Ok(None) => warn!("Lease on operation {} lost mid submission", lease.operation_id),
                    Err(e) => warn!("Failed to renew lease on {}: {}", lease.operation_id, e),
                },
            }
        }
    }

    async fn retry_or_dead_letter(
        &self,
        task: &Task,
        err: RelayerError,
    ) -> RelayerResult<TaskOutcome> {
        let attempts = task.attempt_count + 1;
        if self.config.retry.should_retry(attempts) {
            let delay = self.config.retry.backoff(attempts);
            debug!(
                "Requeueing {} for operation {} in {:?} (attempt {}): {}",
                task.event_type, task.operation_id, delay, attempts, err
            );
            Ok(TaskOutcome::Requeued {
                task: task.next_attempt(),
                delay,
                reason: err.to_string(),
            })
        } else {
            self.dead_letter(task, format!("{} (gave up after {} attempts)", err, attempts))
                .await
        }
    }

    /// Park a task for an operator. Alerts only the first time.
    async fn dead_letter(
        &self,
        task: &Task,
        reason: impl Into<String>,
    ) -> RelayerResult<TaskOutcome> {
        let entry = DeadLetter::new(task.clone(), reason);
        if self.store.dead_letter(&entry).await? {
            if let Some(dead_queue) = &self.dead_letter_queue {
                let published = match serde_json::to_vec(&entry) {
                    Ok(bytes) => self.broker.publish(dead_queue, &bytes, None).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = published {
                    // Store entry is authoritative
                    warn!("Failed to publish dead letter to {}: {}", dead_queue, e);
                }
            }
            metrics::record_dead_letter(task.event_type);
            metrics::raise_alert(
                "dead_letter",
                &format!(
                    "{} for operation {} dead-lettered: {}",
                    task.event_type, task.operation_id, entry.reason
                ),
            );
        } else {
            debug!(
                "{} for operation {} already dead-lettered",
                task.event_type, task.operation_id
            );
        }
        Ok(TaskOutcome::DeadLettered {
            reason: entry.reason,
        })
    }

    async fn record_state(&self, task: &Task) -> RelayerResult<()> {
        match self
            .store
            .record_for_operation(&task.operation_id, task.event_type, Utc::now())
            .await
        {
            Ok(_) => Ok(()),
            Err(RelayerError::OperationArchived(id)) => {
                debug!("Operation {} closed, not recording {}", id, task.event_type);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
