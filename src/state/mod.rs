//! Durable relayer state
//!
//! Handles:
//! - Observed events, deduplicated by chain, transaction and log index
//! - Per-operation state, execution markers and archival
//! - Per-operation leases for the dispatcher
//! - Listener cursors and dead letters

mod event_store;
mod kv;
mod postgres;

pub use event_store::{
    AppendOutcome, ChainCursor, EventStore, ExecutionRecord, Lease, LockOutcome, OperationState,
    SubmissionIntent,
};
pub use kv::KvStore;
#[cfg(test)]
pub use kv::{FailingKvStore, MemoryKvStore};
pub use postgres::PgKvStore;
