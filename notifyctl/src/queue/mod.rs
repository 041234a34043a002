//! Queue store: the persistent table of recipients to notify.
//!
//! The [`QueueStore`] trait is the only way the rest of the crate touches queued records. Two
//! implementations are provided:
//!
//! - [`postgres::PostgresQueueStore`]: production store. Claiming and reconciliation go through
//!   SQL functions shipped as migrations so that each is a single atomic call.
//! - [`in_memory::InMemoryQueueStore`]: mutex-guarded store for tests and local runs.
//!
//! ## Failure semantics
//!
//! Read operations that feed a loop (`fetch_recipients`, `fetch_batch_ids_with_status`) log
//! failures and return an empty list. An empty list therefore does not prove there is no work;
//! callers that need to know should follow up with [`QueueStore::health_check`].
//!
//! Writes run in their own short transaction, roll back on error and return the error to the
//! caller. Status writes are forward-only: a write that would move a record backwards
//! (`sending` to `requested`, say) leaves it untouched.

pub mod errors;
pub mod in_memory;
pub mod postgres;

#[cfg(test)]
mod tests;

use async_trait::async_trait;

use crate::types::{BatchId, ClaimedBatch, MessageStatus, QueueRecord};
use errors::{Result, StoreError};

/// Response code: the (batch, reference) pair exists and is now at or past the target status.
pub const UPDATE_APPLIED: i32 = 0;
/// Response code: no record matches the (batch, reference) pair.
pub const UPDATE_UNKNOWN_REFERENCE: i32 = 1;

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Atomically tag a cohort of unclaimed `new` records with `batch_id`.
    ///
    /// Returns `None` when nothing is claimable. Concurrent callers never receive overlapping
    /// cohorts.
    async fn claim_next_batch(&self, batch_id: &str) -> Result<Option<ClaimedBatch>>;

    /// All records tagged with `batch_id`. Read failures are logged and yield an empty list.
    async fn fetch_recipients(&self, batch_id: &str) -> Vec<QueueRecord>;

    /// Whether any record already carries `message_id`.
    async fn message_reference_exists(&self, message_id: &str) -> Result<bool>;

    /// Persist the message reference on a claimed record. References are immutable once set.
    async fn assign_message_reference(&self, record: &QueueRecord, message_id: &str) -> Result<()>;

    /// Return a claimed record that never reached `requested` to the claimable pool, clearing its
    /// batch and any message reference. Records past `new` are left alone.
    async fn release_claim(&self, record: &QueueRecord) -> Result<()>;

    /// Move a claimed record to `status` if that is a forward transition.
    async fn set_status(&self, record: &QueueRecord, status: MessageStatus) -> Result<()>;

    /// Reconciliation primitive. Returns [`UPDATE_APPLIED`] or [`UPDATE_UNKNOWN_REFERENCE`]
    /// rather than failing when the reference is unknown.
    async fn update_status_by_reference(&self, batch_id: &str, message_id: &str, status: MessageStatus) -> Result<i32>;

    /// Distinct batch ids holding at least one record in `status`. Read failures are logged and
    /// yield an empty list.
    async fn fetch_batch_ids_with_status(&self, status: MessageStatus) -> Vec<BatchId>;

    async fn find_by_message_reference(&self, message_id: &str) -> Result<Option<QueueRecord>>;

    async fn health_check(&self) -> Result<()>;
}

/// Claimed records are addressed by `(batch_id, nhs_number)`.
pub(crate) fn claimed_batch_id(record: &QueueRecord) -> Result<&str> {
    record
        .batch_id
        .as_deref()
        .ok_or_else(|| StoreError::Other(anyhow::anyhow!("record for {} has not been claimed", record.nhs_number)))
}
