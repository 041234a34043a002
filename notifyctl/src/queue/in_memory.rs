//! In-memory implementation of [`QueueStore`].
//!
//! Every operation takes one lock over the whole table, which makes claims trivially atomic.
//! The store can be switched into an "unavailable" mode to exercise connectivity failures.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{
    QueueStore, UPDATE_APPLIED, UPDATE_UNKNOWN_REFERENCE, claimed_batch_id,
    errors::{Result, StoreError},
};
use crate::types::{BatchId, ClaimedBatch, MessageStatus, QueueRecord};

#[derive(Default)]
pub struct InMemoryQueueStore {
    records: Mutex<Vec<QueueRecord>>,
    operations: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = QueueRecord>) -> Self {
        let store = Self::new();
        store.records.lock().extend(records);
        store
    }

    pub fn insert(&self, record: QueueRecord) {
        self.records.lock().push(record);
    }

    /// Snapshot of every stored record.
    pub fn records(&self) -> Vec<QueueRecord> {
        self.records.lock().clone()
    }

    /// Number of store operations attempted so far.
    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    /// When set, every operation behaves as if the store could not be reached.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn begin(&self) -> Result<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection(anyhow::anyhow!("in-memory store marked unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn claim_next_batch(&self, batch_id: &str) -> Result<Option<ClaimedBatch>> {
        self.begin()?;
        let mut records = self.records.lock();

        let claimable = |r: &QueueRecord| r.message_status == MessageStatus::New && r.batch_id.is_none();
        let Some(routing_plan_id) = records.iter().find(|r| claimable(r)).map(|r| r.routing_plan_id.clone()) else {
            return Ok(None);
        };

        for record in records.iter_mut().filter(|r| claimable(r) && r.routing_plan_id == routing_plan_id) {
            record.batch_id = Some(batch_id.to_string());
        }

        Ok(Some(ClaimedBatch {
            batch_id: batch_id.to_string(),
            routing_plan_id,
        }))
    }

    async fn fetch_recipients(&self, batch_id: &str) -> Vec<QueueRecord> {
        if let Err(e) = self.begin() {
            tracing::error!(error = %e, "Failed to fetch recipients");
            return Vec::new();
        }
        self.records
            .lock()
            .iter()
            .filter(|r| r.batch_id.as_deref() == Some(batch_id))
            .cloned()
            .collect()
    }

    async fn message_reference_exists(&self, message_id: &str) -> Result<bool> {
        self.begin()?;
        Ok(self.records.lock().iter().any(|r| r.message_id.as_deref() == Some(message_id)))
    }

    async fn assign_message_reference(&self, record: &QueueRecord, message_id: &str) -> Result<()> {
        self.begin()?;
        let batch_id = claimed_batch_id(record)?;
        let mut records = self.records.lock();

        if records.iter().any(|r| r.message_id.as_deref() == Some(message_id)) {
            return Err(StoreError::UniqueViolation {
                constraint: Some("message_queue_message_id_key".to_string()),
                message: format!("message reference {message_id} already exists"),
            });
        }

        let target = records
            .iter_mut()
            .find(|r| r.batch_id.as_deref() == Some(batch_id) && r.nhs_number == record.nhs_number && r.message_id.is_none())
            .ok_or_else(|| StoreError::Other(anyhow::anyhow!("expected to update 1 record(s), matched 0")))?;
        target.message_id = Some(message_id.to_string());
        Ok(())
    }

    async fn release_claim(&self, record: &QueueRecord) -> Result<()> {
        self.begin()?;
        let batch_id = claimed_batch_id(record)?;

        for r in self.records.lock().iter_mut().filter(|r| {
            r.batch_id.as_deref() == Some(batch_id) && r.nhs_number == record.nhs_number && r.message_status == MessageStatus::New
        }) {
            r.batch_id = None;
            r.message_id = None;
        }
        Ok(())
    }

    async fn set_status(&self, record: &QueueRecord, status: MessageStatus) -> Result<()> {
        self.begin()?;
        let batch_id = claimed_batch_id(record)?;
        let mut records = self.records.lock();

        for r in records
            .iter_mut()
            .filter(|r| r.batch_id.as_deref() == Some(batch_id) && r.nhs_number == record.nhs_number)
        {
            if r.message_status.can_advance_to(status) {
                r.message_status = status;
            }
        }
        Ok(())
    }

    async fn update_status_by_reference(&self, batch_id: &str, message_id: &str, status: MessageStatus) -> Result<i32> {
        self.begin()?;
        let mut records = self.records.lock();

        let Some(record) = records
            .iter_mut()
            .find(|r| r.batch_id.as_deref() == Some(batch_id) && r.message_id.as_deref() == Some(message_id))
        else {
            return Ok(UPDATE_UNKNOWN_REFERENCE);
        };

        if record.message_status.can_advance_to(status) {
            record.message_status = status;
        }
        Ok(UPDATE_APPLIED)
    }

    async fn fetch_batch_ids_with_status(&self, status: MessageStatus) -> Vec<BatchId> {
        if let Err(e) = self.begin() {
            tracing::error!(error = %e, "Failed to fetch batch ids");
            return Vec::new();
        }
        let mut batch_ids: Vec<BatchId> = self
            .records
            .lock()
            .iter()
            .filter(|r| r.message_status == status)
            .filter_map(|r| r.batch_id.clone())
            .collect();
        batch_ids.sort();
        batch_ids.dedup();
        batch_ids
    }

    async fn find_by_message_reference(&self, message_id: &str) -> Result<Option<QueueRecord>> {
        self.begin()?;
        Ok(self
            .records
            .lock()
            .iter()
            .find(|r| r.message_id.as_deref() == Some(message_id))
            .cloned())
    }

    async fn health_check(&self) -> Result<()> {
        self.begin()
    }
}
