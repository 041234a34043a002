//! Poll strategy: ask the provider which messages of each pending batch were read.

use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::{
    errors::Result,
    provider::MessagingProvider,
    queue::{QueueStore, UPDATE_APPLIED},
    scheduler::{ScheduleController, ScheduleKind, ScheduleOutcome, SchedulePayload},
    types::{MessageReference, MessageStatus},
};

/// Response code of one reconciliation update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceUpdate {
    pub message_reference: MessageReference,
    pub response_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReconciliation {
    pub batch_id: String,
    pub updates: Vec<ReferenceUpdate>,
}

impl BatchReconciliation {
    pub fn applied(&self) -> usize {
        self.updates.iter().filter(|u| u.response_code == UPDATE_APPLIED).count()
    }

    pub fn misses(&self) -> usize {
        self.updates.len() - self.applied()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub batches: Vec<BatchReconciliation>,
}

/// Result of one scheduled status check.
#[derive(Debug, Serialize)]
pub struct StatusCheckReport {
    pub reconciliation: BatchReconciliation,
    /// Records of the batch still waiting to be read
    pub still_sending: usize,
    /// `None` when every record was read or arming the next check failed
    pub next_check: Option<ScheduleOutcome>,
}

pub struct PollReconciler {
    store: Arc<dyn QueueStore>,
    provider: Arc<dyn MessagingProvider>,
    schedules: ScheduleController,
}

impl PollReconciler {
    pub fn new(store: Arc<dyn QueueStore>, provider: Arc<dyn MessagingProvider>, schedules: ScheduleController) -> Self {
        Self {
            store,
            provider,
            schedules,
        }
    }

    /// Reconcile every batch that still has records in `sending`.
    ///
    /// A provider error on any batch aborts the run; updates already applied stay applied.
    #[instrument(skip(self), err)]
    pub async fn reconcile_all(&self) -> Result<ReconcileReport> {
        let batch_ids = self.store.fetch_batch_ids_with_status(MessageStatus::Sending).await;
        if batch_ids.is_empty() {
            self.store.health_check().await?;
            info!("No batches awaiting read status");
            return Ok(ReconcileReport::default());
        }

        let mut report = ReconcileReport::default();
        for batch_id in batch_ids {
            report.batches.push(self.reconcile_one(&batch_id).await?);
        }

        let applied: usize = report.batches.iter().map(BatchReconciliation::applied).sum();
        info!(batches = report.batches.len(), applied, "Reconciliation finished");
        Ok(report)
    }

    /// Scheduled status check for one batch. Re-arms itself while records remain unread.
    #[instrument(skip(self), fields(batch_id = %payload.batch_id, retries = payload.retries), err)]
    pub async fn reconcile_batch(&self, payload: &SchedulePayload) -> Result<StatusCheckReport> {
        let reconciliation = self.reconcile_one(&payload.batch_id).await?;

        let recipients = self.store.fetch_recipients(&payload.batch_id).await;
        if recipients.is_empty() {
            self.store.health_check().await?;
        }
        let still_sending = recipients
            .iter()
            .filter(|r| r.message_status == MessageStatus::Sending)
            .count();

        // The read updates are already applied, so a scheduler failure only loses the next check;
        // `/jobs/reconcile` still covers the batch.
        let next_check = if still_sending > 0 {
            match self
                .schedules
                .schedule_with_backoff(ScheduleKind::StatusCheck, &payload.batch_id, payload.retries + 1)
                .await
            {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!(error = %e, "Failed to arm next status check");
                    None
                }
            }
        } else {
            info!("Every record in the batch has been read");
            None
        };

        Ok(StatusCheckReport {
            reconciliation,
            still_sending,
            next_check,
        })
    }

    async fn reconcile_one(&self, batch_id: &str) -> Result<BatchReconciliation> {
        let references = self.provider.fetch_read_references(batch_id).await?;

        let mut updates = Vec::with_capacity(references.len());
        for message_reference in references {
            let response_code = self
                .store
                .update_status_by_reference(batch_id, &message_reference, MessageStatus::Read)
                .await?;

            if response_code != UPDATE_APPLIED {
                metrics::counter!("notifyctl_reconciliation_misses_total").increment(1);
                warn!(batch_id, %message_reference, response_code, "Read status for unknown message reference");
            }

            updates.push(ReferenceUpdate {
                message_reference,
                response_code,
            });
        }

        Ok(BatchReconciliation {
            batch_id: batch_id.to_string(),
            updates,
        })
    }
}
