//! Batch processor: claim, reference, send, mark.
//!
//! Each batch goes through `CLAIMING -> REFERENCING -> SENDING -> {SENT | SEND_FAILED}`:
//!
//! 1. A fresh batch reference is generated and a cohort is claimed under it. Nothing claimable
//!    ends the run; a store failure aborts it.
//! 2. Every claimed record gets a collision-checked message reference and moves to `requested`
//!    before anything goes on the network. A record whose reference or status write fails is
//!    left out of the send, so no message ever leaves without a recorded reference, and its
//!    claim is released so a later run picks it up again. If the release fails too the record
//!    stays claimed in `new`, which the sweeper reports.
//! 3. One signed request is sent for the whole cohort.
//! 4. On 201 every record moves to `sending` and a status check is armed. Otherwise the records
//!    stay `requested` and a batch retry is armed; the retry re-sends them under the same batch
//!    and message references.

use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::{
    errors::{Error, Result},
    provider::MessagingProvider,
    queue::QueueStore,
    reference::{ReferenceGenerator, unique_message_reference},
    scheduler::{ScheduleController, ScheduleKind, ScheduleOutcome, SchedulePayload},
    types::{MessageStatus, QueueRecord},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// No claimable cohort, or nothing left to re-send
    NothingToDo,
    Sent {
        batch_id: String,
        recipients: usize,
        /// `None` when arming the status check failed
        status_check: Option<ScheduleOutcome>,
    },
    SendFailed {
        batch_id: String,
        /// HTTP status from the provider; `None` for transport failures
        status: Option<u16>,
        retry: Option<ScheduleOutcome>,
    },
}

#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub batches: Vec<BatchOutcome>,
}

impl RunSummary {
    pub fn sent(&self) -> usize {
        self.batches.iter().filter(|b| matches!(b, BatchOutcome::Sent { .. })).count()
    }
}

pub struct BatchProcessor {
    store: Arc<dyn QueueStore>,
    provider: Arc<dyn MessagingProvider>,
    references: Arc<dyn ReferenceGenerator>,
    schedules: ScheduleController,
    max_batches_per_run: usize,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        provider: Arc<dyn MessagingProvider>,
        references: Arc<dyn ReferenceGenerator>,
        schedules: ScheduleController,
        max_batches_per_run: usize,
    ) -> Self {
        Self {
            store,
            provider,
            references,
            schedules,
            max_batches_per_run,
        }
    }

    /// Claim and send batches until nothing is claimable or the per-run limit is reached.
    #[instrument(skip(self), err)]
    pub async fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        for _ in 0..self.max_batches_per_run {
            match self.process_next_batch().await? {
                BatchOutcome::NothingToDo => break,
                outcome => summary.batches.push(outcome),
            }
        }

        info!(batches = summary.batches.len(), sent = summary.sent(), "Batch run finished");
        Ok(summary)
    }

    /// Claim one cohort and take it through referencing and sending.
    pub async fn process_next_batch(&self) -> Result<BatchOutcome> {
        let batch_id = self.references.new_batch_reference();

        let Some(claimed) = self.store.claim_next_batch(&batch_id).await? else {
            info!("No claimable recipients");
            return Ok(BatchOutcome::NothingToDo);
        };
        info!(batch_id = %claimed.batch_id, routing_plan_id = %claimed.routing_plan_id, "Claimed batch");

        let recipients = self.store.fetch_recipients(&claimed.batch_id).await;
        if recipients.is_empty() {
            return Err(Error::Fetch {
                what: format!("recipients for claimed batch {}", claimed.batch_id),
            });
        }

        let total = recipients.len();
        let referenced = self.assign_references(recipients).await;
        if referenced.is_empty() {
            return Err(Error::Internal {
                operation: format!("reference any of the {total} recipients in batch {}", claimed.batch_id),
            });
        }
        if referenced.len() < total {
            warn!(
                batch_id = %claimed.batch_id,
                skipped = total - referenced.len(),
                "Some recipients could not be referenced and were released from this send"
            );
        }

        self.send_and_mark(&claimed.batch_id, &claimed.routing_plan_id, referenced, 0).await
    }

    /// Re-send the `requested` records of a batch whose earlier send did not succeed.
    #[instrument(skip(self), fields(batch_id = %payload.batch_id, retries = payload.retries), err)]
    pub async fn retry_batch(&self, payload: &SchedulePayload) -> Result<BatchOutcome> {
        let recipients: Vec<QueueRecord> = self
            .store
            .fetch_recipients(&payload.batch_id)
            .await
            .into_iter()
            .filter(|r| r.message_status == MessageStatus::Requested && r.message_id.is_some())
            .collect();

        let Some(routing_plan_id) = recipients.first().map(|r| r.routing_plan_id.clone()) else {
            // An empty read may be a connectivity failure rather than a finished batch
            self.store.health_check().await?;
            info!("Nothing left to re-send");
            return Ok(BatchOutcome::NothingToDo);
        };

        self.send_and_mark(&payload.batch_id, &routing_plan_id, recipients, payload.retries)
            .await
    }

    async fn assign_references(&self, recipients: Vec<QueueRecord>) -> Vec<QueueRecord> {
        let mut referenced = Vec::with_capacity(recipients.len());

        for mut record in recipients {
            let reference = match unique_message_reference(self.references.as_ref(), self.store.as_ref()).await {
                Ok(reference) => reference,
                Err(e) => {
                    error!(nhs_number = %record.nhs_number, error = %e, "Failed to generate message reference");
                    self.release(&record).await;
                    continue;
                }
            };

            if let Err(e) = self.store.assign_message_reference(&record, &reference).await {
                error!(nhs_number = %record.nhs_number, error = %e, "Failed to record message reference");
                self.release(&record).await;
                continue;
            }
            record.message_id = Some(reference);

            if let Err(e) = self.store.set_status(&record, MessageStatus::Requested).await {
                error!(nhs_number = %record.nhs_number, error = %e, "Failed to mark recipient requested");
                self.release(&record).await;
                continue;
            }
            record.message_status = MessageStatus::Requested;

            referenced.push(record);
        }

        referenced
    }

    /// Hand a record that never reached `requested` back to the claimable pool.
    async fn release(&self, record: &QueueRecord) {
        match self.store.release_claim(record).await {
            Ok(()) => warn!(nhs_number = %record.nhs_number, "Released recipient for a later run"),
            Err(e) => error!(
                nhs_number = %record.nhs_number,
                batch_id = ?record.batch_id,
                error = %e,
                "Failed to release recipient, it stays claimed in new"
            ),
        }
    }

    async fn send_and_mark(&self, batch_id: &str, routing_plan_id: &str, recipients: Vec<QueueRecord>, retries: u32) -> Result<BatchOutcome> {
        let result = self.provider.send_batch_message(batch_id, routing_plan_id, &recipients).await;

        match result {
            Ok(response) if response.is_accepted() => {
                for record in &recipients {
                    if let Err(e) = self.store.set_status(record, MessageStatus::Sending).await {
                        error!(batch_id, nhs_number = %record.nhs_number, error = %e, "Failed to mark recipient sending");
                    }
                }
                metrics::counter!("notifyctl_batches_sent_total").increment(1);
                info!(batch_id, recipients = recipients.len(), correlation_id = %response.correlation_id, "Batch accepted");

                let status_check = self.arm(ScheduleKind::StatusCheck, batch_id, 1).await;
                Ok(BatchOutcome::Sent {
                    batch_id: batch_id.to_string(),
                    recipients: recipients.len(),
                    status_check,
                })
            }
            Ok(response) => {
                metrics::counter!("notifyctl_batches_failed_total").increment(1);
                error!(
                    batch_id,
                    status = response.status,
                    body = %response.body,
                    correlation_id = %response.correlation_id,
                    "Batch rejected by provider"
                );

                let retry = self.arm(ScheduleKind::BatchRetry, batch_id, retries + 1).await;
                Ok(BatchOutcome::SendFailed {
                    batch_id: batch_id.to_string(),
                    status: Some(response.status),
                    retry,
                })
            }
            Err(e) => {
                metrics::counter!("notifyctl_batches_failed_total").increment(1);
                error!(batch_id, error = %e, "Batch send failed");

                let retry = self.arm(ScheduleKind::BatchRetry, batch_id, retries + 1).await;
                Ok(BatchOutcome::SendFailed {
                    batch_id: batch_id.to_string(),
                    status: None,
                    retry,
                })
            }
        }
    }

    /// Arm follow-up work. A scheduler failure is logged; the batch state is already durable.
    async fn arm(&self, kind: ScheduleKind, batch_id: &str, retry_count: u32) -> Option<ScheduleOutcome> {
        match self.schedules.schedule_with_backoff(kind, batch_id, retry_count).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(batch_id, %kind, error = %e, "Failed to arm follow-up schedule");
                None
            }
        }
    }
}
