//! Deferred re-invocation of the batch processor and the status reconciler.
//!
//! The time-fired invocation service itself is external; this module only builds schedule
//! entries and enforces the retry budget. State travels in the payload
//! (`{"batch_id": .., "retries": ..}`), so every fire is independent of the process that armed it.
//!
//! Policy:
//!
//! - A schedule whose retry count exceeds `max_retries` is dropped. This is the only brake on
//!   runaway retries and it surfaces as the `notifyctl_retry_budget_exhausted_total` counter.
//! - Backoff is linear: retry `n` fires `n * base_delay_minutes` from now.
//! - A zero delay fires the target immediately instead of creating a schedule.

pub mod http;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::{info, instrument, warn};

use crate::errors::{Error, Result};

/// What a schedule re-invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Re-send a batch whose send did not succeed
    BatchRetry,
    /// Poll the provider for read statuses of a sent batch
    StatusCheck,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::BatchRetry => "batch_retry",
            ScheduleKind::StatusCheck => "status_check",
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload delivered to the job endpoint when a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePayload {
    pub batch_id: String,
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub kind: ScheduleKind,
    pub payload: SchedulePayload,
    pub fire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    Scheduled { fire_at: DateTime<Utc> },
    FiredImmediately,
    BudgetExhausted,
}

/// The external time-fired invocation service.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Register a one-off invocation at `entry.fire_at`.
    async fn create_schedule(&self, entry: &ScheduleEntry) -> Result<()>;

    /// Invoke the entry's target right away.
    async fn fire_now(&self, entry: &ScheduleEntry) -> Result<()>;
}

/// Applies the retry budget and backoff policy in front of a [`Scheduler`].
#[derive(Clone)]
pub struct ScheduleController {
    scheduler: Arc<dyn Scheduler>,
    max_retries: u32,
    base_delay_minutes: u64,
}

impl ScheduleController {
    pub fn new(scheduler: Arc<dyn Scheduler>, max_retries: u32, base_delay_minutes: u64) -> Self {
        Self {
            scheduler,
            max_retries,
            base_delay_minutes,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Schedule attempt `retry_count` using the configured backoff step.
    pub async fn schedule_with_backoff(&self, kind: ScheduleKind, batch_id: &str, retry_count: u32) -> Result<ScheduleOutcome> {
        self.schedule(kind, batch_id, retry_count, self.base_delay_minutes).await
    }

    /// Schedule attempt `retry_count`, firing `base_delay_minutes * retry_count` from now.
    #[instrument(skip(self), err)]
    pub async fn schedule(&self, kind: ScheduleKind, batch_id: &str, retry_count: u32, base_delay_minutes: u64) -> Result<ScheduleOutcome> {
        if retry_count > self.max_retries {
            warn!(max_retries = self.max_retries, "Retry budget exhausted, not scheduling");
            metrics::counter!("notifyctl_retry_budget_exhausted_total", "kind" => kind.as_str()).increment(1);
            return Ok(ScheduleOutcome::BudgetExhausted);
        }

        let delay_minutes = base_delay_minutes.saturating_mul(u64::from(retry_count));
        let fire_at = i64::try_from(delay_minutes)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .ok_or_else(|| Error::Scheduler {
                message: format!("delay of {delay_minutes} minutes is out of range"),
            })?;
        let entry = ScheduleEntry {
            kind,
            payload: SchedulePayload {
                batch_id: batch_id.to_string(),
                retries: retry_count,
            },
            fire_at,
        };

        if delay_minutes == 0 {
            self.scheduler.fire_now(&entry).await?;
            info!("Fired immediately");
            return Ok(ScheduleOutcome::FiredImmediately);
        }

        self.scheduler.create_schedule(&entry).await?;
        metrics::counter!("notifyctl_schedules_created_total", "kind" => kind.as_str()).increment(1);
        info!(fire_at = %entry.fire_at, "Schedule created");
        Ok(ScheduleOutcome::Scheduled { fire_at: entry.fire_at })
    }
}
