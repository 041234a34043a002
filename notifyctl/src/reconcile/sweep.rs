//! Reports batches whose records are stuck before `sending`.
//!
//! Two kinds are reported:
//!
//! - `requested` records are not claimable again. They stay `requested` while a batch retry is
//!   pending and for good once the retry budget is exhausted.
//! - Claimed records still in `new` failed to be referenced and then could not be released. A
//!   batch that is being referenced while the sweep runs also shows up here, briefly.
//!
//! A non-zero gauge that does not drain is the operational signal to look at.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::{
    errors::Result,
    queue::QueueStore,
    types::{BatchId, MessageStatus},
};

#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    /// Batches with records left in `requested`
    pub stuck_batches: Vec<BatchId>,
    /// Batches with claimed records that never got a reference
    pub unreferenced_batches: Vec<BatchId>,
}

pub struct StuckRequestSweeper {
    store: Arc<dyn QueueStore>,
}

impl StuckRequestSweeper {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self), err)]
    pub async fn sweep_stuck_requested(&self) -> Result<SweepReport> {
        let stuck_batches = self.store.fetch_batch_ids_with_status(MessageStatus::Requested).await;
        let unreferenced_batches = self.store.fetch_batch_ids_with_status(MessageStatus::New).await;
        if stuck_batches.is_empty() && unreferenced_batches.is_empty() {
            self.store.health_check().await?;
        }

        for batch_id in &stuck_batches {
            warn!(%batch_id, "Batch has records stuck in requested");
        }
        for batch_id in &unreferenced_batches {
            warn!(%batch_id, "Batch has claimed records that were never referenced");
        }
        metrics::gauge!("notifyctl_stuck_requested_batches").set(stuck_batches.len() as f64);
        metrics::gauge!("notifyctl_unreferenced_claimed_batches").set(unreferenced_batches.len() as f64);
        info!(stuck = stuck_batches.len(), unreferenced = unreferenced_batches.len(), "Sweep finished");

        Ok(SweepReport {
            stuck_batches,
            unreferenced_batches,
        })
    }
}
