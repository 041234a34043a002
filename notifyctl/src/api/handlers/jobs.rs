//! Job endpoints. Each call is one independent unit of work; state travels in the store and,
//! for scheduled jobs, in the `{"batch_id", "retries"}` payload.

use axum::{Json, extract::State};

use crate::{
    AppState,
    errors::Error,
    processor::{BatchOutcome, RunSummary},
    reconcile::{
        poll::{ReconcileReport, StatusCheckReport},
        sweep::SweepReport,
    },
    scheduler::SchedulePayload,
};

// POST /jobs/send - Claim and send batches until none remain
pub async fn send_batches(State(state): State<AppState>) -> Result<Json<RunSummary>, Error> {
    Ok(Json(state.processor.run().await?))
}

// POST /jobs/batch-retry - Re-send a batch whose earlier send failed
pub async fn retry_batch(State(state): State<AppState>, Json(payload): Json<SchedulePayload>) -> Result<Json<BatchOutcome>, Error> {
    Ok(Json(state.processor.retry_batch(&payload).await?))
}

// POST /jobs/status-check - Poll one batch and re-arm while unread
pub async fn status_check(State(state): State<AppState>, Json(payload): Json<SchedulePayload>) -> Result<Json<StatusCheckReport>, Error> {
    Ok(Json(state.poller.reconcile_batch(&payload).await?))
}

// POST /jobs/reconcile - Poll every batch still in sending
pub async fn reconcile(State(state): State<AppState>) -> Result<Json<ReconcileReport>, Error> {
    Ok(Json(state.poller.reconcile_all().await?))
}

// POST /jobs/sweep - Report batches stuck in requested
pub async fn sweep(State(state): State<AppState>) -> Result<Json<SweepReport>, Error> {
    Ok(Json(state.sweeper.sweep_stuck_requested().await?))
}
