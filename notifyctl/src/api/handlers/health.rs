use axum::extract::State;

use crate::{AppState, errors::Error};

// GET /healthz - Store reachability
pub async fn healthz(State(state): State<AppState>) -> Result<&'static str, Error> {
    state.store.health_check().await?;
    Ok("OK")
}
