//! Guard for the job endpoints, which only the scheduler and operators may trigger.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};

use crate::{AppState, errors::Error, provider::signing::constant_time_eq};

/// Reject job requests without `Authorization: Bearer <scheduler.job_token>`.
pub async fn require_job_token(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, Error> {
    let expected = state.config.scheduler.job_token.as_bytes();
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer ").or_else(|| auth.strip_prefix("bearer ")))
        .map(str::trim);

    match presented {
        Some(token) if !expected.is_empty() && constant_time_eq(token.as_bytes(), expected) => Ok(next.run(request).await),
        _ => Err(Error::Unauthenticated {
            message: Some("Missing or invalid job token".to_string()),
        }),
    }
}
