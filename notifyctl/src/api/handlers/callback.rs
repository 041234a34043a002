use axum::{Json, extract::State, http::HeaderMap};
use bytes::Bytes;

use crate::{
    AppState,
    errors::Error,
    provider::{API_KEY_HEADER, signing::SIGNATURE_HEADER},
    reconcile::callback::CallbackResponse,
};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

// POST /callback - Provider read notification. The body is taken as raw bytes so the
// signature is checked against exactly what was received.
pub async fn receive_callback(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<CallbackResponse>, Error> {
    let response = state
        .callbacks
        .handle(header(&headers, API_KEY_HEADER), header(&headers, SIGNATURE_HEADER), &body)
        .await?;
    Ok(Json(response))
}
