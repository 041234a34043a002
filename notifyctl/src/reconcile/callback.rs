//! Callback strategy: the provider pushes a signed read notification per message.
//!
//! Checks run in a fixed order and each failure short-circuits before any later step:
//!
//! 1. `x-api-key` must match the configured key (401).
//! 2. The HMAC over the raw body bytes must match `x-hmac-sha256-signature` (403). This happens
//!    before parsing so that nothing re-serialized is ever verified.
//! 3. The body must be JSON (400) carrying `data[0].meta.idempotencyKey` (400).
//! 4. An already-processed key is acknowledged with 200 and no store access.
//! 5. `data[0].attributes.messageReference` (400) is looked up and moved to `read`.
//!
//! Unknown references are acknowledged with 200 so the provider does not retry them; only
//! infrastructure failures answer 500.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::idempotency::IdempotencyStore;
use crate::{
    errors::{Error, Result},
    provider::signing::{constant_time_eq, verify_signature},
    queue::{QueueStore, UPDATE_APPLIED, UPDATE_UNKNOWN_REFERENCE},
    types::{MessageReference, MessageStatus},
};

/// Body of a 200 callback response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackResponse {
    pub message: String,
    pub message_reference: Option<MessageReference>,
    pub response_code: Option<i32>,
}

pub struct CallbackReconciler {
    store: Arc<dyn QueueStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    api_key: String,
    secret: String,
}

impl CallbackReconciler {
    pub fn new(store: Arc<dyn QueueStore>, idempotency: Arc<dyn IdempotencyStore>, api_key: String, secret: String) -> Self {
        Self {
            store,
            idempotency,
            api_key,
            secret,
        }
    }

    /// Process one callback delivery, recording its outcome as a metric.
    pub async fn handle(&self, api_key: Option<&str>, signature: Option<&str>, body: &[u8]) -> Result<CallbackResponse> {
        let result = self.process(api_key, signature, body).await;

        let outcome = match &result {
            Ok(response) if response.response_code.is_none() => "duplicate",
            Ok(response) if response.response_code == Some(UPDATE_APPLIED) => "applied",
            Ok(_) => "unknown_reference",
            Err(e) if e.status_code().is_client_error() => "rejected",
            Err(_) => "error",
        };
        metrics::counter!("notifyctl_callbacks_total", "outcome" => outcome).increment(1);

        result
    }

    #[instrument(skip_all, err)]
    async fn process(&self, api_key: Option<&str>, signature: Option<&str>, body: &[u8]) -> Result<CallbackResponse> {
        let key_matches = api_key.is_some_and(|key| constant_time_eq(key.as_bytes(), self.api_key.as_bytes()));
        if !key_matches {
            return Err(Error::Unauthenticated {
                message: Some("Invalid API key".to_string()),
            });
        }

        let signature = signature.ok_or(Error::InvalidSignature)?;
        if !verify_signature(body, signature, &self.secret) {
            return Err(Error::InvalidSignature);
        }

        let payload: Value = serde_json::from_slice(body).map_err(|e| Error::BadRequest {
            message: format!("Invalid JSON body: {e}"),
        })?;

        let idempotency_key = payload
            .pointer("/data/0/meta/idempotencyKey")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadRequest {
                message: "Missing idempotencyKey".to_string(),
            })?;

        if self.idempotency.is_duplicate(idempotency_key).await? {
            debug!(idempotency_key, "Duplicate callback");
            return Ok(CallbackResponse {
                message: "Duplicate callback ignored".to_string(),
                message_reference: None,
                response_code: None,
            });
        }

        let message_reference = payload
            .pointer("/data/0/attributes/messageReference")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadRequest {
                message: "Missing messageReference".to_string(),
            })?;

        let record = self.store.find_by_message_reference(message_reference).await?;
        let response_code = match record.as_ref().and_then(|r| r.batch_id.as_deref()) {
            Some(batch_id) => {
                self.store
                    .update_status_by_reference(batch_id, message_reference, MessageStatus::Read)
                    .await?
            }
            None => UPDATE_UNKNOWN_REFERENCE,
        };

        if response_code == UPDATE_APPLIED {
            info!(message_reference, "Message marked read");
        } else {
            metrics::counter!("notifyctl_reconciliation_misses_total").increment(1);
            warn!(message_reference, response_code, "Callback for unknown message reference");
        }

        self.idempotency.record(idempotency_key).await?;

        Ok(CallbackResponse {
            message: "Callback processed".to_string(),
            message_reference: Some(message_reference.to_string()),
            response_code: Some(response_code),
        })
    }
}
