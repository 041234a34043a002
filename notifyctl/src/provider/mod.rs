//! Signed messaging client for the external communications provider.
//!
//! One call to [`MessagingProvider::send_batch_message`] is exactly one outbound request for the
//! whole cohort. The client never retries: the provider honours `messageBatchReference` as an
//! idempotency key, so a later scheduled retry can safely repeat the request in full.

pub mod auth;
pub mod client;
pub mod models;
pub mod signing;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;

use crate::{
    errors::Result,
    types::{MessageReference, QueueRecord},
};

/// API key header, sent on every outbound request and checked on inbound callbacks.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Raw outcome of a batch send.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status: u16,
    pub body: String,
    /// Fresh per attempt, for tracing only
    pub correlation_id: String,
}

impl ProviderResponse {
    /// The provider accepted the batch. Only HTTP 201 counts.
    pub fn is_accepted(&self) -> bool {
        self.status == 201
    }
}

#[async_trait]
pub trait MessagingProvider: Send + Sync {
    /// Send one signed batch request. Transport failures are errors; any HTTP status is returned.
    async fn send_batch_message(&self, batch_id: &str, routing_plan_id: &str, recipients: &[QueueRecord]) -> Result<ProviderResponse>;

    /// References in the batch the provider reports as read. Any non-success status is an error.
    async fn fetch_read_references(&self, batch_id: &str) -> Result<Vec<MessageReference>>;
}
