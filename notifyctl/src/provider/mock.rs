//! Scripted [`MessagingProvider`] that records every call.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{MessagingProvider, ProviderResponse};
use crate::{
    errors::{Error, Result},
    types::{MessageReference, QueueRecord},
};

/// Record of a batch sent through the mock provider.
#[derive(Debug, Clone)]
pub struct SentBatch {
    pub batch_id: String,
    pub routing_plan_id: String,
    pub recipients: Vec<QueueRecord>,
}

#[derive(Clone, Default)]
pub struct MockProvider {
    send_responses: Arc<Mutex<VecDeque<Result<ProviderResponse>>>>,
    read_references: Arc<Mutex<HashMap<String, Result<Vec<MessageReference>>>>>,
    sent: Arc<Mutex<Vec<SentBatch>>>,
    status_queries: Arc<Mutex<Vec<String>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the HTTP status returned by the next send. Unscripted sends answer 201.
    pub fn respond_with_status(&self, status: u16) {
        self.send_responses.lock().push_back(Ok(ProviderResponse {
            status,
            body: String::new(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }));
    }

    pub fn fail_next_send(&self, error: Error) {
        self.send_responses.lock().push_back(Err(error));
    }

    pub fn set_read_references(&self, batch_id: &str, references: &[&str]) {
        self.read_references
            .lock()
            .insert(batch_id.to_string(), Ok(references.iter().map(|r| r.to_string()).collect()));
    }

    pub fn fail_status_query(&self, batch_id: &str, status: u16) {
        self.read_references.lock().insert(
            batch_id.to_string(),
            Err(Error::Provider {
                status,
                body: "provider unavailable".to_string(),
            }),
        );
    }

    pub fn sent_batches(&self) -> Vec<SentBatch> {
        self.sent.lock().clone()
    }

    pub fn status_queries(&self) -> Vec<String> {
        self.status_queries.lock().clone()
    }
}

#[async_trait]
impl MessagingProvider for MockProvider {
    async fn send_batch_message(&self, batch_id: &str, routing_plan_id: &str, recipients: &[QueueRecord]) -> Result<ProviderResponse> {
        self.sent.lock().push(SentBatch {
            batch_id: batch_id.to_string(),
            routing_plan_id: routing_plan_id.to_string(),
            recipients: recipients.to_vec(),
        });

        self.send_responses.lock().pop_front().unwrap_or_else(|| {
            Ok(ProviderResponse {
                status: 201,
                body: String::new(),
                correlation_id: uuid::Uuid::new_v4().to_string(),
            })
        })
    }

    async fn fetch_read_references(&self, batch_id: &str) -> Result<Vec<MessageReference>> {
        self.status_queries.lock().push(batch_id.to_string());

        match self.read_references.lock().remove(batch_id) {
            Some(result) => result,
            None => Ok(Vec::new()),
        }
    }
}
