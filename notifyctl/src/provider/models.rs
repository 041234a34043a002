//! Wire models for the messaging provider API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    errors::{Error, Result},
    types::QueueRecord,
};

/// `POST /message/batch` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMessageRequest {
    pub data: MessageBatchData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBatchData {
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: MessageBatchAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBatchAttributes {
    pub routing_plan_id: String,
    /// Batch-level idempotency key
    pub message_batch_reference: String,
    pub messages: Vec<BatchMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMessage {
    /// Message-level idempotency key: the recipient's own message id
    pub message_reference: String,
    pub recipient: MessageRecipient,
    pub personalisation: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecipient {
    pub nhs_number: String,
}

/// Build the batch request: one message per recipient, all under the shared batch reference.
///
/// Every recipient must already carry its message reference.
pub fn build_batch_request(routing_plan_id: &str, batch_reference: &str, recipients: &[QueueRecord]) -> Result<BatchMessageRequest> {
    let messages = recipients
        .iter()
        .map(|recipient| {
            let message_reference = recipient.message_id.clone().ok_or_else(|| Error::Internal {
                operation: format!("build batch request: recipient {} has no message reference", recipient.nhs_number),
            })?;

            Ok(BatchMessage {
                message_reference,
                recipient: MessageRecipient {
                    nhs_number: recipient.nhs_number.clone(),
                },
                personalisation: Map::new(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(BatchMessageRequest {
        data: MessageBatchData {
            kind: "MessageBatch".to_string(),
            attributes: MessageBatchAttributes {
                routing_plan_id: routing_plan_id.to_string(),
                message_batch_reference: batch_reference.to_string(),
                messages,
            },
        },
    })
}

/// `GET /statuses` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusesResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub data: Vec<MessageStatusEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageStatusEntry {
    pub message_reference: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default, rename = "channelStatus")]
    pub channel_status: Option<String>,
    #[serde(default, rename = "supplierStatus")]
    pub supplier_status: Option<String>,
}
