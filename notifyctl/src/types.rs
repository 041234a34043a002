//! Domain types shared by the queue store, the batch processor and the reconcilers.

use bon::Builder;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Identifier shared by every record claimed into the same batch.
pub type BatchId = String;
/// Per-recipient message reference, unique across the whole queue.
pub type MessageReference = String;

/// Delivery status of a queued recipient.
///
/// Statuses are ordered: `new < requested < sending < read`. Stores only ever move a record
/// forward along this order; a write that would move it backwards is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Enrolled, not yet claimed into a batch
    New,
    /// Claimed and referenced, about to be sent
    Requested,
    /// Accepted by the messaging provider
    Sending,
    /// Read by the recipient
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::New => "new",
            MessageStatus::Requested => "requested",
            MessageStatus::Sending => "sending",
            MessageStatus::Read => "read",
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            MessageStatus::New => 0,
            MessageStatus::Requested => 1,
            MessageStatus::Sending => 2,
            MessageStatus::Read => 3,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown message status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for MessageStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(MessageStatus::New),
            "requested" => Ok(MessageStatus::Requested),
            "sending" | "sent" => Ok(MessageStatus::Sending),
            "read" => Ok(MessageStatus::Read),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Address and template fields supplied by enrollment. Carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Personalisation {
    pub variable_text_1: Option<String>,
    pub address_line_1: Option<String>,
    pub address_line_2: Option<String>,
    pub address_line_3: Option<String>,
    pub address_line_4: Option<String>,
    pub address_line_5: Option<String>,
    pub postcode: Option<String>,
    pub gp_practice_name: Option<String>,
}

/// One queued recipient/message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct QueueRecord {
    #[builder(into)]
    pub nhs_number: String,
    #[builder(into)]
    pub message_id: Option<MessageReference>,
    #[builder(into)]
    pub batch_id: Option<BatchId>,
    #[builder(into)]
    pub routing_plan_id: String,
    #[builder(default = MessageStatus::New)]
    pub message_status: MessageStatus,
    #[builder(default)]
    pub personalisation: Personalisation,
}

/// Result of a successful claim: the fresh batch id and the routing plan governing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimedBatch {
    pub batch_id: BatchId,
    pub routing_plan_id: String,
}
