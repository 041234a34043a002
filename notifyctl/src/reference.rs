//! Batch and message reference generation.
//!
//! References are random v4 UUIDs. Uniqueness comes from the generator's entropy; callers still
//! check a freshly generated message reference against the queue store before committing it
//! (see [`unique_message_reference`]).

use tracing::warn;
use uuid::Uuid;

use crate::{
    errors::{Error, Result},
    queue::QueueStore,
    types::{BatchId, MessageReference},
};

/// Attempts made before giving up on finding an unused message reference.
pub const MAX_REFERENCE_ATTEMPTS: usize = 5;

pub trait ReferenceGenerator: Send + Sync {
    fn new_message_reference(&self) -> MessageReference;

    fn new_batch_reference(&self) -> BatchId;
}

/// Generates random v4 UUID references.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidReferenceGenerator;

impl ReferenceGenerator for UuidReferenceGenerator {
    fn new_message_reference(&self) -> MessageReference {
        Uuid::new_v4().to_string()
    }

    fn new_batch_reference(&self) -> BatchId {
        Uuid::new_v4().to_string()
    }
}

/// Generate a message reference that no queued record carries yet, regenerating on a clash.
pub async fn unique_message_reference(generator: &dyn ReferenceGenerator, store: &dyn QueueStore) -> Result<MessageReference> {
    for _ in 0..MAX_REFERENCE_ATTEMPTS {
        let candidate = generator.new_message_reference();
        if !store.message_reference_exists(&candidate).await? {
            return Ok(candidate);
        }
        warn!(message_reference = %candidate, "Generated message reference already exists, regenerating");
    }

    Err(Error::Internal {
        operation: format!("generate an unused message reference in {MAX_REFERENCE_ATTEMPTS} attempts"),
    })
}
