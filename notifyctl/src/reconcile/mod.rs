//! Status reconciliation: moving sent messages to `read`.
//!
//! Two strategies share [`QueueStore::update_status_by_reference`](crate::queue::QueueStore):
//! [`poll::PollReconciler`] asks the provider per batch, [`callback::CallbackReconciler`] handles
//! the provider's signed webhook. [`sweep::StuckRequestSweeper`] reports the other end of the
//! pipeline, records that never got past `requested`.

pub mod callback;
pub mod idempotency;
pub mod poll;
pub mod sweep;
