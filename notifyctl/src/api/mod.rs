//! HTTP surface: the provider's callback webhook and the job endpoints the scheduler fires.

pub mod handlers;
pub mod middleware;
