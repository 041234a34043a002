//! [`Scheduler`] that records entries instead of calling anything.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{ScheduleEntry, Scheduler};
use crate::errors::{Error, Result};

#[derive(Default)]
pub struct RecordingScheduler {
    created: Mutex<Vec<ScheduleEntry>>,
    fired: Mutex<Vec<ScheduleEntry>>,
    unavailable: AtomicBool,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> Vec<ScheduleEntry> {
        self.created.lock().clone()
    }

    pub fn fired(&self) -> Vec<ScheduleEntry> {
        self.fired.lock().clone()
    }

    /// When set, every call fails as if the scheduling service were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Scheduler {
                message: "scheduling service unavailable".to_string(),
            });
        }
        Ok(())
    }

    /// Total calls into the scheduling mechanism.
    pub fn call_count(&self) -> usize {
        self.created.lock().len() + self.fired.lock().len()
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn create_schedule(&self, entry: &ScheduleEntry) -> Result<()> {
        self.check_available()?;
        self.created.lock().push(entry.clone());
        Ok(())
    }

    async fn fire_now(&self, entry: &ScheduleEntry) -> Result<()> {
        self.check_available()?;
        self.fired.lock().push(entry.clone());
        Ok(())
    }
}
