use super::CanonicalStore;
use crate::config::RetryPolicy;
use crate::domain::CanonicalRecord;
use crate::error::StoreError;
use std::time::Duration;
use tracing::{debug, warn};

/// Upserts canonical records, retrying `WriteConflict` with exponential backoff.
pub struct CanonicalWriter<'a, S: CanonicalStore + ?Sized> {
    store: &'a S,
    policy: RetryPolicy,
    sleep: fn(Duration),
}

impl<'a, S: CanonicalStore + ?Sized> CanonicalWriter<'a, S> {
    pub fn new(store: &'a S, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            sleep: std::thread::sleep,
        }
    }

    /// Replace the sleep function (tests use a no-op).
    pub fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    /// Write `record`; returns the number of attempts used.
    pub fn write(&self, record: &CanonicalRecord) -> Result<u32, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.upsert(record.clone()) {
                Ok(()) => {
                    debug!(key = %record.key(), attempt, "canonical record written");
                    return Ok(attempt);
                }
                Err(e) if e.is_retryable() && self.policy.can_retry(attempt) => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(key = %record.key(), attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying canonical write");
                    (self.sleep)(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
