//! Remediation client abstraction.
//!
//! One operation: power-cycle outlet N on a given UPS. Implementations must
//! be safe to call again after a failure; the monitor retries on the next
//! unhealthy tick.

use async_trait::async_trait;
use linkcycle_common::MonitorError;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// Remediation Client Trait
// ============================================================================

#[async_trait]
pub trait RemediationClient: Send + Sync {
    /// Cycle the outlet and return only once its final state is known
    async fn cycle_outlet(&self, ups_address: &str, outlet_id: u32) -> Result<(), MonitorError>;
}

// ============================================================================
// Recording Remediator (Testing)
// ============================================================================

/// Records every cycle request. Queued failures are returned first, then
/// every call succeeds.
#[derive(Default)]
pub struct RecordingRemediator {
    calls: Mutex<Vec<(String, u32)>>,
    failures: Mutex<VecDeque<String>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingRemediator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls with `reason`
    pub fn fail_next(&self, count: usize, reason: &str) {
        let mut failures = self.failures.lock().unwrap();
        for _ in 0..count {
            failures.push_back(reason.to_string());
        }
    }

    /// Make every call take this long
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl RemediationClient for RecordingRemediator {
    async fn cycle_outlet(&self, ups_address: &str, outlet_id: u32) -> Result<(), MonitorError> {
        self.calls
            .lock()
            .unwrap()
            .push((ups_address.to_string(), outlet_id));

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().unwrap().pop_front();
        match failure {
            Some(reason) => Err(MonitorError::remediation(ups_address, outlet_id, reason)),
            None => Ok(()),
        }
    }
}
