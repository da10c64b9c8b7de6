//! Telemetry client abstraction.
//!
//! The site monitor only needs one question answered per tick: is at least
//! one path-verification session on this site's transport up? Production
//! uses `VManageClient`; tests use `ScriptedTelemetry`.

use async_trait::async_trait;
use linkcycle_common::{MonitorError, SiteId};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// Telemetry Client Trait
// ============================================================================

#[async_trait]
pub trait TelemetryClient: Send + Sync {
    /// `Ok(true)` if any session on `transport_color` is up, `Ok(false)` if
    /// all are down, `Err(TelemetryUnavailable)` if that cannot be determined.
    async fn get_link_health(
        &self,
        site_id: SiteId,
        transport_color: &str,
    ) -> Result<bool, MonitorError>;
}

// ============================================================================
// Scripted Telemetry (Testing)
// ============================================================================

/// Replays queued answers per site. An empty queue answers healthy.
#[derive(Default)]
pub struct ScriptedTelemetry {
    scripts: Mutex<HashMap<SiteId, VecDeque<Result<bool, MonitorError>>>>,
    delays: Mutex<HashMap<SiteId, Duration>>,
    calls: Mutex<HashMap<SiteId, usize>>,
}

impl ScriptedTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue answers for a site, consumed one per query
    pub fn push(&self, site_id: SiteId, answers: impl IntoIterator<Item = Result<bool, MonitorError>>) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.entry(site_id).or_default().extend(answers);
    }

    /// Queue `count` down observations for a site
    pub fn push_down(&self, site_id: SiteId, count: usize) {
        self.push(site_id, std::iter::repeat(Ok(false)).take(count));
    }

    /// Queue `count` up observations for a site
    pub fn push_up(&self, site_id: SiteId, count: usize) {
        self.push(site_id, std::iter::repeat(Ok(true)).take(count));
    }

    /// Queue one controller failure for a site
    pub fn push_unavailable(&self, site_id: SiteId) {
        self.push(
            site_id,
            [Err(MonitorError::telemetry(site_id, "scripted outage"))],
        );
    }

    /// Make every query for a site take this long
    pub fn set_delay(&self, site_id: SiteId, delay: Duration) {
        self.delays.lock().unwrap().insert(site_id, delay);
    }

    pub fn calls(&self, site_id: SiteId) -> usize {
        self.calls.lock().unwrap().get(&site_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TelemetryClient for ScriptedTelemetry {
    async fn get_link_health(
        &self,
        site_id: SiteId,
        _transport_color: &str,
    ) -> Result<bool, MonitorError> {
        *self.calls.lock().unwrap().entry(site_id).or_default() += 1;

        let delay = self.delays.lock().unwrap().get(&site_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&site_id)
            .and_then(|queue| queue.pop_front());
        next.unwrap_or(Ok(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_answers_in_order() {
        let telemetry = ScriptedTelemetry::new();
        let site = SiteId(7);
        telemetry.push_down(site, 1);
        telemetry.push_unavailable(site);

        assert_eq!(telemetry.get_link_health(site, "mpls").await, Ok(false));
        assert!(telemetry.get_link_health(site, "mpls").await.is_err());
        // Exhausted script falls back to healthy
        assert_eq!(telemetry.get_link_health(site, "mpls").await, Ok(true));
        assert_eq!(telemetry.calls(site), 3);
        assert_eq!(telemetry.calls(SiteId(8)), 0);
    }
}
