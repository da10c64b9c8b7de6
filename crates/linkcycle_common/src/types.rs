//! Domain types shared by the daemon and its tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Site identifier as used by the SD-WAN controller (`site-id`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub u64);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SiteId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(SiteId)
    }
}

/// Phase of a site's link state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Link up, no failures counted
    Healthy,
    /// Failures counted, threshold not reached yet
    Degrading,
    /// Threshold reached, power-cycle pending or being retried
    Remediating,
    /// Power-cycle succeeded; waiting for the link to come back
    Cooldown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Healthy => "healthy",
            Phase::Degrading => "degrading",
            Phase::Remediating => "remediating",
            Phase::Cooldown => "cooldown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable per-site state, owned by exactly one site monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkState {
    pub consecutive_failures: u32,
    pub last_action_at: Option<DateTime<Utc>>,
    pub phase: Phase,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            last_action_at: None,
            phase: Phase::Healthy,
        }
    }
}

/// One telemetry sample for one site, consumed immediately
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthObservation {
    pub site_id: SiteId,
    pub link_healthy: bool,
    pub observed_at: DateTime<Utc>,
}

impl HealthObservation {
    pub fn new(site_id: SiteId, link_healthy: bool) -> Self {
        Self {
            site_id,
            link_healthy,
            observed_at: Utc::now(),
        }
    }

    pub fn healthy(site_id: SiteId) -> Self {
        Self::new(site_id, true)
    }

    pub fn unhealthy(site_id: SiteId) -> Self {
        Self::new(site_id, false)
    }
}
