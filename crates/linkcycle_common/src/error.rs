//! Error types for linkcycle.

use thiserror::Error;

use crate::types::SiteId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    /// Controller could not answer for this site on this tick
    #[error("Telemetry unavailable for site {site_id}: {reason}")]
    TelemetryUnavailable { site_id: SiteId, reason: String },

    /// Power-cycle did not complete with a confirmed outlet state
    #[error("Remediation failed for outlet {outlet} on UPS {ups}: {reason}")]
    RemediationFailed {
        ups: String,
        outlet: u32,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),
}

impl MonitorError {
    pub fn telemetry(site_id: SiteId, reason: impl Into<String>) -> Self {
        MonitorError::TelemetryUnavailable {
            site_id,
            reason: reason.into(),
        }
    }

    pub fn remediation(ups: &str, outlet: u32, reason: impl Into<String>) -> Self {
        MonitorError::RemediationFailed {
            ups: ups.to_string(),
            outlet,
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        MonitorError::ConfigurationInvalid(reason.into())
    }

    /// Transient errors are contained in the site's tick and retried later.
    /// Everything else must stop the process before monitoring starts.
    pub fn is_transient(&self) -> bool {
        match self {
            MonitorError::TelemetryUnavailable { .. } => true,
            MonitorError::RemediationFailed { .. } => true,
            MonitorError::ConfigurationInvalid(_) => false,
        }
    }

    /// Short stable name used as a log field
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorError::TelemetryUnavailable { .. } => "telemetry_unavailable",
            MonitorError::RemediationFailed { .. } => "remediation_failed",
            MonitorError::ConfigurationInvalid(_) => "configuration_invalid",
        }
    }
}
