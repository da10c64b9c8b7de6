//! linkcycled library - exposes modules for testing.

pub mod eaton;
pub mod logging;
pub mod monitor;
pub mod remediation;
pub mod scheduler;
pub mod telemetry;
pub mod vmanage;

pub use monitor::{Evaluation, SiteMonitor, TickOutcome};
pub use remediation::{RecordingRemediator, RemediationClient};
pub use scheduler::{Scheduler, TickReport};
pub use telemetry::{ScriptedTelemetry, TelemetryClient};
