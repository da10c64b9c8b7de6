//! Site monitor: the per-site link state machine.
//!
//! ```text
//!            down (< count)              down (== count)
//!  Healthy ─────────────────► Degrading ─────────────────► Remediating
//!     ▲  ◄──────── up ────────────┘                          │    ▲
//!     │                                      cycle ok        │    │ cycle failed,
//!     └────────── up ─────────── Cooldown ◄──────────────────┘    │ retry next down tick
//!                                   │                             │
//!                                   └── down: counter restarts ──► Degrading
//! ```
//!
//! A healthy observation always resets the failure counter. The counter only
//! reaches the threshold through strictly consecutive down observations, and
//! every entry into `Remediating` issues exactly one power-cycle call.

use chrono::Utc;
use linkcycle_common::{
    HealthObservation, LinkState, MonitorError, Phase, SiteConfig, TriggerPolicy,
};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::remediation::RemediationClient;
use crate::telemetry::TelemetryClient;

/// Result of feeding one observation to a site monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub from: Phase,
    pub phase: Phase,
    /// A power-cycle call was issued during this evaluation
    pub action_taken: bool,
    /// Set when the power-cycle call failed or timed out
    pub remediation_error: Option<MonitorError>,
}

/// Result of one scheduler tick for one site
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Evaluated(Evaluation),
    /// Telemetry could not be read; state untouched
    Skipped(MonitorError),
}

/// State machine for one monitored site
#[derive(Debug)]
pub struct SiteMonitor {
    site: SiteConfig,
    policy: TriggerPolicy,
    state: LinkState,
}

impl SiteMonitor {
    pub fn new(site: SiteConfig, policy: TriggerPolicy) -> Self {
        Self {
            site,
            policy,
            state: LinkState::default(),
        }
    }

    pub fn site(&self) -> &SiteConfig {
        &self.site
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Query telemetry for this site and evaluate the answer.
    ///
    /// Telemetry errors and timeouts skip the tick without touching state.
    pub async fn tick(
        &mut self,
        telemetry: &dyn TelemetryClient,
        remediator: &dyn RemediationClient,
    ) -> TickOutcome {
        let site_id = self.site.site_id;
        let query = telemetry.get_link_health(site_id, &self.site.transport_color);

        let healthy = match timeout(self.policy.telemetry_timeout, query).await {
            Ok(Ok(healthy)) => healthy,
            Ok(Err(err)) => return self.skip(err),
            Err(_) => {
                return self.skip(MonitorError::telemetry(
                    site_id,
                    format!("no answer within {:?}", self.policy.telemetry_timeout),
                ))
            }
        };

        let observation = HealthObservation::new(site_id, healthy);
        TickOutcome::Evaluated(self.evaluate(&observation, remediator).await)
    }

    fn skip(&self, err: MonitorError) -> TickOutcome {
        warn!(
            site_id = %self.site.site_id,
            phase = %self.state.phase,
            consecutive_failures = self.state.consecutive_failures,
            error_kind = err.kind(),
            "Skipping tick: {}",
            err
        );
        TickOutcome::Skipped(err)
    }

    /// Apply one observation, issuing the power-cycle when `Remediating` is
    /// entered.
    pub async fn evaluate(
        &mut self,
        observation: &HealthObservation,
        remediator: &dyn RemediationClient,
    ) -> Evaluation {
        let from = self.state.phase;

        if observation.site_id != self.site.site_id {
            warn!(
                site_id = %self.site.site_id,
                observed_site = %observation.site_id,
                "Ignoring observation for another site"
            );
            return Evaluation {
                from,
                phase: from,
                action_taken: false,
                remediation_error: None,
            };
        }

        let to = self.advance(observation.link_healthy);
        if from != to {
            self.log_transition(from, to, None);
        } else {
            debug!(
                site_id = %self.site.site_id,
                phase = %to,
                consecutive_failures = self.state.consecutive_failures,
                "No phase change"
            );
        }

        if to != Phase::Remediating {
            return Evaluation {
                from,
                phase: to,
                action_taken: false,
                remediation_error: None,
            };
        }

        let remediation_error = self.remediate(remediator).await.err();
        Evaluation {
            from,
            phase: self.state.phase,
            action_taken: true,
            remediation_error,
        }
    }

    /// Counter and phase update for one observation, no side effects
    fn advance(&mut self, link_healthy: bool) -> Phase {
        let state = &mut self.state;

        if link_healthy {
            state.consecutive_failures = 0;
            state.phase = Phase::Healthy;
            return state.phase;
        }

        state.phase = match state.phase {
            Phase::Cooldown => {
                // The power-cycle already answered this episode; start a
                // fresh count before another one is allowed.
                state.consecutive_failures = 0;
                Phase::Degrading
            }
            Phase::Remediating => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                Phase::Remediating
            }
            Phase::Healthy | Phase::Degrading => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.consecutive_failures >= self.policy.failure_threshold {
                    Phase::Remediating
                } else {
                    Phase::Degrading
                }
            }
        };
        state.phase
    }

    async fn remediate(&mut self, remediator: &dyn RemediationClient) -> Result<(), MonitorError> {
        let ups = self.site.ups_address.clone();
        let outlet = self.site.outlet_id;

        info!(
            site_id = %self.site.site_id,
            ups = %ups,
            outlet,
            consecutive_failures = self.state.consecutive_failures,
            "Link down past threshold, power-cycling modem outlet"
        );

        let call = remediator.cycle_outlet(&ups, outlet);
        let result = match timeout(self.policy.remediation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(MonitorError::remediation(
                &ups,
                outlet,
                format!(
                    "no result within {:?}",
                    self.policy.remediation_timeout
                ),
            )),
        };

        match &result {
            Ok(()) => {
                self.state.consecutive_failures = 0;
                self.state.last_action_at = Some(Utc::now());
                self.state.phase = Phase::Cooldown;
                self.log_transition(Phase::Remediating, Phase::Cooldown, Some(Ok(())));
            }
            Err(err) => {
                self.log_transition(Phase::Remediating, Phase::Remediating, Some(Err(err)));
            }
        }
        result
    }

    fn log_transition(&self, from: Phase, to: Phase, outcome: Option<Result<(), &MonitorError>>) {
        let site_id = self.site.site_id;
        let failures = self.state.consecutive_failures;
        match outcome {
            None => info!(
                site_id = %site_id,
                from = %from,
                to = %to,
                consecutive_failures = failures,
                "Link phase changed"
            ),
            Some(Ok(())) => info!(
                site_id = %site_id,
                from = %from,
                to = %to,
                consecutive_failures = failures,
                outcome = "success",
                "Power-cycle completed"
            ),
            Some(Err(err)) => error!(
                site_id = %site_id,
                from = %from,
                to = %to,
                consecutive_failures = failures,
                outcome = "failed",
                "Power-cycle failed, will retry on next down tick: {}",
                err
            ),
        }
    }
}
