//! Fixed-rate scheduler driving every site monitor.
//!
//! One tick per poll interval. Each tick spawns one task per site; a site
//! whose previous evaluation still holds its monitor lock is skipped for that
//! tick so evaluations of one site never overlap. Failures stay inside the
//! site's task. Cancellation stops the ticker, then in-flight evaluations are
//! drained before `run` returns.

use linkcycle_common::{MonitorConfig, Phase, SiteId, TriggerPolicy};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::monitor::{SiteMonitor, TickOutcome};
use crate::remediation::RemediationClient;
use crate::telemetry::TelemetryClient;

/// Per-tick bookkeeping, mostly for logs and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Sites whose evaluation was started this tick
    pub started: usize,
    /// Sites skipped because their previous evaluation was still running
    pub busy: usize,
}

pub struct Scheduler {
    monitors: Vec<(SiteId, Arc<Mutex<SiteMonitor>>)>,
    telemetry: Arc<dyn TelemetryClient>,
    remediator: Arc<dyn RemediationClient>,
    policy: TriggerPolicy,
}

impl Scheduler {
    pub fn new(
        config: &MonitorConfig,
        telemetry: Arc<dyn TelemetryClient>,
        remediator: Arc<dyn RemediationClient>,
    ) -> Self {
        let monitors = config
            .sites
            .iter()
            .map(|site| {
                let monitor = SiteMonitor::new(site.clone(), config.policy);
                (site.site_id, Arc::new(Mutex::new(monitor)))
            })
            .collect();

        Self {
            monitors,
            telemetry,
            remediator,
            policy: config.policy,
        }
    }

    /// Handle to one site's monitor
    pub fn monitor(&self, site_id: SiteId) -> Option<Arc<Mutex<SiteMonitor>>> {
        self.monitors
            .iter()
            .find(|(id, _)| *id == site_id)
            .map(|(_, monitor)| Arc::clone(monitor))
    }

    pub fn site_count(&self) -> usize {
        self.monitors.len()
    }

    /// Run until `cancel` fires, then wait for in-flight evaluations.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Monitoring {} site(s) every {:?} (threshold {})",
            self.monitors.len(),
            self.policy.poll_interval,
            self.policy.failure_threshold
        );

        let mut ticker = interval(self.policy.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut in_flight = JoinSet::new();
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            reap_finished(&mut in_flight);
            tick += 1;
            let report = self.spawn_tick(&mut in_flight);
            debug!(
                tick,
                started = report.started,
                busy = report.busy,
                "Health checks dispatched"
            );
        }

        info!(
            "Shutdown requested, waiting for {} in-flight evaluation(s)",
            in_flight.len()
        );
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Site evaluation task failed: {}", e);
            }
        }
        info!("Scheduler stopped");
    }

    /// Run one tick for every site and wait for all of them.
    pub async fn tick_once(&self) -> TickReport {
        let mut in_flight = JoinSet::new();
        let report = self.spawn_tick(&mut in_flight);
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Site evaluation task failed: {}", e);
            }
        }
        report
    }

    fn spawn_tick(&self, in_flight: &mut JoinSet<()>) -> TickReport {
        let mut report = TickReport::default();

        for (site_id, monitor) in &self.monitors {
            // Taken here, not inside the task, so a busy site is detected
            // before anything new is started for it.
            let guard = match Arc::clone(monitor).try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    warn!(
                        site_id = %site_id,
                        "Previous evaluation still running, skipping this tick"
                    );
                    report.busy += 1;
                    continue;
                }
            };

            let telemetry = Arc::clone(&self.telemetry);
            let remediator = Arc::clone(&self.remediator);
            let threshold = self.policy.failure_threshold;

            in_flight.spawn(async move {
                let mut monitor = guard;
                let outcome = monitor.tick(telemetry.as_ref(), remediator.as_ref()).await;
                let state = monitor.state();
                match outcome {
                    TickOutcome::Evaluated(_) => info!(
                        site_id = %monitor.site().site_id,
                        phase = %state.phase,
                        "Site {} status: {}/{} probes reported down",
                        monitor.site().site_id,
                        shown_failures(state.phase, state.consecutive_failures, threshold),
                        threshold
                    ),
                    TickOutcome::Skipped(_) => debug!(
                        site_id = %monitor.site().site_id,
                        "Site status unchanged (telemetry unavailable)"
                    ),
                }
            });
            report.started += 1;
        }

        report
    }
}

/// Failures shown in the per-site status line; the retry count while
/// remediating can exceed the threshold.
fn shown_failures(phase: Phase, failures: u32, threshold: u32) -> u32 {
    match phase {
        Phase::Remediating => threshold,
        _ => failures.min(threshold),
    }
}

fn reap_finished(in_flight: &mut JoinSet<()>) {
    while let Some(joined) = in_flight.try_join_next() {
        if let Err(e) = joined {
            error!("Site evaluation task failed: {}", e);
        }
    }
}
