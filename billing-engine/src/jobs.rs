//! Periodic trigger for the daily billing jobs.

use crate::config::SchedulerConfig;
use crate::services::orchestrator::{BillingOrchestrator, DailyRunReport};
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, instrument, warn};

/// Fires `run_daily_jobs` every `interval`. Runs are sequential, a slow run delays
/// the next tick instead of overlapping it.
pub struct Scheduler {
    orchestrator: BillingOrchestrator,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(orchestrator: BillingOrchestrator, config: SchedulerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Loop forever. Cancelled by dropping the future.
    pub async fn run(self) {
        let mut interval = time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first tick completes immediately.
        interval.tick().await;
        if self.config.run_on_startup {
            self.run_once().await;
        }

        info!(
            interval_secs = self.config.interval.as_secs(),
            "Billing scheduler started"
        );
        loop {
            interval.tick().await;
            self.run_once().await;
        }
    }

    /// Run every job once and log the outcome. A failed run is retried on the next tick.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Option<DailyRunReport> {
        match self.orchestrator.run_daily_jobs().await {
            Ok(report) => {
                let failures = report.failure_count();
                if failures > 0 {
                    warn!(
                        failures,
                        generated_invoices = report.generated_invoices.succeeded,
                        overdue_invoices = report.overdue_invoices.succeeded,
                        "Daily billing run finished with item failures"
                    );
                } else {
                    info!(
                        generated_invoices = report.generated_invoices.succeeded,
                        overdue_invoices = report.overdue_invoices.succeeded,
                        steps_sent = report.dunning.steps_sent,
                        "Daily billing run finished"
                    );
                }
                Some(report)
            }
            Err(e) => {
                error!(error = %e, "Daily billing run aborted");
                None
            }
        }
    }
}
