//! Billing orchestrator: the command and query surface of the engine.
//!
//! Every command loads the aggregates it touches, applies domain methods and persists
//! the result through a single `UnitOfWork`. Batch entry points walk their full
//! candidate set, isolating per-item failures in the returned report.

mod dunning;
mod invoices;
mod reporting;
mod subscriptions;

pub use reporting::{DunningStatistics, InvoiceStatistics, SubscriptionStatistics};

use crate::config::BillingSettings;
use crate::error::{BillingError, BillingResult};
use crate::models::{DunningSequence, Invoice, Plan, Subscription};
use crate::services::clock::Clock;
use crate::services::collaborators::{DunningNotifier, PaymentGateway};
use crate::services::metrics::{record_batch_run, record_error};
use crate::services::sequence::SequenceGenerator;
use crate::services::store::BillingStore;
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};
use uuid::Uuid;

/// One item that failed inside a batch job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    pub entity_id: Uuid,
    pub error: String,
}

/// Outcome of a batch job over one kind of aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub processed: u32,
    pub succeeded: u32,
    pub skipped: u32,
    pub failed: u32,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    fn succeed(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    fn skip(&mut self) {
        self.processed += 1;
        self.skipped += 1;
    }

    fn fail(&mut self, entity_id: Uuid, error: impl Display) {
        self.processed += 1;
        self.failed += 1;
        self.failures.push(BatchFailure {
            entity_id,
            error: error.to_string(),
        });
    }
}

/// Outcome of one run of the scheduled dunning job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DunningRunReport {
    pub retries_attempted: u32,
    pub retries_succeeded: u32,
    pub suspended: u32,
    pub deactivated: u32,
    pub steps_sent: u32,
    pub escalated: u32,
    pub failures: Vec<BatchFailure>,
}

impl DunningRunReport {
    fn fail(&mut self, entity_id: Uuid, error: impl Display) {
        self.failures.push(BatchFailure {
            entity_id,
            error: error.to_string(),
        });
    }
}

/// Reports of every job run by `run_daily_jobs`, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DailyRunReport {
    pub expired_trials: BatchReport,
    pub expired_subscriptions: BatchReport,
    pub generated_invoices: BatchReport,
    pub overdue_invoices: BatchReport,
    pub dunning: DunningRunReport,
}

impl DailyRunReport {
    pub fn failure_count(&self) -> usize {
        self.expired_trials.failures.len()
            + self.expired_subscriptions.failures.len()
            + self.generated_invoices.failures.len()
            + self.overdue_invoices.failures.len()
            + self.dunning.failures.len()
    }
}

/// Billing orchestrator.
#[derive(Clone)]
pub struct BillingOrchestrator {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn DunningNotifier>,
    sequence: SequenceGenerator,
    settings: BillingSettings,
}

impl BillingOrchestrator {
    pub fn new(
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn DunningNotifier>,
        settings: BillingSettings,
    ) -> Self {
        let sequence = SequenceGenerator::new(
            store.clone(),
            clock.clone(),
            settings.invoice_number_prefix.clone(),
        );
        Self {
            store,
            clock,
            gateway,
            notifier,
            sequence,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }

    pub fn settings(&self) -> &BillingSettings {
        &self.settings
    }

    pub fn sequence_generator(&self) -> &SequenceGenerator {
        &self.sequence
    }

    /// Allocate the next invoice number.
    pub async fn next_invoice_number(&self) -> BillingResult<String> {
        self.sequence.next_invoice_number().await
    }

    /// Run every periodic job once, in dependency order: lifecycle sweeps first so
    /// invoice generation sees current statuses, dunning last so it sees today's
    /// overdue invoices.
    #[instrument(skip(self))]
    pub async fn run_daily_jobs(&self) -> BillingResult<DailyRunReport> {
        let report = DailyRunReport {
            expired_trials: self.process_expired_trials().await?,
            expired_subscriptions: self.process_expired_subscriptions().await?,
            generated_invoices: self.generate_monthly_invoices().await?,
            overdue_invoices: self.mark_overdue_invoices().await?,
            dunning: self.process_scheduled_dunning_actions().await?,
        };
        info!(failures = report.failure_count(), "Daily billing jobs finished");
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Loading helpers
    // ------------------------------------------------------------------

    async fn load_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::not_found("plan", plan_id))
    }

    async fn load_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        self.store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::not_found("invoice", invoice_id))
    }

    async fn load_subscription(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::not_found("subscription", subscription_id))
    }

    async fn load_dunning(&self, dunning_id: Uuid) -> BillingResult<DunningSequence> {
        self.store
            .get_dunning(dunning_id)
            .await?
            .ok_or_else(|| BillingError::not_found("dunning sequence", dunning_id))
    }
}

/// Count a failed command in the error metrics.
fn track<T>(operation: &str, result: BillingResult<T>) -> BillingResult<T> {
    if let Err(ref e) = result {
        record_error(e.kind(), operation);
    }
    result
}

/// Timer for a batch job that records the outcome metrics when finished.
struct BatchTimer {
    job: &'static str,
    started: Instant,
}

impl BatchTimer {
    fn start(job: &'static str) -> Self {
        Self {
            job,
            started: Instant::now(),
        }
    }

    fn finish(self, failed_items: usize) {
        let status = if failed_items == 0 { "success" } else { "partial_failure" };
        record_batch_run(
            self.job,
            status,
            failed_items as u64,
            self.started.elapsed().as_secs_f64(),
        );
        info!(
            job = self.job,
            failed_items = failed_items,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Batch job finished"
        );
    }
}
