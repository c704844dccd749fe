//! In-process store used when no database is configured, and by the test harness.

use crate::error::{BillingError, BillingResult};
use crate::models::{
    DunningSequence, Invoice, InvoiceStatus, ListDunningFilter, ListInvoicesFilter,
    ListSubscriptionsFilter, Plan, SequenceRow, Subscription,
};
use crate::services::metrics::STORE_QUERY_DURATION;
use crate::services::store::{BillingStore, UnitOfWork};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct State {
    plans: HashMap<Uuid, Plan>,
    invoices: HashMap<Uuid, Invoice>,
    subscriptions: HashMap<Uuid, Subscription>,
    dunning: HashMap<Uuid, DunningSequence>,
}

/// Mutex-guarded maps. Commits are applied to a staged copy and swapped in only when
/// every version check and uniqueness rule holds.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    sequence: Mutex<Option<SequenceRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn blocks_period(invoice: &Invoice) -> bool {
    invoice.status != InvoiceStatus::Cancelled
        && invoice.subscription_id.is_some()
        && invoice.billing_period_start.is_some()
}

fn expect_next_version(entity: &str, id: Uuid, stored: Option<i64>, staged: i64) -> BillingResult<()> {
    let current = stored.unwrap_or(0);
    if staged != current + 1 {
        return Err(BillingError::conflict(format!(
            "{} {} changed since it was read (stored version {}, staged {})",
            entity, id, current, staged
        )));
    }
    Ok(())
}

fn check_versions(state: &State, unit: &UnitOfWork) -> BillingResult<()> {
    for plan in &unit.plans {
        let stored = state.plans.get(&plan.plan_id).map(|p| p.version);
        expect_next_version("Plan", plan.plan_id, stored, plan.version)?;
    }
    for invoice in &unit.invoices {
        let stored = state.invoices.get(&invoice.invoice_id).map(|i| i.version);
        expect_next_version("Invoice", invoice.invoice_id, stored, invoice.version)?;
    }
    for subscription in &unit.subscriptions {
        let stored = state
            .subscriptions
            .get(&subscription.subscription_id)
            .map(|s| s.version);
        expect_next_version(
            "Subscription",
            subscription.subscription_id,
            stored,
            subscription.version,
        )?;
    }
    for sequence in &unit.dunning {
        let stored = state.dunning.get(&sequence.dunning_id).map(|d| d.version);
        expect_next_version("Dunning sequence", sequence.dunning_id, stored, sequence.version)?;
    }
    Ok(())
}

fn check_uniqueness(state: &State, unit: &UnitOfWork) -> BillingResult<()> {
    for invoice in &unit.invoices {
        let clash = state.invoices.values().find(|other| {
            other.invoice_id != invoice.invoice_id
                && (other.invoice_number == invoice.invoice_number
                    || (blocks_period(invoice)
                        && blocks_period(other)
                        && other.subscription_id == invoice.subscription_id
                        && other.billing_period_start == invoice.billing_period_start
                        && other.billing_period_end == invoice.billing_period_end))
        });
        if let Some(other) = clash {
            return Err(BillingError::conflict(format!(
                "Invoice {} clashes with existing invoice {}",
                invoice.invoice_number, other.invoice_number
            )));
        }
    }

    for subscription in unit.subscriptions.iter().filter(|s| s.is_open()) {
        let clash = state.subscriptions.values().any(|other| {
            other.subscription_id != subscription.subscription_id
                && other.organization_id == subscription.organization_id
                && other.is_open()
        });
        if clash {
            return Err(BillingError::conflict(format!(
                "Organization {} already has an open subscription",
                subscription.organization_id
            )));
        }
    }

    for sequence in unit.dunning.iter().filter(|d| d.is_open()) {
        let clash = state.dunning.values().find(|other| {
            other.dunning_id != sequence.dunning_id
                && other.is_open()
                && (other.invoice_id == sequence.invoice_id
                    || other.subscription_id == sequence.subscription_id)
        });
        if let Some(other) = clash {
            return Err(BillingError::conflict(format!(
                "Dunning sequence {} is already open for invoice {} / subscription {}",
                other.dunning_id, other.invoice_id, other.subscription_id
            )));
        }
    }

    Ok(())
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn health_check(&self) -> BillingResult<()> {
        Ok(())
    }

    #[instrument(skip(self))]
    async fn allocate_invoice_sequence(&self, year: i32) -> BillingResult<SequenceRow> {
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["allocate_invoice_sequence"])
            .start_timer();

        let mut guard = self.sequence.lock().await;
        let mut row = (*guard).unwrap_or_else(|| SequenceRow::empty(year));
        row.advance(year)?;
        *guard = Some(row);

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self, unit))]
    async fn commit(&self, unit: UnitOfWork) -> BillingResult<()> {
        if unit.is_empty() {
            return Ok(());
        }
        let timer = STORE_QUERY_DURATION
            .with_label_values(&["commit"])
            .start_timer();

        let mut state = self.state.lock().await;
        check_versions(&state, &unit)?;
        let mut staged = state.clone();
        for invoice_id in &unit.deleted_invoices {
            staged.invoices.remove(invoice_id);
        }
        for plan in &unit.plans {
            staged.plans.insert(plan.plan_id, plan.clone());
        }
        for invoice in &unit.invoices {
            staged.invoices.insert(invoice.invoice_id, invoice.clone());
        }
        for subscription in &unit.subscriptions {
            staged
                .subscriptions
                .insert(subscription.subscription_id, subscription.clone());
        }
        for sequence in &unit.dunning {
            staged.dunning.insert(sequence.dunning_id, sequence.clone());
        }
        check_uniqueness(&staged, &unit)?;
        *state = staged;

        timer.observe_duration();
        Ok(())
    }

    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self.state.lock().await.plans.get(&plan_id).cloned())
    }

    async fn list_plans(&self, include_inactive: bool) -> BillingResult<Vec<Plan>> {
        let state = self.state.lock().await;
        let mut plans: Vec<Plan> = state
            .plans
            .values()
            .filter(|plan| include_inactive || plan.is_active)
            .cloned()
            .collect();
        plans.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(plans)
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self.state.lock().await.invoices.get(&invoice_id).cloned())
    }

    async fn get_invoice_by_number(&self, invoice_number: &str) -> BillingResult<Option<Invoice>> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .values()
            .find(|invoice| invoice.invoice_number == invoice_number)
            .cloned())
    }

    async fn find_invoice_for_period(
        &self,
        subscription_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> BillingResult<Option<Invoice>> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .values()
            .find(|invoice| {
                blocks_period(invoice)
                    && invoice.subscription_id == Some(subscription_id)
                    && invoice.billing_period_start == Some(period_start)
                    && invoice.billing_period_end == Some(period_end)
            })
            .cloned())
    }

    async fn list_invoices(&self, filter: &ListInvoicesFilter) -> BillingResult<Vec<Invoice>> {
        let state = self.state.lock().await;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|invoice| filter.matches(invoice))
            .cloned()
            .collect();
        invoices.sort_by(|a, b| {
            a.created_utc
                .cmp(&b.created_utc)
                .then_with(|| a.invoice_number.cmp(&b.invoice_number))
        });
        Ok(invoices)
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .get(&subscription_id)
            .cloned())
    }

    async fn find_open_subscription(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|sub| sub.organization_id == organization_id && sub.is_open())
            .cloned())
    }

    async fn list_subscriptions(
        &self,
        filter: &ListSubscriptionsFilter,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut subscriptions: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|sub| filter.matches(sub))
            .cloned()
            .collect();
        subscriptions.sort_by(|a, b| {
            a.created_utc
                .cmp(&b.created_utc)
                .then_with(|| a.subscription_id.cmp(&b.subscription_id))
        });
        Ok(subscriptions)
    }

    async fn get_dunning(&self, dunning_id: Uuid) -> BillingResult<Option<DunningSequence>> {
        Ok(self.state.lock().await.dunning.get(&dunning_id).cloned())
    }

    async fn find_open_dunning_for_invoice(
        &self,
        invoice_id: Uuid,
    ) -> BillingResult<Option<DunningSequence>> {
        let state = self.state.lock().await;
        Ok(state
            .dunning
            .values()
            .find(|seq| seq.invoice_id == invoice_id && seq.is_open())
            .cloned())
    }

    async fn find_open_dunning_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<DunningSequence>> {
        let state = self.state.lock().await;
        Ok(state
            .dunning
            .values()
            .find(|seq| seq.subscription_id == subscription_id && seq.is_open())
            .cloned())
    }

    async fn list_dunning(&self, filter: &ListDunningFilter) -> BillingResult<Vec<DunningSequence>> {
        let state = self.state.lock().await;
        let mut sequences: Vec<DunningSequence> = state
            .dunning
            .values()
            .filter(|seq| filter.matches(seq))
            .cloned()
            .collect();
        sequences.sort_by(|a, b| {
            a.failed_at
                .cmp(&b.failed_at)
                .then_with(|| a.dunning_id.cmp(&b.dunning_id))
        });
        Ok(sequences)
    }
}
