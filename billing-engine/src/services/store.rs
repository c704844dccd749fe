//! Persistence boundary for the billing engine.

use crate::error::BillingResult;
use crate::models::{
    DunningSequence, Invoice, ListDunningFilter, ListInvoicesFilter, ListSubscriptionsFilter,
    Plan, SequenceRow, Subscription,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

/// Set of aggregate changes that must land together or not at all.
///
/// Cross-aggregate effects (a dunning suspension suspending its subscription, a payment
/// recovering its dunning sequence) are committed as one unit.
///
/// Every aggregate is staged at its next `version`. Staging bumps the caller's copy as
/// well, so the copy stays current after the commit. The store accepts the unit only
/// if each stored version is exactly one behind the staged one (0 for new aggregates).
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    pub plans: Vec<Plan>,
    pub invoices: Vec<Invoice>,
    pub subscriptions: Vec<Subscription>,
    pub dunning: Vec<DunningSequence>,
    pub deleted_invoices: Vec<Uuid>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(mut self, plan: &mut Plan) -> Self {
        plan.version += 1;
        self.plans.push(plan.clone());
        self
    }

    pub fn invoice(mut self, invoice: &mut Invoice) -> Self {
        invoice.version += 1;
        self.invoices.push(invoice.clone());
        self
    }

    pub fn subscription(mut self, subscription: &mut Subscription) -> Self {
        subscription.version += 1;
        self.subscriptions.push(subscription.clone());
        self
    }

    pub fn dunning(mut self, sequence: &mut DunningSequence) -> Self {
        sequence.version += 1;
        self.dunning.push(sequence.clone());
        self
    }

    pub fn delete_invoice(mut self, invoice_id: Uuid) -> Self {
        self.deleted_invoices.push(invoice_id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
            && self.invoices.is_empty()
            && self.subscriptions.is_empty()
            && self.dunning.is_empty()
            && self.deleted_invoices.is_empty()
    }
}

/// Backing store for plans, invoices, subscriptions, dunning sequences and the
/// invoice counter.
///
/// `commit` writes every aggregate in the unit atomically and rejects it with
/// `BillingError::Conflict` when an aggregate changed since it was read, or when it
/// would break a uniqueness rule: invoice numbers, one invoice per subscription and
/// billing period, one open subscription per organization, one open dunning sequence
/// per invoice and per subscription.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn health_check(&self) -> BillingResult<()>;

    /// Lock the counter row, advance it for `year` and return the new row. Concurrent
    /// callers are serialized and never observe the same value.
    async fn allocate_invoice_sequence(&self, year: i32) -> BillingResult<SequenceRow>;

    async fn commit(&self, unit: UnitOfWork) -> BillingResult<()>;

    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>>;

    async fn list_plans(&self, include_inactive: bool) -> BillingResult<Vec<Plan>>;

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>>;

    async fn get_invoice_by_number(&self, invoice_number: &str) -> BillingResult<Option<Invoice>>;

    async fn find_invoice_for_period(
        &self,
        subscription_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> BillingResult<Option<Invoice>>;

    async fn list_invoices(&self, filter: &ListInvoicesFilter) -> BillingResult<Vec<Invoice>>;

    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn find_open_subscription(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Option<Subscription>>;

    async fn list_subscriptions(
        &self,
        filter: &ListSubscriptionsFilter,
    ) -> BillingResult<Vec<Subscription>>;

    async fn get_dunning(&self, dunning_id: Uuid) -> BillingResult<Option<DunningSequence>>;

    async fn find_open_dunning_for_invoice(
        &self,
        invoice_id: Uuid,
    ) -> BillingResult<Option<DunningSequence>>;

    async fn find_open_dunning_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<DunningSequence>>;

    async fn list_dunning(&self, filter: &ListDunningFilter) -> BillingResult<Vec<DunningSequence>>;
}
