//! Invoice commands, queries and the invoice batch jobs.

use super::{track, BatchReport, BatchTimer, BillingOrchestrator};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    CreateInvoice, CreateLineItem, DunningStatus, Invoice, InvoiceStatus, ListInvoicesFilter,
    ListSubscriptionsFilter, RecordPayment, SubscriptionStatus,
};
use crate::services::metrics::{record_invoice_operation, record_payment_amount};
use crate::services::store::UnitOfWork;
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

impl BillingOrchestrator {
    /// Create a draft invoice with manual line items.
    #[instrument(skip(self, input), fields(organization_id = %input.organization_id))]
    pub async fn create_invoice(&self, input: CreateInvoice) -> BillingResult<Invoice> {
        track("create_invoice", self.create_invoice_inner(input).await)
    }

    async fn create_invoice_inner(&self, input: CreateInvoice) -> BillingResult<Invoice> {
        let invoice_number = self.sequence.next_invoice_number().await?;
        let mut invoice = Invoice::create(
            invoice_number,
            input,
            &self.settings.default_currency,
            self.settings.default_tax_rate,
            self.clock.now(),
        )?;
        self.store
            .commit(UnitOfWork::new().invoice(&mut invoice))
            .await?;

        record_invoice_operation("create");
        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            total = %invoice.total,
            "Invoice created"
        );
        Ok(invoice)
    }

    /// Create the draft invoice for one billing period of a subscription. A second
    /// call for the same subscription and period fails validation.
    #[instrument(skip(self))]
    pub async fn generate_invoice_from_subscription(
        &self,
        subscription_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> BillingResult<Invoice> {
        track(
            "generate_invoice",
            self.generate_invoice_inner(subscription_id, period_start, period_end)
                .await,
        )
    }

    async fn generate_invoice_inner(
        &self,
        subscription_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> BillingResult<Invoice> {
        let subscription = self.load_subscription(subscription_id).await?;
        let plan = self.load_plan(subscription.plan_id).await?;

        if let Some(existing) = self
            .store
            .find_invoice_for_period(subscription_id, period_start, period_end)
            .await?
        {
            return Err(BillingError::validation(format!(
                "Invoice {} already exists for subscription {} period {} to {}",
                existing.invoice_number, subscription_id, period_start, period_end
            )));
        }

        let invoice_number = self.sequence.next_invoice_number().await?;
        let mut invoice = Invoice::create_from_subscription(
            invoice_number,
            &subscription,
            &plan,
            period_start,
            period_end,
            self.settings.default_tax_rate,
            self.clock.now(),
        )?;
        self.store
            .commit(UnitOfWork::new().invoice(&mut invoice))
            .await?;

        record_invoice_operation("generate");
        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            %period_start,
            %period_end,
            "Invoice generated from subscription"
        );
        Ok(invoice)
    }

    #[instrument(skip(self))]
    pub async fn issue_invoice(
        &self,
        invoice_id: Uuid,
        issue_date: NaiveDate,
        payment_due_days: i64,
    ) -> BillingResult<Invoice> {
        track("issue_invoice", async {
            let mut invoice = self.load_invoice(invoice_id).await?;
            invoice.issue(issue_date, payment_due_days, self.clock.now())?;
            self.store
                .commit(UnitOfWork::new().invoice(&mut invoice))
                .await?;

            record_invoice_operation("issue");
            info!(
                invoice_number = %invoice.invoice_number,
                due_date = ?invoice.due_date,
                "Invoice issued"
            );
            Ok(invoice)
        }
        .await)
    }

    /// Apply a payment. Settling the invoice in full also closes its open dunning
    /// sequence in the same unit of work.
    #[instrument(skip(self, payment), fields(amount = %payment.amount))]
    pub async fn record_payment(
        &self,
        invoice_id: Uuid,
        payment: RecordPayment,
    ) -> BillingResult<Invoice> {
        track("record_payment", self.record_payment_inner(invoice_id, payment).await)
    }

    async fn record_payment_inner(
        &self,
        invoice_id: Uuid,
        payment: RecordPayment,
    ) -> BillingResult<Invoice> {
        let now = self.clock.now();
        let mut invoice = self.load_invoice(invoice_id).await?;
        let method = payment.method;
        let amount = payment.amount;
        invoice.record_payment(payment, now)?;

        let mut unit = UnitOfWork::new();
        if invoice.status == InvoiceStatus::Paid {
            if let Some(mut sequence) = self.store.find_open_dunning_for_invoice(invoice_id).await? {
                match sequence.status {
                    DunningStatus::Active => sequence.recover(method.as_str(), now)?,
                    _ => {
                        // Suspension is not lifted here; the subscription needs an
                        // explicit activation.
                        sequence.resolve_manually(
                            Some(format!(
                                "Invoice {} paid in full via {} after suspension",
                                invoice.invoice_number,
                                method.as_str()
                            )),
                            now,
                        )?;
                        warn!(
                            subscription_id = %sequence.subscription_id,
                            "Invoice settled while suspended, subscription stays suspended until activated"
                        );
                    }
                }
                info!(dunning_id = %sequence.dunning_id, status = %sequence.status, "Dunning sequence closed by payment");
                unit = unit.dunning(&mut sequence);
            }
        }
        self.store.commit(unit.invoice(&mut invoice)).await?;

        record_invoice_operation("record_payment");
        record_payment_amount(&invoice.currency, amount.to_f64().unwrap_or(0.0));
        info!(
            invoice_number = %invoice.invoice_number,
            status = %invoice.status,
            paid_amount = %invoice.paid_amount,
            "Payment recorded"
        );
        Ok(invoice)
    }

    /// Cancel an unpaid invoice. An open dunning sequence for it is resolved.
    #[instrument(skip(self))]
    pub async fn cancel_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        track("cancel_invoice", async {
            let now = self.clock.now();
            let mut invoice = self.load_invoice(invoice_id).await?;
            invoice.cancel(now)?;

            let mut unit = UnitOfWork::new();
            if let Some(mut sequence) = self.store.find_open_dunning_for_invoice(invoice_id).await? {
                sequence.resolve_manually(Some("Invoice cancelled".to_string()), now)?;
                unit = unit.dunning(&mut sequence);
            }
            self.store.commit(unit.invoice(&mut invoice)).await?;

            record_invoice_operation("cancel");
            info!(invoice_number = %invoice.invoice_number, "Invoice cancelled");
            Ok(invoice)
        }
        .await)
    }

    /// Hard-delete a draft invoice.
    #[instrument(skip(self))]
    pub async fn delete_invoice(&self, invoice_id: Uuid) -> BillingResult<()> {
        track("delete_invoice", async {
            let invoice = self.load_invoice(invoice_id).await?;
            invoice.ensure_deletable()?;
            self.store
                .commit(UnitOfWork::new().delete_invoice(invoice_id))
                .await?;

            record_invoice_operation("delete");
            info!(invoice_number = %invoice.invoice_number, "Draft invoice deleted");
            Ok(())
        }
        .await)
    }

    #[instrument(skip(self, item))]
    pub async fn add_invoice_line_item(
        &self,
        invoice_id: Uuid,
        item: CreateLineItem,
    ) -> BillingResult<Invoice> {
        track("add_line_item", async {
            let mut invoice = self.load_invoice(invoice_id).await?;
            invoice.add_line_item(item, self.clock.now())?;
            self.store
                .commit(UnitOfWork::new().invoice(&mut invoice))
                .await?;
            record_invoice_operation("add_line_item");
            Ok(invoice)
        }
        .await)
    }

    #[instrument(skip(self))]
    pub async fn remove_invoice_line_item(
        &self,
        invoice_id: Uuid,
        line_item_id: Uuid,
    ) -> BillingResult<Invoice> {
        track("remove_line_item", async {
            let mut invoice = self.load_invoice(invoice_id).await?;
            invoice.remove_line_item(line_item_id, self.clock.now())?;
            self.store
                .commit(UnitOfWork::new().invoice(&mut invoice))
                .await?;
            record_invoice_operation("remove_line_item");
            Ok(invoice)
        }
        .await)
    }

    #[instrument(skip(self, notes))]
    pub async fn update_invoice_notes(
        &self,
        invoice_id: Uuid,
        notes: Option<String>,
    ) -> BillingResult<Invoice> {
        let mut invoice = self.load_invoice(invoice_id).await?;
        invoice.update_notes(notes, self.clock.now());
        self.store
            .commit(UnitOfWork::new().invoice(&mut invoice))
            .await?;
        Ok(invoice)
    }

    pub async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        self.load_invoice(invoice_id).await
    }

    pub async fn get_invoice_by_number(&self, invoice_number: &str) -> BillingResult<Invoice> {
        self.store
            .get_invoice_by_number(invoice_number)
            .await?
            .ok_or_else(|| BillingError::not_found("invoice", invoice_number))
    }

    pub async fn list_invoices(&self, filter: &ListInvoicesFilter) -> BillingResult<Vec<Invoice>> {
        self.store.list_invoices(filter).await
    }

    // ------------------------------------------------------------------
    // Batch jobs
    // ------------------------------------------------------------------

    /// Flag every issued invoice whose due date has passed.
    #[instrument(skip(self))]
    pub async fn mark_overdue_invoices(&self) -> BillingResult<BatchReport> {
        let timer = BatchTimer::start("mark_overdue_invoices");
        let now = self.clock.now();
        let today = now.date_naive();

        let candidates = self
            .store
            .list_invoices(&ListInvoicesFilter {
                statuses: vec![InvoiceStatus::Issued],
                due_before: Some(today),
                ..Default::default()
            })
            .await?;

        let mut report = BatchReport::default();
        for mut invoice in candidates {
            let result = async {
                if !invoice.mark_overdue(today, now)? {
                    return Ok(false);
                }
                self.store
                    .commit(UnitOfWork::new().invoice(&mut invoice))
                    .await?;
                Ok::<_, BillingError>(true)
            }
            .await;

            match result {
                Ok(true) => {
                    record_invoice_operation("mark_overdue");
                    info!(invoice_number = %invoice.invoice_number, "Invoice marked overdue");
                    report.succeed();
                }
                Ok(false) => report.skip(),
                Err(e) => {
                    error!(invoice_id = %invoice.invoice_id, error = %e, "Failed to mark invoice overdue");
                    report.fail(invoice.invoice_id, e);
                }
            }
        }

        timer.finish(report.failures.len());
        Ok(report)
    }

    /// Create and issue this period's invoice for every active subscription. Periods
    /// that already have an invoice are skipped.
    #[instrument(skip(self))]
    pub async fn generate_monthly_invoices(&self) -> BillingResult<BatchReport> {
        let timer = BatchTimer::start("generate_monthly_invoices");
        let today = self.clock.today();

        let candidates = self
            .store
            .list_subscriptions(&ListSubscriptionsFilter::with_status(
                SubscriptionStatus::Active,
            ))
            .await?;

        let mut report = BatchReport::default();
        for subscription in candidates {
            let subscription_id = subscription.subscription_id;
            let result = async {
                let Some((start, end)) = subscription.billing_period_containing(today)? else {
                    return Ok(None);
                };
                if self
                    .store
                    .find_invoice_for_period(subscription_id, start, end)
                    .await?
                    .is_some()
                {
                    return Ok(None);
                }

                let plan = self.load_plan(subscription.plan_id).await?;
                let now = self.clock.now();
                let mut invoice = Invoice::create_from_subscription(
                    self.sequence.next_invoice_number().await?,
                    &subscription,
                    &plan,
                    start,
                    end,
                    self.settings.default_tax_rate,
                    now,
                )?;
                invoice.issue(today, self.settings.payment_due_days, now)?;
                self.store
                    .commit(UnitOfWork::new().invoice(&mut invoice))
                    .await?;
                Ok::<_, BillingError>(Some(invoice))
            }
            .await;

            match result {
                Ok(Some(invoice)) => {
                    record_invoice_operation("generate");
                    info!(
                        subscription_id = %subscription_id,
                        invoice_number = %invoice.invoice_number,
                        total = %invoice.total,
                        "Periodic invoice generated"
                    );
                    report.succeed();
                }
                Ok(None) => {
                    debug!(subscription_id = %subscription_id, "Invoice already exists for current period");
                    report.skip();
                }
                Err(BillingError::Conflict(msg)) => {
                    debug!(subscription_id = %subscription_id, reason = %msg, "Period invoiced concurrently");
                    report.skip();
                }
                Err(e) => {
                    error!(subscription_id = %subscription_id, error = %e, "Failed to generate invoice");
                    report.fail(subscription_id, e);
                }
            }
        }

        timer.finish(report.failures.len());
        Ok(report)
    }
}
