//! Dunning commands, queries and the scheduled dunning driver.

use super::{track, BatchTimer, BillingOrchestrator, DunningRunReport};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    CreateDunningSequence, DunningEvent, DunningSequence, DunningStatus, InvoiceStatus,
    ListDunningFilter, PaymentMethod, RecordPayment, Subscription, SubscriptionStatus,
};
use crate::services::collaborators::{ChargeRequest, DunningNotice};
use crate::services::metrics::{record_dunning_action, record_payment_amount};
use crate::services::store::UnitOfWork;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// What a payment retry ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryOutcome {
    Declined,
    Collected,
    /// The invoice was settled or withdrawn outside the sequence.
    Closed,
}

impl BillingOrchestrator {
    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Open a dunning sequence for a failed payment. At most one open sequence may
    /// exist per invoice and per subscription.
    #[instrument(skip(self, input), fields(invoice_id = %input.invoice_id))]
    pub async fn create_dunning_sequence(
        &self,
        input: CreateDunningSequence,
    ) -> BillingResult<DunningSequence> {
        track("create_dunning", self.create_dunning_inner(input).await)
    }

    async fn create_dunning_inner(
        &self,
        input: CreateDunningSequence,
    ) -> BillingResult<DunningSequence> {
        let invoice = self.load_invoice(input.invoice_id).await?;
        let subscription = self.load_subscription(input.subscription_id).await?;
        if invoice.organization_id != input.organization_id
            || subscription.organization_id != input.organization_id
        {
            return Err(BillingError::validation(format!(
                "Invoice {} and subscription {} must belong to organization {}",
                invoice.invoice_number, subscription.subscription_id, input.organization_id
            )));
        }
        if !invoice.status.is_collectable() {
            return Err(BillingError::invalid_transition(
                "invoice",
                invoice.status,
                "payment_failure",
            ));
        }
        if let Some(existing) = self
            .store
            .find_open_dunning_for_invoice(input.invoice_id)
            .await?
        {
            return Err(BillingError::conflict(format!(
                "Invoice {} already has open dunning sequence {}",
                invoice.invoice_number, existing.dunning_id
            )));
        }
        if let Some(existing) = self
            .store
            .find_open_dunning_for_subscription(input.subscription_id)
            .await?
        {
            return Err(BillingError::conflict(format!(
                "Subscription {} already has open dunning sequence {}",
                input.subscription_id, existing.dunning_id
            )));
        }

        let mut sequence = DunningSequence::create(input, &self.settings.dunning, self.clock.now())?;
        self.store
            .commit(UnitOfWork::new().dunning(&mut sequence))
            .await?;

        record_dunning_action("created");
        info!(
            dunning_id = %sequence.dunning_id,
            subscription_id = %sequence.subscription_id,
            amount = %sequence.amount,
            currency = %sequence.currency,
            steps = sequence.steps.len(),
            "Dunning sequence started"
        );
        Ok(sequence)
    }

    /// Turn a failed collection attempt on an issued invoice into a dunning sequence
    /// for its remaining balance.
    #[instrument(skip(self, reason))]
    pub async fn report_payment_failure(
        &self,
        invoice_id: Uuid,
        reason: Option<String>,
    ) -> BillingResult<DunningSequence> {
        let invoice = track("report_payment_failure", self.load_invoice(invoice_id).await)?;
        let subscription_id = invoice.subscription_id.ok_or_else(|| {
            BillingError::validation(format!(
                "Invoice {} is not linked to a subscription",
                invoice.invoice_number
            ))
        });
        let subscription_id = track("report_payment_failure", subscription_id)?;

        warn!(
            invoice_number = %invoice.invoice_number,
            reason = reason.as_deref().unwrap_or("unknown"),
            "Payment failed"
        );
        self.create_dunning_sequence(CreateDunningSequence {
            organization_id: invoice.organization_id,
            subscription_id,
            invoice_id,
            amount: invoice.remaining_balance(),
            currency: invoice.currency.clone(),
            failure_reason: reason,
        })
        .await
    }

    /// Retry the payment now, outside the schedule. Subject to the same retry budget
    /// and the same one-retry-per-day rule as the scheduled pass.
    #[instrument(skip(self))]
    pub async fn retry_payment(&self, dunning_id: Uuid) -> BillingResult<DunningSequence> {
        track("retry_payment", async {
            let sequence = self.load_dunning(dunning_id).await?;
            let (sequence, outcome) = self.attempt_retry(sequence, self.clock.now()).await?;
            debug!(dunning_id = %dunning_id, ?outcome, "Manual retry finished");
            Ok(sequence)
        }
        .await)
    }

    #[instrument(skip(self))]
    pub async fn recover_dunning(
        &self,
        dunning_id: Uuid,
        method: &str,
    ) -> BillingResult<DunningSequence> {
        let method = method.to_string();
        self.transition_dunning(dunning_id, "recovered", move |sequence, now| {
            sequence.recover(method, now)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn escalate_dunning(
        &self,
        dunning_id: Uuid,
        csm_id: Option<Uuid>,
    ) -> BillingResult<DunningSequence> {
        self.transition_dunning(dunning_id, "csm_escalated", move |sequence, now| {
            if !sequence.escalate_to_csm(csm_id, now)? {
                debug!(dunning_id = %sequence.dunning_id, "Sequence already escalated");
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn assign_dunning_csm(
        &self,
        dunning_id: Uuid,
        csm_id: Uuid,
    ) -> BillingResult<DunningSequence> {
        self.transition_dunning(dunning_id, "csm_assigned", move |sequence, now| {
            sequence.assign_csm(csm_id, now)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn record_step_click(
        &self,
        dunning_id: Uuid,
        step_id: Uuid,
    ) -> BillingResult<DunningSequence> {
        self.transition_dunning(dunning_id, "step_clicked", move |sequence, now| {
            sequence.record_click(step_id, now)
        })
        .await
    }

    #[instrument(skip(self, notes))]
    pub async fn resolve_dunning_manually(
        &self,
        dunning_id: Uuid,
        notes: Option<String>,
    ) -> BillingResult<DunningSequence> {
        self.transition_dunning(dunning_id, "manually_resolved", move |sequence, now| {
            sequence.resolve_manually(notes, now)
        })
        .await
    }

    /// Suspend the sequence and its subscription once the suspension day is reached.
    #[instrument(skip(self))]
    pub async fn suspend_dunning(&self, dunning_id: Uuid) -> BillingResult<DunningSequence> {
        track("suspend_dunning", async {
            let mut sequence = self.load_dunning(dunning_id).await?;
            self.suspend_with_subscription(&mut sequence, self.clock.now())
                .await?;
            Ok(sequence)
        }
        .await)
    }

    /// Deactivate the suspended sequence, cancel its subscription and send the
    /// deactivation notice. A failed notice is logged; the deactivation stands.
    #[instrument(skip(self))]
    pub async fn deactivate_dunning(&self, dunning_id: Uuid) -> BillingResult<DunningSequence> {
        track("deactivate_dunning", async {
            let now = self.clock.now();
            let mut sequence = self.load_dunning(dunning_id).await?;
            self.deactivate_with_subscription(&mut sequence, now).await?;
            if let Err(e) = self.send_due_step(&mut sequence, now.date_naive(), now).await {
                error!(dunning_id = %dunning_id, error = %e, "Deactivation notice failed");
                sequence = self.load_dunning(dunning_id).await?;
            }
            Ok(sequence)
        }
        .await)
    }

    async fn transition_dunning<F>(
        &self,
        dunning_id: Uuid,
        action: &'static str,
        apply: F,
    ) -> BillingResult<DunningSequence>
    where
        F: FnOnce(&mut DunningSequence, DateTime<Utc>) -> BillingResult<()>,
    {
        track(action, async {
            let mut sequence = self.load_dunning(dunning_id).await?;
            apply(&mut sequence, self.clock.now())?;
            self.store
                .commit(UnitOfWork::new().dunning(&mut sequence))
                .await?;

            record_dunning_action(action);
            info!(
                dunning_id = %dunning_id,
                action,
                status = %sequence.status,
                "Dunning sequence updated"
            );
            Ok(sequence)
        }
        .await)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_dunning(&self, dunning_id: Uuid) -> BillingResult<DunningSequence> {
        self.load_dunning(dunning_id).await
    }

    pub async fn list_dunning(&self, filter: &ListDunningFilter) -> BillingResult<Vec<DunningSequence>> {
        self.store.list_dunning(filter).await
    }

    /// Open sequences that have been handed to a CSM.
    pub async fn escalated_dunning(&self) -> BillingResult<Vec<DunningSequence>> {
        self.store
            .list_dunning(&ListDunningFilter {
                csm_escalated: Some(true),
                ..ListDunningFilter::open()
            })
            .await
    }

    pub async fn dunning_timeline(&self, dunning_id: Uuid) -> BillingResult<Vec<DunningEvent>> {
        Ok(self.load_dunning(dunning_id).await?.timeline())
    }

    // ------------------------------------------------------------------
    // Scheduled driver
    // ------------------------------------------------------------------

    /// Walk every open sequence forward to today. Passes run in order: payment
    /// retries, suspensions, deactivations, notifications. Every action is gated on
    /// sequence state, so a second run on the same day changes nothing.
    #[instrument(skip(self))]
    pub async fn process_scheduled_dunning_actions(&self) -> BillingResult<DunningRunReport> {
        let timer = BatchTimer::start("process_scheduled_dunning_actions");
        let now = self.clock.now();
        let today = now.date_naive();
        let mut report = DunningRunReport::default();

        // Pass 1: payment retries.
        let active = self
            .store
            .list_dunning(&ListDunningFilter::with_status(DunningStatus::Active))
            .await?;
        for sequence in active {
            if !sequence.is_retry_due(today) {
                continue;
            }
            let dunning_id = sequence.dunning_id;
            match self.attempt_retry(sequence, now).await {
                Ok((_, outcome)) => {
                    if outcome != RetryOutcome::Closed {
                        report.retries_attempted += 1;
                    }
                    if outcome == RetryOutcome::Collected {
                        report.retries_succeeded += 1;
                    }
                }
                Err(e) => {
                    error!(dunning_id = %dunning_id, error = %e, "Payment retry failed");
                    report.fail(dunning_id, e);
                }
            }
        }

        // Pass 2: suspensions.
        let active = self
            .store
            .list_dunning(&ListDunningFilter::with_status(DunningStatus::Active))
            .await?;
        for mut sequence in active {
            if !sequence.is_suspension_due(today) {
                continue;
            }
            match self.suspend_with_subscription(&mut sequence, now).await {
                Ok(()) => report.suspended += 1,
                Err(e) => {
                    error!(dunning_id = %sequence.dunning_id, error = %e, "Dunning suspension failed");
                    report.fail(sequence.dunning_id, e);
                }
            }
        }

        // Pass 3: deactivations, each followed by the deactivation notice. Warnings
        // still in the backlog are skipped rather than sent after the fact.
        let suspended = self
            .store
            .list_dunning(&ListDunningFilter::with_status(DunningStatus::Suspended))
            .await?;
        for mut sequence in suspended {
            if !sequence.is_deactivation_due(today) {
                continue;
            }
            if let Err(e) = self.deactivate_with_subscription(&mut sequence, now).await {
                error!(dunning_id = %sequence.dunning_id, error = %e, "Dunning deactivation failed");
                report.fail(sequence.dunning_id, e);
                continue;
            }
            report.deactivated += 1;
            self.send_due_step_into(&mut sequence, today, now, &mut report)
                .await;
        }

        // Pass 4: notifications for every open sequence.
        let open = self.store.list_dunning(&ListDunningFilter::open()).await?;
        for mut sequence in open {
            self.send_due_step_into(&mut sequence, today, now, &mut report)
                .await;
        }

        info!(
            retries_attempted = report.retries_attempted,
            retries_succeeded = report.retries_succeeded,
            suspended = report.suspended,
            deactivated = report.deactivated,
            steps_sent = report.steps_sent,
            escalated = report.escalated,
            failures = report.failures.len(),
            "Scheduled dunning actions processed"
        );
        timer.finish(report.failures.len());
        Ok(report)
    }

    async fn send_due_step_into(
        &self,
        sequence: &mut DunningSequence,
        today: NaiveDate,
        now: DateTime<Utc>,
        report: &mut DunningRunReport,
    ) {
        match self.send_due_step(sequence, today, now).await {
            Ok(Some(escalated)) => {
                report.steps_sent += 1;
                if escalated {
                    report.escalated += 1;
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(dunning_id = %sequence.dunning_id, error = %e, "Dunning notification failed");
                report.fail(sequence.dunning_id, e);
            }
        }
    }

    /// Send today's step, if any, and persist it. Returns whether the step escalated
    /// the sequence. A failed send leaves the step pending for the next run.
    async fn send_due_step(
        &self,
        sequence: &mut DunningSequence,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<bool>> {
        let Some(step) = sequence.notification_due(today).cloned() else {
            return Ok(None);
        };

        let notice = DunningNotice::for_step(
            sequence.dunning_id,
            sequence.organization_id,
            sequence.invoice_id,
            sequence.amount,
            &sequence.currency,
            &step,
        );
        self.notifier.send(notice).await?;

        sequence.mark_step_sent(step.step_id, now)?;
        let escalated = step.escalate_to_csm
            && sequence.is_open()
            && sequence.escalate_to_csm(None, now)?;
        self.store
            .commit(UnitOfWork::new().dunning(sequence))
            .await?;

        record_dunning_action("notification_sent");
        if escalated {
            record_dunning_action("csm_escalated");
        }
        info!(
            dunning_id = %sequence.dunning_id,
            day_offset = step.day_offset,
            template = %step.template,
            channels = %step.channel_list(),
            escalated,
            "Dunning step sent"
        );
        Ok(Some(escalated))
    }

    /// Charge the invoice's remaining balance once. A collected payment settles the
    /// invoice and recovers the sequence in one unit of work; a gateway error counts
    /// as a declined attempt.
    async fn attempt_retry(
        &self,
        mut sequence: DunningSequence,
        now: DateTime<Utc>,
    ) -> BillingResult<(DunningSequence, RetryOutcome)> {
        let mut invoice = self.load_invoice(sequence.invoice_id).await?;

        if !invoice.status.is_collectable() {
            let closed_by = invoice.status;
            if closed_by == InvoiceStatus::Paid {
                sequence.recover("invoice_settled", now)?;
            } else {
                sequence.resolve_manually(
                    Some(format!("Invoice {} is {}", invoice.invoice_number, closed_by)),
                    now,
                )?;
            }
            self.store
                .commit(UnitOfWork::new().dunning(&mut sequence))
                .await?;
            info!(
                dunning_id = %sequence.dunning_id,
                invoice_status = %closed_by,
                status = %sequence.status,
                "Dunning sequence closed by invoice state"
            );
            return Ok((sequence, RetryOutcome::Closed));
        }
        if !sequence.is_retry_due(now.date_naive()) {
            return Err(BillingError::validation(format!(
                "No payment retry is due for dunning sequence {}",
                sequence.dunning_id
            )));
        }

        let amount = invoice.remaining_balance();
        let request = ChargeRequest {
            organization_id: sequence.organization_id,
            invoice_id: invoice.invoice_id,
            invoice_number: invoice.invoice_number.clone(),
            amount,
            currency: invoice.currency.clone(),
            idempotency_key: format!("{}-retry-{}", sequence.dunning_id, sequence.retry_count + 1),
        };
        let (success, reference, message) = match self.gateway.charge(request).await {
            Ok(outcome) => (outcome.success, outcome.reference, outcome.message),
            Err(e) => {
                warn!(dunning_id = %sequence.dunning_id, error = %e, "Payment gateway error during retry");
                (false, None, e.to_string())
            }
        };

        sequence.record_retry_attempt(success, message.clone(), now)?;
        let mut unit = UnitOfWork::new();
        let outcome = if success {
            invoice.record_payment(
                RecordPayment {
                    amount,
                    method: PaymentMethod::AutomaticRetry,
                    reference,
                },
                now,
            )?;
            sequence.recover(PaymentMethod::AutomaticRetry.as_str(), now)?;
            unit = unit.invoice(&mut invoice);
            RetryOutcome::Collected
        } else {
            RetryOutcome::Declined
        };
        if let Err(e) = self.store.commit(unit.dunning(&mut sequence)).await {
            if success {
                error!(
                    dunning_id = %sequence.dunning_id,
                    invoice_number = %invoice.invoice_number,
                    amount = %amount,
                    error = %e,
                    "Collected retry payment could not be recorded, invoice needs reconciliation"
                );
            }
            return Err(e);
        }

        record_dunning_action(if success { "retry_succeeded" } else { "retry_failed" });
        if success {
            record_payment_amount(&invoice.currency, amount.to_f64().unwrap_or(0.0));
            info!(
                dunning_id = %sequence.dunning_id,
                invoice_number = %invoice.invoice_number,
                amount = %amount,
                "Payment retry collected, sequence recovered"
            );
        } else {
            info!(
                dunning_id = %sequence.dunning_id,
                attempt = sequence.retry_count,
                max_retries = sequence.max_retries(),
                result = %message,
                "Payment retry declined"
            );
        }
        Ok((sequence, outcome))
    }

    /// Suspend the sequence and, in the same unit of work, its subscription.
    async fn suspend_with_subscription(
        &self,
        sequence: &mut DunningSequence,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        sequence.suspend(now)?;
        let mut subscription = self.load_subscription(sequence.subscription_id).await?;
        let suspended = match subscription.status {
            SubscriptionStatus::Active | SubscriptionStatus::Trial => {
                subscription.suspend(now)?;
                true
            }
            other => {
                warn!(
                    subscription_id = %subscription.subscription_id,
                    status = %other,
                    "Subscription not suspendable, suspending dunning sequence only"
                );
                false
            }
        };
        self.commit_with_subscription(sequence, subscription, suspended)
            .await?;

        record_dunning_action("suspended");
        info!(
            dunning_id = %sequence.dunning_id,
            subscription_id = %sequence.subscription_id,
            subscription_suspended = suspended,
            "Dunning sequence suspended"
        );
        Ok(())
    }

    /// Deactivate the sequence and cancel its subscription in the same unit of work.
    async fn deactivate_with_subscription(
        &self,
        sequence: &mut DunningSequence,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        sequence.deactivate(now)?;
        let mut subscription = self.load_subscription(sequence.subscription_id).await?;
        let cancelled = subscription.is_open();
        if cancelled {
            subscription.cancel(
                Some(format!(
                    "Deactivated after {} days of non-payment",
                    sequence.days_since_failure(now.date_naive())
                )),
                now,
            )?;
        }
        self.commit_with_subscription(sequence, subscription, cancelled)
            .await?;

        record_dunning_action("deactivated");
        warn!(
            dunning_id = %sequence.dunning_id,
            subscription_id = %sequence.subscription_id,
            subscription_cancelled = cancelled,
            "Account deactivated for non-payment"
        );
        Ok(())
    }

    async fn commit_with_subscription(
        &self,
        sequence: &mut DunningSequence,
        mut subscription: Subscription,
        include_subscription: bool,
    ) -> BillingResult<()> {
        let mut unit = UnitOfWork::new().dunning(sequence);
        if include_subscription {
            unit = unit.subscription(&mut subscription);
        }
        self.store.commit(unit).await
    }
}
