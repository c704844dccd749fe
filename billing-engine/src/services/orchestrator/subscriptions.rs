//! Plan and subscription commands, queries and the expiry sweeps.

use super::{track, BatchReport, BatchTimer, BillingOrchestrator};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    CreatePlan, CreateSubscription, ListSubscriptionsFilter, Plan, Subscription,
    SubscriptionStatus,
};
use crate::services::metrics::record_subscription_operation;
use crate::services::store::UnitOfWork;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

impl BillingOrchestrator {
    // ------------------------------------------------------------------
    // Plans
    // ------------------------------------------------------------------

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_plan(&self, input: CreatePlan) -> BillingResult<Plan> {
        track("create_plan", async {
            let mut plan = Plan::create(input, &self.settings.default_currency, self.clock.now())?;
            self.store.commit(UnitOfWork::new().plan(&mut plan)).await?;
            info!(plan_id = %plan.plan_id, name = %plan.name, "Plan created");
            Ok(plan)
        }
        .await)
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        self.load_plan(plan_id).await
    }

    pub async fn list_plans(&self, include_inactive: bool) -> BillingResult<Vec<Plan>> {
        self.store.list_plans(include_inactive).await
    }

    /// Stop selling a plan. Existing subscriptions keep it.
    #[instrument(skip(self))]
    pub async fn deactivate_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let mut plan = self.load_plan(plan_id).await?;
        plan.is_active = false;
        self.store.commit(UnitOfWork::new().plan(&mut plan)).await?;
        info!(plan_id = %plan.plan_id, "Plan deactivated");
        Ok(plan)
    }

    // ------------------------------------------------------------------
    // Subscription commands
    // ------------------------------------------------------------------

    /// Start a trial, `trial_days` falls back to the configured default.
    #[instrument(skip(self, input), fields(organization_id = %input.organization_id))]
    pub async fn create_trial_subscription(
        &self,
        input: CreateSubscription,
        trial_days: Option<i64>,
    ) -> BillingResult<Subscription> {
        track("create_trial_subscription", async {
            self.ensure_no_open_subscription(input.organization_id).await?;
            let plan = self.load_plan(input.plan_id).await?;
            let now = self.clock.now();
            let mut subscription = Subscription::create_trial(
                input,
                &plan,
                trial_days.unwrap_or(self.settings.trial_days),
                now.date_naive(),
                now,
            )?;
            self.store
                .commit(UnitOfWork::new().subscription(&mut subscription))
                .await?;

            record_subscription_operation("create_trial");
            info!(
                subscription_id = %subscription.subscription_id,
                trial_end_date = ?subscription.trial_end_date,
                "Trial subscription created"
            );
            Ok(subscription)
        }
        .await)
    }

    #[instrument(skip(self, input), fields(organization_id = %input.organization_id))]
    pub async fn create_subscription(
        &self,
        input: CreateSubscription,
    ) -> BillingResult<Subscription> {
        track("create_subscription", async {
            self.ensure_no_open_subscription(input.organization_id).await?;
            let plan = self.load_plan(input.plan_id).await?;
            let now = self.clock.now();
            let mut subscription = Subscription::create_active(input, &plan, now.date_naive(), now)?;
            self.store
                .commit(UnitOfWork::new().subscription(&mut subscription))
                .await?;

            record_subscription_operation("create");
            info!(
                subscription_id = %subscription.subscription_id,
                end_date = %subscription.end_date,
                agreed_price = %subscription.agreed_price,
                "Subscription created"
            );
            Ok(subscription)
        }
        .await)
    }

    async fn ensure_no_open_subscription(&self, organization_id: Uuid) -> BillingResult<()> {
        if let Some(existing) = self.store.find_open_subscription(organization_id).await? {
            return Err(BillingError::conflict(format!(
                "Organization {} already has a {} subscription {}",
                organization_id, existing.status, existing.subscription_id
            )));
        }
        Ok(())
    }

    /// Convert a trial or lift a suspension. Dunning recovery never does this on its own.
    #[instrument(skip(self))]
    pub async fn activate_subscription(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.transition_subscription(subscription_id, "activate", |subscription, now| {
            subscription.activate(now.date_naive(), now)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn suspend_subscription(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.transition_subscription(subscription_id, "suspend", |subscription, now| {
            subscription.suspend(now)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
        reason: Option<String>,
    ) -> BillingResult<Subscription> {
        self.transition_subscription(subscription_id, "cancel", move |subscription, now| {
            subscription.cancel(reason, now)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn renew_subscription(
        &self,
        subscription_id: Uuid,
        new_end_date: NaiveDate,
        new_price: Option<Decimal>,
    ) -> BillingResult<Subscription> {
        self.transition_subscription(subscription_id, "renew", move |subscription, now| {
            subscription.renew(new_end_date, new_price, now)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn change_subscription_plan(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        new_price: Option<Decimal>,
        new_contract_months: Option<u32>,
    ) -> BillingResult<Subscription> {
        let plan = track("change_plan", self.load_plan(new_plan_id).await)?;
        self.transition_subscription(subscription_id, "change_plan", move |subscription, now| {
            subscription.change_plan(&plan, new_price, new_contract_months, now.date_naive(), now)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn apply_subscription_discount(
        &self,
        subscription_id: Uuid,
        percentage: Decimal,
    ) -> BillingResult<Subscription> {
        self.transition_subscription(subscription_id, "apply_discount", move |subscription, now| {
            subscription.apply_discount(percentage, now)
        })
        .await
    }

    /// Load, mutate and persist a single subscription.
    async fn transition_subscription<F>(
        &self,
        subscription_id: Uuid,
        operation: &'static str,
        apply: F,
    ) -> BillingResult<Subscription>
    where
        F: FnOnce(&mut Subscription, chrono::DateTime<chrono::Utc>) -> BillingResult<()>,
    {
        track(operation, async {
            let mut subscription = self.load_subscription(subscription_id).await?;
            let from = subscription.status;
            apply(&mut subscription, self.clock.now())?;
            self.store
                .commit(UnitOfWork::new().subscription(&mut subscription))
                .await?;

            record_subscription_operation(operation);
            info!(
                subscription_id = %subscription_id,
                operation,
                from = %from,
                to = %subscription.status,
                "Subscription updated"
            );
            Ok(subscription)
        }
        .await)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.load_subscription(subscription_id).await
    }

    pub async fn get_open_subscription_for_organization(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        self.store.find_open_subscription(organization_id).await
    }

    pub async fn list_subscriptions(
        &self,
        filter: &ListSubscriptionsFilter,
    ) -> BillingResult<Vec<Subscription>> {
        self.store.list_subscriptions(filter).await
    }

    /// Active subscriptions whose term ends within `days` days from today.
    pub async fn subscriptions_expiring_within(&self, days: i64) -> BillingResult<Vec<Subscription>> {
        let today = self.clock.today();
        let active = self
            .store
            .list_subscriptions(&ListSubscriptionsFilter::with_status(
                SubscriptionStatus::Active,
            ))
            .await?;
        Ok(active
            .into_iter()
            .filter(|s| (0..=days).contains(&s.days_until_end(today)))
            .collect())
    }

    /// Trials whose trial period ends within `days` days from today.
    pub async fn trials_ending_within(&self, days: i64) -> BillingResult<Vec<Subscription>> {
        let today = self.clock.today();
        let trials = self
            .store
            .list_subscriptions(&ListSubscriptionsFilter::with_status(
                SubscriptionStatus::Trial,
            ))
            .await?;
        Ok(trials
            .into_iter()
            .filter(|s| {
                s.trial_end_date
                    .is_some_and(|end| (0..=days).contains(&(end - today).num_days()))
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Batch jobs
    // ------------------------------------------------------------------

    /// Expire every trial whose trial period has ended.
    #[instrument(skip(self))]
    pub async fn process_expired_trials(&self) -> BillingResult<BatchReport> {
        let timer = BatchTimer::start("process_expired_trials");
        let now = self.clock.now();
        let today = now.date_naive();

        let trials = self
            .store
            .list_subscriptions(&ListSubscriptionsFilter::with_status(
                SubscriptionStatus::Trial,
            ))
            .await?;

        let mut report = BatchReport::default();
        for mut subscription in trials {
            if !subscription.is_trial_expired(today) {
                report.skip();
                continue;
            }
            let result = async {
                subscription.expire(today, now)?;
                self.store
                    .commit(UnitOfWork::new().subscription(&mut subscription))
                    .await
            }
            .await;

            match result {
                Ok(()) => {
                    record_subscription_operation("expire_trial");
                    info!(subscription_id = %subscription.subscription_id, "Trial expired");
                    report.succeed();
                }
                Err(e) => {
                    error!(subscription_id = %subscription.subscription_id, error = %e, "Failed to expire trial");
                    report.fail(subscription.subscription_id, e);
                }
            }
        }

        timer.finish(report.failures.len());
        Ok(report)
    }

    /// Close out active subscriptions past their end date. Auto-renewing ones are
    /// extended by whole contract terms until they cover today; the rest expire.
    #[instrument(skip(self))]
    pub async fn process_expired_subscriptions(&self) -> BillingResult<BatchReport> {
        let timer = BatchTimer::start("process_expired_subscriptions");
        let now = self.clock.now();
        let today = now.date_naive();

        let active = self
            .store
            .list_subscriptions(&ListSubscriptionsFilter::with_status(
                SubscriptionStatus::Active,
            ))
            .await?;

        let mut report = BatchReport::default();
        for mut subscription in active {
            if !subscription.is_term_expired(today) {
                report.skip();
                continue;
            }
            let subscription_id = subscription.subscription_id;
            let result = async {
                let operation = if subscription.auto_renew {
                    let terms = subscription.auto_renew(today, now)?;
                    debug!(subscription_id = %subscription_id, terms, "Auto-renewed lapsed term");
                    "auto_renew"
                } else {
                    subscription.expire(today, now)?;
                    "expire"
                };
                self.store
                    .commit(UnitOfWork::new().subscription(&mut subscription))
                    .await?;
                Ok::<_, BillingError>(operation)
            }
            .await;

            match result {
                Ok(operation) => {
                    record_subscription_operation(operation);
                    info!(
                        subscription_id = %subscription_id,
                        operation,
                        end_date = %subscription.end_date,
                        "Subscription term closed"
                    );
                    report.succeed();
                }
                Err(e) => {
                    error!(subscription_id = %subscription_id, error = %e, "Failed to process expired subscription");
                    report.fail(subscription_id, e);
                }
            }
        }

        debug!(processed = report.processed, "Expired subscription sweep done");
        timer.finish(report.failures.len());
        Ok(report)
    }
}
