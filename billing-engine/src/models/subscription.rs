//! Subscription aggregate.

use super::{add_months, round_money, Plan};
use crate::error::{BillingError, BillingResult};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const ENTITY: &str = "subscription";

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Suspended,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 5] = [
        SubscriptionStatus::Trial,
        SubscriptionStatus::Active,
        SubscriptionStatus::Suspended,
        SubscriptionStatus::Cancelled,
        SubscriptionStatus::Expired,
    ];

    /// Statuses that block a second subscription for the same organization.
    pub const OPEN: [SubscriptionStatus; 3] = [
        SubscriptionStatus::Trial,
        SubscriptionStatus::Active,
        SubscriptionStatus::Suspended,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Cancelled | SubscriptionStatus::Expired)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubscriptionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BillingError::validation(format!("Unknown subscription status: {}", s)))
    }
}

/// Recurrence period at which a subscription is invoiced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Annual,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Annual => "annual",
        }
    }

    pub fn months(&self) -> u32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Annual => 12,
        }
    }
}

impl FromStr for BillingCycle {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(BillingCycle::Monthly),
            "annual" => Ok(BillingCycle::Annual),
            other => Err(BillingError::validation(format!(
                "Unknown billing cycle: {}",
                other
            ))),
        }
    }
}

/// Input for creating a subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub organization_id: Uuid,
    pub plan_id: Uuid,
    pub billing_cycle: BillingCycle,
    /// Defaults to the plan price for the cycle.
    pub agreed_price: Option<Decimal>,
    pub contract_months: u32,
    pub discount_percentage: Option<Decimal>,
    pub auto_renew: bool,
    pub sales_rep_id: Option<Uuid>,
    /// Defaults to today.
    pub start_date: Option<NaiveDate>,
}

/// Subscription aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub organization_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub trial_end_date: Option<NaiveDate>,
    pub agreed_price: Decimal,
    pub currency: String,
    pub discount_percentage: Option<Decimal>,
    pub auto_renew: bool,
    pub sales_rep_id: Option<Uuid>,
    pub contract_months: u32,
    pub suspended_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    /// Store revision; see `UnitOfWork`.
    #[serde(default)]
    pub version: i64,
}

impl Subscription {
    /// Start a trial. The trial period doubles as the initial term.
    pub fn create_trial(
        input: CreateSubscription,
        plan: &Plan,
        trial_days: i64,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> BillingResult<Self> {
        if trial_days <= 0 {
            return Err(BillingError::validation("Trial days must be positive"));
        }
        let start = input.start_date.unwrap_or(today);
        let trial_end = start + Duration::days(trial_days);
        let mut subscription = Self::build(input, plan, start, trial_end, now)?;
        subscription.status = SubscriptionStatus::Trial;
        subscription.trial_end_date = Some(trial_end);
        Ok(subscription)
    }

    /// Start a paid term of `contract_months`.
    pub fn create_active(
        input: CreateSubscription,
        plan: &Plan,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> BillingResult<Self> {
        let start = input.start_date.unwrap_or(today);
        let end = add_months(start, input.contract_months)?;
        Self::build(input, plan, start, end, now)
    }

    fn build(
        input: CreateSubscription,
        plan: &Plan,
        start_date: NaiveDate,
        end_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> BillingResult<Self> {
        plan.ensure_sellable()?;
        validate_contract_months(input.contract_months)?;
        if let Some(pct) = input.discount_percentage {
            validate_discount(pct)?;
        }
        let agreed_price = input
            .agreed_price
            .unwrap_or_else(|| plan.price_for_cycle(input.billing_cycle));
        if agreed_price < Decimal::ZERO {
            return Err(BillingError::validation("Agreed price cannot be negative"));
        }

        Ok(Self {
            subscription_id: Uuid::new_v4(),
            organization_id: input.organization_id,
            plan_id: plan.plan_id,
            status: SubscriptionStatus::Active,
            billing_cycle: input.billing_cycle,
            start_date,
            end_date,
            trial_end_date: None,
            agreed_price,
            currency: plan.currency.clone(),
            discount_percentage: input.discount_percentage,
            auto_renew: input.auto_renew,
            sales_rep_id: input.sales_rep_id,
            contract_months: input.contract_months,
            suspended_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            created_utc: now,
            updated_utc: now,
            version: 0,
        })
    }

    // ------------------------------------------------------------------
    // Status transitions
    // ------------------------------------------------------------------

    /// Convert a trial into a paid term starting today, or lift a suspension.
    pub fn activate(&mut self, today: NaiveDate, now: DateTime<Utc>) -> BillingResult<()> {
        match self.status {
            SubscriptionStatus::Trial => {
                self.end_date = add_months(today, self.contract_months)?;
                self.start_date = today;
            }
            SubscriptionStatus::Suspended => {
                self.suspended_at = None;
            }
            other => {
                return Err(BillingError::invalid_transition(ENTITY, other, "activate"));
            }
        }
        self.status = SubscriptionStatus::Active;
        self.updated_utc = now;
        Ok(())
    }

    pub fn suspend(&mut self, now: DateTime<Utc>) -> BillingResult<()> {
        if !matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trial
        ) {
            return Err(BillingError::invalid_transition(ENTITY, self.status, "suspend"));
        }
        self.status = SubscriptionStatus::Suspended;
        self.suspended_at = Some(now);
        self.updated_utc = now;
        Ok(())
    }

    pub fn cancel(&mut self, reason: Option<String>, now: DateTime<Utc>) -> BillingResult<()> {
        if self.status.is_terminal() {
            return Err(BillingError::invalid_transition(ENTITY, self.status, "cancel"));
        }
        self.status = SubscriptionStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.cancellation_reason = reason;
        self.updated_utc = now;
        Ok(())
    }

    pub fn renew(
        &mut self,
        new_end_date: NaiveDate,
        new_price: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        if self.status != SubscriptionStatus::Active {
            return Err(BillingError::invalid_transition(ENTITY, self.status, "renew"));
        }
        if new_end_date <= self.end_date {
            return Err(BillingError::validation(format!(
                "Renewal end date {} must be after the current end date {}",
                new_end_date, self.end_date
            )));
        }
        if let Some(price) = new_price {
            if price < Decimal::ZERO {
                return Err(BillingError::validation("Agreed price cannot be negative"));
            }
            self.agreed_price = price;
        }
        self.end_date = new_end_date;
        self.updated_utc = now;
        Ok(())
    }

    /// Extend a lapsed auto-renewing term by whole contract terms until it covers
    /// `today`. Returns the number of terms added; a term that still covers `today`
    /// is left alone.
    pub fn auto_renew(&mut self, today: NaiveDate, now: DateTime<Utc>) -> BillingResult<u32> {
        if self.status != SubscriptionStatus::Active {
            return Err(BillingError::invalid_transition(ENTITY, self.status, "auto_renew"));
        }
        if !self.auto_renew {
            return Err(BillingError::validation(format!(
                "Subscription {} does not auto-renew",
                self.subscription_id
            )));
        }
        let mut end_date = self.end_date;
        let mut terms = 0;
        while end_date < today {
            end_date = add_months(end_date, self.contract_months)?;
            terms += 1;
        }
        if terms > 0 {
            self.end_date = end_date;
            self.updated_utc = now;
        }
        Ok(terms)
    }

    /// Swap plans. An active term restarts today with the new contract length; a trial
    /// keeps its dates.
    pub fn change_plan(
        &mut self,
        plan: &Plan,
        new_price: Option<Decimal>,
        new_contract_months: Option<u32>,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        if !matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trial
        ) {
            return Err(BillingError::invalid_transition(
                ENTITY,
                self.status,
                "change_plan",
            ));
        }
        plan.ensure_sellable()?;
        let contract_months = new_contract_months.unwrap_or(self.contract_months);
        validate_contract_months(contract_months)?;
        let price = new_price.unwrap_or_else(|| plan.price_for_cycle(self.billing_cycle));
        if price < Decimal::ZERO {
            return Err(BillingError::validation("Agreed price cannot be negative"));
        }

        if self.status == SubscriptionStatus::Active {
            self.end_date = add_months(today, contract_months)?;
            self.start_date = today;
        }
        self.plan_id = plan.plan_id;
        self.agreed_price = price;
        self.currency = plan.currency.clone();
        self.contract_months = contract_months;
        self.updated_utc = now;
        Ok(())
    }

    pub fn expire(&mut self, today: NaiveDate, now: DateTime<Utc>) -> BillingResult<()> {
        let due = match self.status {
            SubscriptionStatus::Active => today > self.end_date,
            SubscriptionStatus::Trial => self.trial_end_date.is_some_and(|end| today > end),
            other => return Err(BillingError::invalid_transition(ENTITY, other, "expire")),
        };
        if !due {
            return Err(BillingError::validation(format!(
                "Subscription {} has not reached its end date",
                self.subscription_id
            )));
        }
        self.status = SubscriptionStatus::Expired;
        self.updated_utc = now;
        Ok(())
    }

    pub fn apply_discount(&mut self, percentage: Decimal, now: DateTime<Utc>) -> BillingResult<()> {
        validate_discount(percentage)?;
        self.discount_percentage = Some(percentage);
        self.updated_utc = now;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn effective_price(&self) -> Decimal {
        match self.discount_percentage {
            Some(pct) => round_money(
                self.agreed_price * (Decimal::ONE_HUNDRED - pct) / Decimal::ONE_HUNDRED,
            ),
            None => self.agreed_price,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_trial_expired(&self, today: NaiveDate) -> bool {
        self.status == SubscriptionStatus::Trial
            && self.trial_end_date.is_some_and(|end| today > end)
    }

    pub fn is_term_expired(&self, today: NaiveDate) -> bool {
        self.status == SubscriptionStatus::Active && today > self.end_date
    }

    pub fn days_until_end(&self, today: NaiveDate) -> i64 {
        (self.end_date - today).num_days()
    }

    /// Billing period containing `today`: the calendar month for monthly cycles, the
    /// contract-anniversary year for annual ones. `None` before the start date.
    pub fn billing_period_containing(
        &self,
        today: NaiveDate,
    ) -> BillingResult<Option<(NaiveDate, NaiveDate)>> {
        if today < self.start_date {
            return Ok(None);
        }
        match self.billing_cycle {
            BillingCycle::Monthly => {
                let start = today.with_day0(0).ok_or_else(|| {
                    BillingError::validation(format!("Invalid billing date {}", today))
                })?;
                let end = add_months(start, 1)? - Duration::days(1);
                Ok(Some((start, end)))
            }
            BillingCycle::Annual => {
                let mut start = self.start_date;
                loop {
                    let next = add_months(start, self.billing_cycle.months())?;
                    if next > today {
                        return Ok(Some((start, next - Duration::days(1))));
                    }
                    start = next;
                }
            }
        }
    }
}

fn validate_discount(percentage: Decimal) -> BillingResult<()> {
    if percentage < Decimal::ZERO || percentage > Decimal::ONE_HUNDRED {
        return Err(BillingError::validation(format!(
            "Discount must be between 0 and 100, got {}",
            percentage
        )));
    }
    Ok(())
}

fn validate_contract_months(months: u32) -> BillingResult<()> {
    if months == 0 {
        return Err(BillingError::validation("Contract months must be positive"));
    }
    Ok(())
}

/// Filter parameters for listing subscriptions.
#[derive(Debug, Clone, Default)]
pub struct ListSubscriptionsFilter {
    pub organization_id: Option<Uuid>,
    pub statuses: Vec<SubscriptionStatus>,
    pub plan_id: Option<Uuid>,
}

impl ListSubscriptionsFilter {
    pub fn with_status(status: SubscriptionStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Default::default()
        }
    }

    pub fn matches(&self, subscription: &Subscription) -> bool {
        self.organization_id
            .is_none_or(|org| subscription.organization_id == org)
            && self.plan_id.is_none_or(|plan| subscription.plan_id == plan)
            && (self.statuses.is_empty() || self.statuses.contains(&subscription.status))
    }
}
