//! Plan reference data.

use super::BillingCycle;
use crate::error::{BillingError, BillingResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Plan a subscription is sold on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub monthly_price: Decimal,
    pub annual_price: Decimal,
    pub currency: String,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    /// Store revision; see `UnitOfWork`.
    #[serde(default)]
    pub version: i64,
}

/// Input for creating a plan.
#[derive(Debug, Clone)]
pub struct CreatePlan {
    pub name: String,
    pub description: Option<String>,
    pub monthly_price: Decimal,
    pub annual_price: Decimal,
    pub currency: Option<String>,
}

impl Plan {
    pub fn create(input: CreatePlan, default_currency: &str, now: DateTime<Utc>) -> BillingResult<Self> {
        if input.name.trim().is_empty() {
            return Err(BillingError::validation("Plan name is required"));
        }
        if input.monthly_price < Decimal::ZERO || input.annual_price < Decimal::ZERO {
            return Err(BillingError::validation("Plan prices cannot be negative"));
        }
        Ok(Self {
            plan_id: Uuid::new_v4(),
            name: input.name,
            description: input.description,
            monthly_price: input.monthly_price,
            annual_price: input.annual_price,
            currency: input
                .currency
                .unwrap_or_else(|| default_currency.to_string()),
            is_active: true,
            created_utc: now,
            version: 0,
        })
    }

    pub fn price_for_cycle(&self, cycle: BillingCycle) -> Decimal {
        match cycle {
            BillingCycle::Monthly => self.monthly_price,
            BillingCycle::Annual => self.annual_price,
        }
    }

    /// Inactive plans stay readable for existing subscriptions but cannot be sold.
    pub fn ensure_sellable(&self) -> BillingResult<()> {
        if !self.is_active {
            return Err(BillingError::validation(format!(
                "Plan {} is not active",
                self.name
            )));
        }
        Ok(())
    }
}
