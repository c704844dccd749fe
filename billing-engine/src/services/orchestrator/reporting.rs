//! Read-side aggregates for dashboards and support tooling.

use super::BillingOrchestrator;
use crate::error::BillingResult;
use crate::models::{
    DunningStatus, InvoiceStatus, ListDunningFilter, ListInvoicesFilter, ListSubscriptionsFilter,
    SubscriptionStatus,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceStatistics {
    pub total: u32,
    /// Keyed by status name; every status is present.
    pub by_status: BTreeMap<String, u32>,
    /// Remaining balance over issued, partially paid and overdue invoices.
    pub outstanding_balance: Decimal,
    pub paid_amount: Decimal,
}

impl InvoiceStatistics {
    pub fn count(&self, status: InvoiceStatus) -> u32 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionStatistics {
    pub total: u32,
    pub by_status: BTreeMap<String, u32>,
}

impl SubscriptionStatistics {
    pub fn count(&self, status: SubscriptionStatus) -> u32 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DunningStatistics {
    pub total: u32,
    pub by_status: BTreeMap<String, u32>,
    /// Open sequences handed to a CSM.
    pub escalated: u32,
    pub outstanding_amount: Decimal,
    pub recovered_amount: Decimal,
    /// `recovered / (recovered + deactivated + suspended)`, 0 when nothing has
    /// reached one of those states.
    pub recovery_rate: f64,
}

impl DunningStatistics {
    pub fn count(&self, status: DunningStatus) -> u32 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

fn empty_counts<'a>(names: impl Iterator<Item = &'a str>) -> BTreeMap<String, u32> {
    names.map(|name| (name.to_string(), 0)).collect()
}

fn bump(counts: &mut BTreeMap<String, u32>, name: &str) {
    *counts.entry(name.to_string()).or_insert(0) += 1;
}

impl BillingOrchestrator {
    pub async fn invoice_statistics(
        &self,
        organization_id: Option<Uuid>,
    ) -> BillingResult<InvoiceStatistics> {
        let invoices = self
            .store
            .list_invoices(&ListInvoicesFilter {
                organization_id,
                ..Default::default()
            })
            .await?;

        let mut by_status = empty_counts(InvoiceStatus::ALL.iter().map(InvoiceStatus::as_str));
        let mut outstanding_balance = Decimal::ZERO;
        let mut paid_amount = Decimal::ZERO;
        for invoice in &invoices {
            bump(&mut by_status, invoice.status.as_str());
            if invoice.status.is_collectable() {
                outstanding_balance += invoice.remaining_balance();
            }
            paid_amount += invoice.paid_amount;
        }

        Ok(InvoiceStatistics {
            total: invoices.len() as u32,
            by_status,
            outstanding_balance,
            paid_amount,
        })
    }

    pub async fn subscription_statistics(
        &self,
        organization_id: Option<Uuid>,
    ) -> BillingResult<SubscriptionStatistics> {
        let subscriptions = self
            .store
            .list_subscriptions(&ListSubscriptionsFilter {
                organization_id,
                ..Default::default()
            })
            .await?;

        let mut by_status =
            empty_counts(SubscriptionStatus::ALL.iter().map(SubscriptionStatus::as_str));
        for subscription in &subscriptions {
            bump(&mut by_status, subscription.status.as_str());
        }

        Ok(SubscriptionStatistics {
            total: subscriptions.len() as u32,
            by_status,
        })
    }

    pub async fn dunning_statistics(
        &self,
        organization_id: Option<Uuid>,
    ) -> BillingResult<DunningStatistics> {
        let sequences = self
            .store
            .list_dunning(&ListDunningFilter {
                organization_id,
                ..Default::default()
            })
            .await?;

        let mut by_status = empty_counts(DunningStatus::ALL.iter().map(DunningStatus::as_str));
        let mut escalated = 0;
        let mut outstanding_amount = Decimal::ZERO;
        let mut recovered_amount = Decimal::ZERO;
        for sequence in &sequences {
            bump(&mut by_status, sequence.status.as_str());
            if sequence.is_open() {
                outstanding_amount += sequence.amount;
                if sequence.csm_escalated {
                    escalated += 1;
                }
            }
            if sequence.status == DunningStatus::Recovered {
                recovered_amount += sequence.amount;
            }
        }

        let count = |status: DunningStatus| by_status[status.as_str()];
        let recovered = count(DunningStatus::Recovered);
        let settled = recovered + count(DunningStatus::Deactivated) + count(DunningStatus::Suspended);
        let recovery_rate = if settled == 0 {
            0.0
        } else {
            f64::from(recovered) / f64::from(settled)
        };

        Ok(DunningStatistics {
            total: sequences.len() as u32,
            by_status,
            escalated,
            outstanding_amount,
            recovered_amount,
            recovery_rate,
        })
    }
}
