//! Invoice aggregate: line items, totals, payments and the invoice status machine.

use super::{round_money, Plan, Subscription};
use crate::error::{BillingError, BillingResult};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const ENTITY: &str = "invoice";

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    PartiallyPaid,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub const ALL: [InvoiceStatus; 6] = [
        InvoiceStatus::Draft,
        InvoiceStatus::Issued,
        InvoiceStatus::PartiallyPaid,
        InvoiceStatus::Paid,
        InvoiceStatus::Overdue,
        InvoiceStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::PartiallyPaid => "partially_paid",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Cancelled)
    }

    /// Statuses that still expect money from the client.
    pub fn is_collectable(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Issued | InvoiceStatus::PartiallyPaid | InvoiceStatus::Overdue
        )
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InvoiceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BillingError::validation(format!("Unknown invoice status: {}", s)))
    }
}

/// Line item category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemCategory {
    Subscription,
    Setup,
    AddOn,
    Service,
    Other,
}

/// Payment method recorded against an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    BankTransfer,
    Card,
    Cash,
    Cheque,
    Online,
    AutomaticRetry,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Card => "card",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Cheque => "cheque",
            PaymentMethod::Online => "online",
            PaymentMethod::AutomaticRetry => "automatic_retry",
        }
    }
}

/// Line item on an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub line_item_id: Uuid,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub category: LineItemCategory,
    pub sort_order: i32,
}

impl LineItem {
    pub fn line_total(&self) -> Decimal {
        self.quantity * self.unit_price
    }
}

/// Input for a line item.
#[derive(Debug, Clone)]
pub struct CreateLineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub category: LineItemCategory,
}

impl CreateLineItem {
    fn validate(&self) -> BillingResult<()> {
        if self.description.trim().is_empty() {
            return Err(BillingError::validation("Line item description is required"));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(BillingError::validation("Line item quantity must be positive"));
        }
        if self.unit_price < Decimal::ZERO {
            return Err(BillingError::validation(
                "Line item unit price cannot be negative",
            ));
        }
        Ok(())
    }

    fn into_line_item(self, sort_order: i32) -> LineItem {
        LineItem {
            line_item_id: Uuid::new_v4(),
            description: self.description,
            quantity: self.quantity,
            unit_price: self.unit_price,
            category: self.category,
            sort_order,
        }
    }
}

/// A payment applied to an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: Uuid,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub paid_at: DateTime<Utc>,
}

/// Input for creating an invoice with manual line items.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub organization_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub currency: Option<String>,
    pub line_items: Vec<CreateLineItem>,
    pub tax_rate: Option<Decimal>,
    pub notes: Option<String>,
    pub billing_period_start: Option<NaiveDate>,
    pub billing_period_end: Option<NaiveDate>,
    pub sales_rep_id: Option<Uuid>,
}

/// Input for recording a payment.
#[derive(Debug, Clone)]
pub struct RecordPayment {
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub reference: Option<String>,
}

/// Invoice aggregate.
///
/// Invariants: `total == subtotal + tax_amount` with `tax_amount` derived from
/// `tax_rate` (a percentage), `paid_amount <= total`, at least one line item, and the
/// invoice number never changes once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub organization_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub status: InvoiceStatus,
    pub currency: String,
    pub line_items: Vec<LineItem>,
    pub tax_rate: Decimal,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
    pub paid_amount: Decimal,
    pub payments: Vec<PaymentRecord>,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub paid_date: Option<NaiveDate>,
    pub billing_period_start: Option<NaiveDate>,
    pub billing_period_end: Option<NaiveDate>,
    pub notes: Option<String>,
    pub sales_rep_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    /// Store revision; see `UnitOfWork`.
    #[serde(default)]
    pub version: i64,
}

impl Invoice {
    /// Build a draft invoice. The number comes from the invoice sequence.
    pub fn create(
        invoice_number: String,
        input: CreateInvoice,
        default_currency: &str,
        default_tax_rate: Decimal,
        now: DateTime<Utc>,
    ) -> BillingResult<Self> {
        if input.line_items.is_empty() {
            return Err(BillingError::validation(
                "Invoice must have at least one line item",
            ));
        }
        for item in &input.line_items {
            item.validate()?;
        }
        let tax_rate = input.tax_rate.unwrap_or(default_tax_rate);
        validate_tax_rate(tax_rate)?;
        validate_period(input.billing_period_start, input.billing_period_end)?;

        let line_items = input
            .line_items
            .into_iter()
            .zip(0..)
            .map(|(item, order)| item.into_line_item(order))
            .collect();

        let mut invoice = Self {
            invoice_id: Uuid::new_v4(),
            invoice_number,
            organization_id: input.organization_id,
            subscription_id: input.subscription_id,
            status: InvoiceStatus::Draft,
            currency: input
                .currency
                .unwrap_or_else(|| default_currency.to_string()),
            line_items,
            tax_rate,
            subtotal: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
            total: Decimal::ZERO,
            paid_amount: Decimal::ZERO,
            payments: Vec::new(),
            issue_date: None,
            due_date: None,
            paid_date: None,
            billing_period_start: input.billing_period_start,
            billing_period_end: input.billing_period_end,
            notes: input.notes,
            sales_rep_id: input.sales_rep_id,
            created_utc: now,
            updated_utc: now,
            version: 0,
        };
        invoice.recalculate_totals();
        Ok(invoice)
    }

    /// Build a draft invoice for one billing period of a subscription: a single
    /// subscription line priced at the subscription's effective price.
    ///
    /// Duplicate detection for the period is the caller's job, it needs the store.
    pub fn create_from_subscription(
        invoice_number: String,
        subscription: &Subscription,
        plan: &Plan,
        period_start: NaiveDate,
        period_end: NaiveDate,
        tax_rate: Decimal,
        now: DateTime<Utc>,
    ) -> BillingResult<Self> {
        let line_item = CreateLineItem {
            description: format!(
                "{} - Platform Subscription ({})",
                plan.name,
                subscription.billing_cycle.as_str()
            ),
            quantity: Decimal::ONE,
            unit_price: subscription.effective_price(),
            category: LineItemCategory::Subscription,
        };

        Self::create(
            invoice_number,
            CreateInvoice {
                organization_id: subscription.organization_id,
                subscription_id: Some(subscription.subscription_id),
                currency: Some(subscription.currency.clone()),
                line_items: vec![line_item],
                tax_rate: Some(tax_rate),
                notes: None,
                billing_period_start: Some(period_start),
                billing_period_end: Some(period_end),
                sales_rep_id: subscription.sales_rep_id,
            },
            &subscription.currency,
            tax_rate,
            now,
        )
    }

    // ------------------------------------------------------------------
    // Status transitions
    // ------------------------------------------------------------------

    pub fn issue(
        &mut self,
        issue_date: NaiveDate,
        payment_due_days: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        if self.status != InvoiceStatus::Draft {
            return Err(BillingError::invalid_transition(ENTITY, self.status, "issue"));
        }
        if payment_due_days < 0 {
            return Err(BillingError::validation(
                "Payment due days cannot be negative",
            ));
        }
        self.issue_date = Some(issue_date);
        self.due_date = Some(issue_date + Duration::days(payment_due_days));
        self.status = InvoiceStatus::Issued;
        self.updated_utc = now;
        Ok(())
    }

    /// Apply a payment. Returns the new payment record.
    pub fn record_payment(
        &mut self,
        payment: RecordPayment,
        now: DateTime<Utc>,
    ) -> BillingResult<&PaymentRecord> {
        if !self.status.is_collectable() {
            return Err(BillingError::invalid_transition(
                ENTITY,
                self.status,
                "record_payment",
            ));
        }
        if payment.amount <= Decimal::ZERO {
            return Err(BillingError::validation("Payment amount must be positive"));
        }
        let new_paid = self.paid_amount + payment.amount;
        if new_paid > self.total {
            return Err(BillingError::validation(format!(
                "Overpayment: {} would exceed the remaining balance of {}",
                payment.amount,
                self.remaining_balance()
            )));
        }

        self.paid_amount = new_paid;
        if new_paid == self.total {
            self.status = InvoiceStatus::Paid;
            self.paid_date = Some(now.date_naive());
        } else {
            self.status = InvoiceStatus::PartiallyPaid;
        }
        self.payments.push(PaymentRecord {
            payment_id: Uuid::new_v4(),
            amount: payment.amount,
            method: payment.method,
            reference: payment.reference,
            paid_at: now,
        });
        self.updated_utc = now;
        Ok(&self.payments[self.payments.len() - 1])
    }

    /// Flag an issued invoice whose due date has passed. Re-marking an overdue invoice
    /// is a no-op; returns whether anything changed.
    pub fn mark_overdue(&mut self, today: NaiveDate, now: DateTime<Utc>) -> BillingResult<bool> {
        match self.status {
            InvoiceStatus::Overdue => Ok(false),
            InvoiceStatus::Issued => {
                if !self.is_past_due(today) {
                    return Err(BillingError::validation(format!(
                        "Invoice {} is not past its due date",
                        self.invoice_number
                    )));
                }
                self.status = InvoiceStatus::Overdue;
                self.updated_utc = now;
                Ok(true)
            }
            other => Err(BillingError::invalid_transition(
                ENTITY,
                other,
                "mark_overdue",
            )),
        }
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> BillingResult<()> {
        if !matches!(self.status, InvoiceStatus::Draft | InvoiceStatus::Issued) {
            return Err(BillingError::invalid_transition(ENTITY, self.status, "cancel"));
        }
        if self.paid_amount > Decimal::ZERO {
            return Err(BillingError::invalid_transition(
                ENTITY,
                "holding payments",
                "cancel",
            ));
        }
        self.status = InvoiceStatus::Cancelled;
        self.updated_utc = now;
        Ok(())
    }

    /// Only drafts may be hard-deleted.
    pub fn ensure_deletable(&self) -> BillingResult<()> {
        if self.status != InvoiceStatus::Draft {
            return Err(BillingError::invalid_transition(ENTITY, self.status, "delete"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Draft editing
    // ------------------------------------------------------------------

    pub fn add_line_item(
        &mut self,
        item: CreateLineItem,
        now: DateTime<Utc>,
    ) -> BillingResult<&LineItem> {
        if self.status != InvoiceStatus::Draft {
            return Err(BillingError::invalid_transition(
                ENTITY,
                self.status,
                "add_line_item",
            ));
        }
        item.validate()?;
        let sort_order = self
            .line_items
            .iter()
            .map(|li| li.sort_order)
            .max()
            .map_or(0, |max| max + 1);
        self.line_items.push(item.into_line_item(sort_order));
        self.recalculate_totals();
        self.updated_utc = now;
        Ok(&self.line_items[self.line_items.len() - 1])
    }

    pub fn remove_line_item(&mut self, line_item_id: Uuid, now: DateTime<Utc>) -> BillingResult<()> {
        if self.status != InvoiceStatus::Draft {
            return Err(BillingError::invalid_transition(
                ENTITY,
                self.status,
                "remove_line_item",
            ));
        }
        let position = self
            .line_items
            .iter()
            .position(|li| li.line_item_id == line_item_id)
            .ok_or_else(|| BillingError::not_found("line item", line_item_id))?;
        if self.line_items.len() == 1 {
            return Err(BillingError::validation(
                "Invoice must have at least one line item",
            ));
        }
        self.line_items.remove(position);
        self.recalculate_totals();
        self.updated_utc = now;
        Ok(())
    }

    pub fn update_notes(&mut self, notes: Option<String>, now: DateTime<Utc>) {
        self.notes = notes;
        self.updated_utc = now;
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn remaining_balance(&self) -> Decimal {
        self.total - self.paid_amount
    }

    pub fn is_past_due(&self, today: NaiveDate) -> bool {
        self.due_date.is_some_and(|due| today > due)
    }

    /// An issued invoice whose due date has passed but has not been flagged yet.
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.status == InvoiceStatus::Issued && self.is_past_due(today)
    }

    fn recalculate_totals(&mut self) {
        self.line_items.sort_by_key(|li| li.sort_order);
        self.subtotal = self.line_items.iter().map(LineItem::line_total).sum();
        self.tax_amount = round_money(self.subtotal * self.tax_rate / Decimal::ONE_HUNDRED);
        self.total = self.subtotal + self.tax_amount;
    }
}

fn validate_tax_rate(tax_rate: Decimal) -> BillingResult<()> {
    if tax_rate < Decimal::ZERO || tax_rate > Decimal::ONE_HUNDRED {
        return Err(BillingError::validation(format!(
            "Tax rate must be between 0 and 100, got {}",
            tax_rate
        )));
    }
    Ok(())
}

fn validate_period(start: Option<NaiveDate>, end: Option<NaiveDate>) -> BillingResult<()> {
    match (start, end) {
        (Some(start), Some(end)) if end < start => Err(BillingError::validation(format!(
            "Billing period end {} is before its start {}",
            end, start
        ))),
        (Some(_), None) | (None, Some(_)) => Err(BillingError::validation(
            "Billing period needs both a start and an end",
        )),
        _ => Ok(()),
    }
}

/// Filter parameters for listing invoices.
#[derive(Debug, Clone, Default)]
pub struct ListInvoicesFilter {
    pub organization_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub statuses: Vec<InvoiceStatus>,
    pub due_before: Option<NaiveDate>,
}

impl ListInvoicesFilter {
    pub fn with_status(status: InvoiceStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Default::default()
        }
    }

    pub fn matches(&self, invoice: &Invoice) -> bool {
        self.organization_id
            .is_none_or(|org| invoice.organization_id == org)
            && self
                .subscription_id
                .is_none_or(|sub| invoice.subscription_id == Some(sub))
            && (self.statuses.is_empty() || self.statuses.contains(&invoice.status))
            && self
                .due_before
                .is_none_or(|cutoff| invoice.due_date.is_some_and(|due| due < cutoff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn item(quantity: Decimal, price: Decimal) -> CreateLineItem {
        CreateLineItem {
            description: "Platform fee".to_string(),
            quantity,
            unit_price: price,
            category: LineItemCategory::Subscription,
        }
    }

    fn draft(items: Vec<CreateLineItem>, tax: Decimal) -> BillingResult<Invoice> {
        Invoice::create(
            "INV-2026-00001".to_string(),
            CreateInvoice {
                organization_id: Uuid::new_v4(),
                subscription_id: None,
                currency: None,
                line_items: items,
                tax_rate: Some(tax),
                notes: None,
                billing_period_start: None,
                billing_period_end: None,
                sales_rep_id: None,
            },
            "SAR",
            dec!(15),
            now(),
        )
    }

    #[test]
    fn totals_follow_tax_rate() {
        let invoice = draft(vec![item(dec!(2), dec!(99.99)), item(dec!(1), dec!(0.05))], dec!(15))
            .unwrap();
        assert_eq!(invoice.subtotal, dec!(200.03));
        assert_eq!(invoice.tax_amount, dec!(30.00));
        assert_eq!(invoice.total, invoice.subtotal + invoice.tax_amount);
        assert_eq!(invoice.currency, "SAR");
    }

    #[test]
    fn empty_line_items_are_rejected() {
        let err = draft(vec![], dec!(15)).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[test]
    fn tax_rate_out_of_range_is_rejected() {
        let err = draft(vec![item(dec!(1), dec!(10))], dec!(120)).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[test]
    fn cancel_is_refused_once_money_arrived() {
        let mut invoice = draft(vec![item(dec!(1), dec!(100))], dec!(0)).unwrap();
        invoice
            .issue(now().date_naive(), 30, now())
            .unwrap();
        invoice
            .record_payment(
                RecordPayment {
                    amount: dec!(10),
                    method: PaymentMethod::Cash,
                    reference: None,
                },
                now(),
            )
            .unwrap();
        let err = invoice.cancel(now()).unwrap_err();
        assert!(matches!(err, BillingError::InvalidStateTransition { .. }));
        assert_eq!(invoice.status, InvoiceStatus::PartiallyPaid);
    }

    #[test]
    fn draft_editing_keeps_totals_in_sync() {
        let mut invoice = draft(vec![item(dec!(1), dec!(100))], dec!(10)).unwrap();
        let added = invoice
            .add_line_item(item(dec!(3), dec!(50)), now())
            .unwrap()
            .line_item_id;
        assert_eq!(invoice.total, dec!(275.00));

        invoice.remove_line_item(added, now()).unwrap();
        assert_eq!(invoice.total, dec!(110.00));

        let only = invoice.line_items[0].line_item_id;
        assert!(invoice.remove_line_item(only, now()).is_err());
    }

    #[test]
    fn mark_overdue_requires_due_date_to_pass() {
        let mut invoice = draft(vec![item(dec!(1), dec!(100))], dec!(0)).unwrap();
        let issue_date = now().date_naive();
        invoice.issue(issue_date, 30, now()).unwrap();

        let due = invoice.due_date.unwrap();
        assert!(invoice.mark_overdue(due, now()).is_err());
        assert!(invoice.mark_overdue(due + Duration::days(1), now()).unwrap());
        assert!(!invoice.mark_overdue(due + Duration::days(2), now()).unwrap());
        assert_eq!(invoice.status, InvoiceStatus::Overdue);
    }
}
