//! Domain models for billing-engine.

mod dunning;
mod invoice;
mod plan;
mod sequence;
mod subscription;

pub use dunning::{
    CreateDunningSequence, DunningEvent, DunningEventType, DunningPolicy, DunningSequence,
    DunningStatus, DunningStep, ListDunningFilter, NotificationChannel, RetryAttempt,
    StepTemplate,
};
pub use invoice::{
    CreateInvoice, CreateLineItem, Invoice, InvoiceStatus, LineItem, LineItemCategory,
    ListInvoicesFilter, PaymentMethod, PaymentRecord, RecordPayment,
};
pub use plan::{CreatePlan, Plan};
pub use sequence::SequenceRow;
pub use subscription::{
    BillingCycle, CreateSubscription, ListSubscriptionsFilter, Subscription, SubscriptionStatus,
};

use crate::error::{BillingError, BillingResult};
use chrono::{Months, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};

/// Round a money amount to 2 decimal places, halves away from zero.
pub(crate) fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub(crate) fn add_months(date: NaiveDate, months: u32) -> BillingResult<NaiveDate> {
    date.checked_add_months(Months::new(months))
        .ok_or_else(|| BillingError::validation(format!("Date {} + {} months is out of range", date, months)))
}
