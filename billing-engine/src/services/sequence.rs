//! Invoice number allocation.

use crate::error::BillingResult;
use crate::services::clock::Clock;
use crate::services::store::BillingStore;
use chrono::Datelike;
use std::sync::Arc;
use tracing::debug;

/// Hands out `{prefix}-{year}-{counter:05}` numbers from the store's yearly counter.
///
/// A number is consumed even if the invoice that requested it is never committed, so
/// numbers are unique and increasing but may skip.
#[derive(Clone)]
pub struct SequenceGenerator {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
}

impl SequenceGenerator {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            prefix: prefix.into(),
        }
    }

    pub async fn next_invoice_number(&self) -> BillingResult<String> {
        let year = self.clock.today().year();
        let row = self.store.allocate_invoice_sequence(year).await?;
        let number = row.format(&self.prefix);
        debug!(invoice_number = %number, "Allocated invoice number");
        Ok(number)
    }
}
