//! Yearly invoice counter.

use crate::error::{BillingError, BillingResult};
use serde::{Deserialize, Serialize};

/// Singleton counter row. `last_value` is the last number handed out in `year`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRow {
    pub year: i32,
    pub last_value: i64,
}

impl SequenceRow {
    /// Row as it exists before the first allocation of `year`.
    pub fn empty(year: i32) -> Self {
        Self {
            year,
            last_value: 0,
        }
    }

    /// Advance the counter for `year`, restarting at 1 when a new year begins. A year
    /// before the stored one is rejected; restarting there would reissue numbers.
    pub fn advance(&mut self, year: i32) -> BillingResult<i64> {
        if year < self.year {
            return Err(BillingError::conflict(format!(
                "Invoice counter is already at {}, cannot allocate for {}",
                self.year, year
            )));
        }
        if year > self.year {
            self.year = year;
            self.last_value = 0;
        }
        self.last_value += 1;
        Ok(self.last_value)
    }

    pub fn format(&self, prefix: &str) -> String {
        format!("{}-{}-{:05}", prefix, self.year, self.last_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_resets_on_year_change() {
        let mut row = SequenceRow::empty(2025);
        assert_eq!(row.advance(2025).unwrap(), 1);
        assert_eq!(row.advance(2025).unwrap(), 2);
        assert_eq!(row.advance(2026).unwrap(), 1);
        assert_eq!(row.format("INV"), "INV-2026-00001");
    }

    #[test]
    fn earlier_year_is_rejected() {
        let mut row = SequenceRow::empty(2026);
        row.advance(2026).unwrap();
        row.advance(2026).unwrap();

        let err = row.advance(2025).unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
        assert_eq!(row, SequenceRow { year: 2026, last_value: 2 });
        assert_eq!(row.advance(2026).unwrap(), 3);
    }
}
