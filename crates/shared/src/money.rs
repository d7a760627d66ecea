//! Monetary rounding and day-count helpers.
//!
//! Every module that touches money must round through [`round_money`] so the
//! proration formula behaves identically in plan-change and refund flows.

use chrono::Duration;
use rust_decimal::{Decimal, RoundingStrategy};

/// Round a monetary amount to 2 decimal places, half away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Number of days spanned by `span`, rounded up. Negative spans clamp to 0.
pub fn ceil_days(span: Duration) -> i64 {
    let secs = span.num_seconds();
    if secs <= 0 {
        return 0;
    }
    (secs + 86_399) / 86_400
}
