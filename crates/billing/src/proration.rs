//! Proration calculator.
//!
//! Pure day-fraction arithmetic shared by plan-change previews and
//! unused-time refunds. Both flows call [`calculate_proration`] — the formula
//! and its rounding exist exactly once.

use chrono::{DateTime, Utc};
use hostara_shared::{ceil_days, round_money};
use rust_decimal::Decimal;
use serde::Serialize;

/// Credit/charge breakdown for a mid-period change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProrationResult {
    pub total_days: i64,
    pub remaining_days: i64,
    /// Value of unused time on the current plan.
    pub credit_amount: Decimal,
    /// Cost of the remaining period on the new plan.
    pub charge_amount: Decimal,
    /// `charge - credit`; positive means the client owes money.
    pub net_amount: Decimal,
}

impl ProrationResult {
    fn zero(total_days: i64) -> Self {
        Self {
            total_days,
            remaining_days: 0,
            credit_amount: Decimal::ZERO,
            charge_amount: Decimal::ZERO,
            net_amount: Decimal::ZERO,
        }
    }
}

/// Compute proration for a plan change at instant `now`.
///
/// Day counts round up; `remaining_days` clamps to 0 once the period has
/// ended, so proration never goes negative. All amounts are rounded to two
/// decimals, half away from zero.
pub fn calculate_proration(
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    now: DateTime<Utc>,
    current_price: Decimal,
    new_price: Decimal,
) -> ProrationResult {
    let total_days = ceil_days(period_end - period_start);
    if total_days == 0 || now >= period_end {
        return ProrationResult::zero(total_days);
    }

    let remaining_days = ceil_days(period_end - now).min(total_days);
    let total = Decimal::from(total_days);
    let remaining = Decimal::from(remaining_days);

    let credit_amount = round_money(current_price / total * remaining);
    let charge_amount = round_money(new_price / total * remaining);
    let net_amount = round_money(charge_amount - credit_amount);

    ProrationResult {
        total_days,
        remaining_days,
        credit_amount,
        charge_amount,
        net_amount,
    }
}

/// Unused-time credit at cancellation: the new price is zero, only the
/// credit leg is meaningful.
pub fn unused_time_credit(
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    now: DateTime<Utc>,
    current_price: Decimal,
) -> Decimal {
    calculate_proration(period_start, period_end, now, current_price, Decimal::ZERO).credit_amount
}
