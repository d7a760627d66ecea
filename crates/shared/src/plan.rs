//! Plan entity and billing-interval arithmetic.

use chrono::{DateTime, Duration, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How often a plan bills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Weekly,
    Monthly,
    Yearly,
}

impl BillingInterval {
    /// Advance `from` by one billing interval.
    ///
    /// Month and year additions are calendar-aware: Jan 31 + 1 month clamps
    /// to the last day of February instead of overflowing into March.
    pub fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            BillingInterval::Weekly => from + Duration::days(7),
            BillingInterval::Monthly => from.checked_add_months(Months::new(1)).unwrap_or(from),
            BillingInterval::Yearly => from.checked_add_months(Months::new(12)).unwrap_or(from),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Weekly => "weekly",
            BillingInterval::Monthly => "monthly",
            BillingInterval::Yearly => "yearly",
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A product a client can subscribe to.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub currency: String,
    pub interval: BillingInterval,
    pub trial_days: i32,
    pub created_at: DateTime<Utc>,
}
