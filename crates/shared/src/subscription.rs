//! Subscription entity and its lifecycle status enumeration.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a subscription.
///
/// This is a closed enumeration: status values never travel as free-form
/// strings inside the engine, and every transition is validated by the state
/// machine in the billing crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Paused,
    PendingCancellation,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::PendingCancellation => "pending_cancellation",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states admit no outgoing transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Cancelled)
    }

    /// Whether the subscription should be picked up by the due-renewal scan.
    pub fn is_billable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing
                | SubscriptionStatus::Active
                | SubscriptionStatus::PastDue
                | SubscriptionStatus::PendingCancellation
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A client's recurring commitment to a plan.
///
/// The billing period fields are owned exclusively by the renewal flow;
/// cancellation flags by the cancellation service; the failed-attempt counter
/// by the dunning manager. Rows are never physically deleted — terminal
/// subscriptions stay queryable for history.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub next_billing_date: DateTime<Utc>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub cancellation_reason: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub failed_payment_attempts: i32,
    pub last_payment_attempt: Option<DateTime<Utc>>,
    /// Overrides the plan price when set (negotiated/legacy pricing).
    pub price_override: Option<Decimal>,
    /// Stored payment method reference at the gateway (token, mandate id).
    pub payment_method: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether a renewal is due at `now`.
    pub fn is_renewal_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_billable() && now >= self.next_billing_date
    }
}
