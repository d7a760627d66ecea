//! Billing error taxonomy.
//!
//! `NotFound`/`InvalidTransition`/`AlreadyCancelled` surface immediately and
//! are never retried. `GatewayTransient` is eligible for the dunning retry
//! cycle; `GatewayDeclined` still counts toward the failure threshold but is
//! reported distinctly so the UI can show an actionable message.

use hostara_shared::SubscriptionStatus;
use rust_decimal::Decimal;
use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal transition from {from} to {to}")]
    InvalidTransition {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },

    #[error("subscription has no stored payment method")]
    NoPaymentMethod,

    #[error("transient gateway error: {0}")]
    GatewayTransient(String),

    #[error("payment declined ({code}): {message}")]
    GatewayDeclined { code: String, message: String },

    #[error("subscription is already cancelled")]
    AlreadyCancelled,

    #[error("no completed payment available to refund against")]
    RefundSourceMissing,

    #[error("refund of {requested} exceeds refundable amount {refundable}")]
    RefundExceedsPayment {
        requested: Decimal,
        refundable: Decimal,
    },

    #[error("no configured gateway supports this charge")]
    NoUsableGateway,

    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl BillingError {
    /// Whether the dunning cycle may retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::GatewayTransient(_))
    }

    /// Whether the error represents a failed charge attempt that counts
    /// toward the dunning threshold.
    pub fn counts_as_payment_failure(&self) -> bool {
        matches!(
            self,
            BillingError::GatewayTransient(_)
                | BillingError::GatewayDeclined { .. }
                | BillingError::NoPaymentMethod
                | BillingError::NoUsableGateway
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Storage(err.to_string())
    }
}
