//! Subscription lifecycle state machine.
//!
//! The authoritative transition table consumed by the renewal orchestrator,
//! the dunning manager, and the cancellation service. Illegal transitions are
//! rejected, never silently coerced.

use hostara_shared::SubscriptionStatus;
use serde::Serialize;

use crate::error::{BillingError, BillingResult};

/// Reason codes carried on every audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    SuccessfulRenewal,
    RenewalFailed,
    TrialConverted,
    MaxPaymentAttemptsReached,
    PaymentRecovered,
    CancellationRequested,
    ImmediateCancellation,
    PeriodEndExpiry,
    SubscriptionPaused,
    SubscriptionResumed,
}

impl TransitionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionReason::SuccessfulRenewal => "successful_renewal",
            TransitionReason::RenewalFailed => "renewal_failed",
            TransitionReason::TrialConverted => "trial_converted",
            TransitionReason::MaxPaymentAttemptsReached => "max_payment_attempts_reached",
            TransitionReason::PaymentRecovered => "payment_recovered",
            TransitionReason::CancellationRequested => "cancellation_requested",
            TransitionReason::ImmediateCancellation => "immediate_cancellation",
            TransitionReason::PeriodEndExpiry => "period_end_expiry",
            TransitionReason::SubscriptionPaused => "subscription_paused",
            TransitionReason::SubscriptionResumed => "subscription_resumed",
        }
    }
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether `from -> to` is a legal lifecycle transition.
pub fn can_transition(from: SubscriptionStatus, to: SubscriptionStatus) -> bool {
    use SubscriptionStatus::*;

    match from {
        Trialing => matches!(to, Active | PastDue | PendingCancellation | Cancelled),
        // Active -> Active is the successful-renewal self-transition.
        Active => matches!(to, Active | PastDue | Paused | PendingCancellation | Cancelled),
        PastDue => matches!(to, Active | Unpaid | PendingCancellation | Cancelled),
        Unpaid => matches!(to, Active | Cancelled),
        Paused => matches!(to, Active | Cancelled),
        PendingCancellation => matches!(to, Active | Cancelled),
        Cancelled => false,
    }
}

/// Validate a transition, mapping a terminal source to `AlreadyCancelled`.
pub fn ensure_transition(
    from: SubscriptionStatus,
    to: SubscriptionStatus,
) -> BillingResult<()> {
    if from == SubscriptionStatus::Cancelled {
        return Err(BillingError::AlreadyCancelled);
    }
    if !can_transition(from, to) {
        return Err(BillingError::InvalidTransition { from, to });
    }
    Ok(())
}
