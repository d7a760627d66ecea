//! Cross-cutting lifecycle tests: renewal, dunning, cancellation, and refund
//! flows exercised end-to-end against the in-memory store.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use uuid::Uuid;

use crate::cancellation::CancelOptions;
use crate::clock::Clock;
use crate::error::BillingError;
use crate::gateway::{MockGateway, MockGatewayConfig, MockOutcome};
use crate::renewal::RenewalOutcome;
use crate::store::BillingStore;
use crate::test_support::{fixtures, TestEnv};
use hostara_shared::{ChangeActor, InvoiceStatus, PaymentStatus, RefundStatus, SubscriptionStatus};

fn period_end_cancel(reason: &str) -> CancelOptions {
    CancelOptions {
        cancel_at_period_end: true,
        reason: reason.to_string(),
        refund_unused_time: false,
        actor: ChangeActor::System,
    }
}

fn immediate_cancel(reason: &str, refund: bool) -> CancelOptions {
    CancelOptions {
        cancel_at_period_end: false,
        reason: reason.to_string(),
        refund_unused_time: refund,
        actor: ChangeActor::System,
    }
}

// --- renewal ----------------------------------------------------------------

#[tokio::test]
async fn successful_renewal_advances_period_and_pays_invoice() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);

    let outcome = env
        .engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();

    let RenewalOutcome::Renewed {
        invoice_id,
        payment_id,
        next_billing_date,
    } = outcome
    else {
        panic!("expected Renewed, got {outcome:?}");
    };
    assert_eq!(
        next_billing_date,
        Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap()
    );

    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);
    assert_eq!(current.current_period_start, sub.current_period_end);
    assert_eq!(current.current_period_end, next_billing_date);
    assert_eq!(current.failed_payment_attempts, 0);

    let invoice = env.store.invoice(invoice_id).unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(invoice.number, "INV-2025-000001");
    assert_eq!(invoice.total, dec!(30.00));
    assert_eq!(invoice.period_start, Some(sub.current_period_end));

    let payment = env.store.payment(payment_id).unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert!(payment.gateway_txn_id.is_some());

    let history = env.engine.history.state_changes(tenant, sub.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reason, "successful_renewal");
}

#[tokio::test]
async fn renewal_is_idempotent_within_a_cycle() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);

    let first = env
        .engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    assert!(matches!(first, RenewalOutcome::Renewed { .. }));

    let second = env
        .engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    let RenewalOutcome::NotDue { next_billing_date } = second else {
        panic!("expected NotDue, got {second:?}");
    };
    assert_eq!(
        next_billing_date,
        Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap()
    );

    // Exactly one invoice for the cycle.
    let invoices = env.engine.history.invoices(tenant, sub.id).await.unwrap();
    assert_eq!(invoices.len(), 1);
}

#[tokio::test]
async fn renewal_before_billing_date_is_not_due() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);
    env.clock.set(Utc.with_ymd_and_hms(2025, 5, 20, 0, 0, 0).unwrap());

    let outcome = env
        .engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    assert!(matches!(outcome, RenewalOutcome::NotDue { .. }));
    assert!(env.engine.history.invoices(tenant, sub.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn month_end_renewal_clamps_to_shorter_month() {
    let env = TestEnv::new();
    let tenant = Uuid::new_v4();
    let plan = fixtures::monthly_plan(tenant);
    let mut sub = fixtures::subscription_on_plan(tenant, &plan);
    sub.current_period_start = Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap();
    sub.current_period_end = Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap();
    sub.next_billing_date = sub.current_period_end;
    env.store.put_plan(plan);
    env.store.put_subscription(sub.clone());
    env.clock.set(Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap());

    let outcome = env
        .engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();

    let RenewalOutcome::Renewed {
        next_billing_date, ..
    } = outcome
    else {
        panic!("expected Renewed, got {outcome:?}");
    };
    // Jan 31 + 1 month clamps to Feb 28 rather than spilling into March.
    assert_eq!(
        next_billing_date,
        Utc.with_ymd_and_hms(2025, 2, 28, 0, 0, 0).unwrap()
    );
}

#[tokio::test]
async fn failed_charge_leaves_period_intact_and_reuses_invoice() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);
    env.gateway.push_confirm_outcome(MockOutcome::Decline {
        code: "card_declined".to_string(),
        message: "insufficient funds".to_string(),
    });

    let result = env.engine.renewals.process_renewal(sub.id, tenant).await;
    assert!(matches!(result, Err(BillingError::GatewayDeclined { .. })));

    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);
    assert_eq!(current.current_period_end, sub.current_period_end);
    assert_eq!(current.next_billing_date, sub.next_billing_date);
    assert_eq!(current.failed_payment_attempts, 1);

    let invoices = env.engine.history.invoices(tenant, sub.id).await.unwrap();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].status, InvoiceStatus::Pending);

    // Retry succeeds and pays the same invoice instead of minting another.
    let outcome = env
        .engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    let RenewalOutcome::Renewed { invoice_id, .. } = outcome else {
        panic!("expected Renewed, got {outcome:?}");
    };
    assert_eq!(invoice_id, invoices[0].id);

    let invoices = env.engine.history.invoices(tenant, sub.id).await.unwrap();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].status, InvoiceStatus::Paid);

    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.failed_payment_attempts, 0);
}

#[tokio::test]
async fn missing_payment_method_counts_as_failed_attempt() {
    let env = TestEnv::new();
    let tenant = Uuid::new_v4();
    let plan = fixtures::monthly_plan(tenant);
    let mut sub = fixtures::subscription_on_plan(tenant, &plan);
    sub.payment_method = None;
    env.store.put_plan(plan);
    env.store.put_subscription(sub.clone());

    let result = env.engine.renewals.process_renewal(sub.id, tenant).await;
    assert!(matches!(result, Err(BillingError::NoPaymentMethod)));

    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.failed_payment_attempts, 1);
    // The open invoice stays for the eventual retry.
    let invoices = env.engine.history.invoices(tenant, sub.id).await.unwrap();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].status, InvoiceStatus::Pending);
}

#[tokio::test]
async fn transient_gateway_error_is_retryable_and_counted() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);
    env.gateway
        .push_confirm_outcome(MockOutcome::Transient("connection reset".to_string()));

    let result = env.engine.renewals.process_renewal(sub.id, tenant).await;
    let Err(err) = result else {
        panic!("expected transient failure");
    };
    assert!(err.is_retryable());

    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.failed_payment_attempts, 1);
}

#[tokio::test]
async fn trial_conversion_records_dedicated_reason() {
    let env = TestEnv::new();
    let tenant = Uuid::new_v4();
    let plan = fixtures::monthly_plan(tenant);
    let mut sub = fixtures::subscription_on_plan(tenant, &plan);
    sub.status = SubscriptionStatus::Trialing;
    sub.trial_start = Some(sub.current_period_start);
    sub.trial_end = Some(sub.current_period_end);
    env.store.put_plan(plan);
    env.store.put_subscription(sub.clone());

    let outcome = env
        .engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    assert!(matches!(outcome, RenewalOutcome::Renewed { .. }));

    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);

    let history = env.engine.history.state_changes(tenant, sub.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reason, "trial_converted");
    assert_eq!(history[0].from_status, SubscriptionStatus::Trialing);
}

// --- dunning escalation and recovery ---------------------------------------

#[tokio::test]
async fn three_failures_escalate_then_payment_recovers() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);
    for _ in 0..3 {
        env.gateway.push_confirm_outcome(MockOutcome::Decline {
            code: "card_declined".to_string(),
            message: "insufficient funds".to_string(),
        });
    }

    for _ in 0..3 {
        let result = env.engine.renewals.process_renewal(sub.id, tenant).await;
        assert!(result.is_err());
    }

    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::PastDue);
    assert_eq!(current.failed_payment_attempts, 3);

    // Past-due subscriptions stay billable; a later successful charge
    // recovers them.
    let outcome = env
        .engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    assert!(matches!(outcome, RenewalOutcome::Renewed { .. }));

    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);
    assert_eq!(current.failed_payment_attempts, 0);

    let reasons: Vec<String> = env
        .engine
        .history
        .state_changes(tenant, sub.id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.reason.clone())
        .collect();
    assert!(reasons.iter().any(|r| r == "max_payment_attempts_reached"));
    assert_eq!(reasons.last().map(String::as_str), Some("payment_recovered"));
}

// --- cancellation -----------------------------------------------------------

#[tokio::test]
async fn period_end_cancellation_serves_until_expiry() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);
    env.clock.set(Utc.with_ymd_and_hms(2025, 5, 15, 0, 0, 0).unwrap());

    let outcome = env
        .engine
        .cancellations
        .cancel(sub.id, tenant, period_end_cancel("switching providers"))
        .await
        .unwrap();
    assert_eq!(outcome.cancelled_at, None);
    assert_eq!(outcome.effective_at, sub.current_period_end);
    assert_eq!(outcome.refund_amount, None);

    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::PendingCancellation);
    assert!(current.cancel_at_period_end);

    // The renewal scan expires it at period end instead of charging.
    env.clock.set(sub.current_period_end);
    let outcome = env
        .engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    assert!(matches!(outcome, RenewalOutcome::NotDue { .. }));

    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Cancelled);
    assert_eq!(current.cancelled_at, Some(sub.current_period_end));
    assert!(env.engine.history.invoices(tenant, sub.id).await.unwrap().is_empty());

    // Reason codes stay machine-readable; the caller's text lands in
    // metadata.
    let history = env.engine.history.state_changes(tenant, sub.id).await.unwrap();
    let reasons: Vec<&str> = history.iter().map(|c| c.reason.as_str()).collect();
    assert_eq!(reasons, ["cancellation_requested", "period_end_expiry"]);
    assert_eq!(history[0].metadata["note"], "switching providers");
}

#[tokio::test]
async fn cancelling_twice_is_rejected() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);

    env.engine
        .cancellations
        .cancel(sub.id, tenant, immediate_cancel("abuse", false))
        .await
        .unwrap();

    let again = env
        .engine
        .cancellations
        .cancel(sub.id, tenant, immediate_cancel("abuse", false))
        .await;
    assert!(matches!(again, Err(BillingError::AlreadyCancelled)));

    // Renewals refuse terminal subscriptions too.
    let renewal = env.engine.renewals.process_renewal(sub.id, tenant).await;
    assert!(matches!(renewal, Err(BillingError::AlreadyCancelled)));
}

#[tokio::test]
async fn immediate_cancellation_refunds_unused_time() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);

    // Pay for June, then cancel 10 days in: 20 of 30 days unused.
    env.engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    env.clock.set(Utc.with_ymd_and_hms(2025, 6, 11, 0, 0, 0).unwrap());

    let outcome = env
        .engine
        .cancellations
        .cancel(sub.id, tenant, immediate_cancel("downgrading", true))
        .await
        .unwrap();
    assert_eq!(outcome.refund_amount, Some(dec!(20.00)));
    assert!(outcome.refund_id.is_some());
    assert!(!outcome.refund_pending_manual);

    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Cancelled);
    assert_eq!(current.cancelled_at, Some(env.clock.now()));

    let payments = env.engine.history.payments(tenant, sub.id).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::PartiallyRefunded);
    assert_eq!(payments[0].refunded_amount, dec!(20.00));

    let refunds = env.store.refund_records(tenant);
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].status, RefundStatus::Completed);
    assert_eq!(refunds[0].amount, dec!(20.00));
}

#[tokio::test]
async fn fully_consumed_period_cancels_without_refund() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);

    // Pay for June, then cancel at the very end of the period: zero unused
    // time, so the cancellation proceeds with no refund.
    env.engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    env.clock.set(Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap());

    let outcome = env
        .engine
        .cancellations
        .cancel(sub.id, tenant, immediate_cancel("project ended", true))
        .await
        .unwrap();
    assert_eq!(outcome.refund_amount, None);
    assert_eq!(outcome.refund_id, None);
    assert!(!outcome.refund_pending_manual);

    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Cancelled);

    assert!(env.store.refund_records(tenant).is_empty());
    let payments = env.engine.history.payments(tenant, sub.id).await.unwrap();
    assert_eq!(payments[0].status, PaymentStatus::Completed);
    assert_eq!(payments[0].refunded_amount, dec!(0));
}

#[tokio::test]
async fn refund_goes_through_the_gateway_that_captured_the_charge() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);

    // Two tenant gateways: the higher-priority one only handles one-off
    // charges, so the renewal is captured by the second.
    env.gateways.register(
        tenant,
        Arc::new(MockGateway::new(MockGatewayConfig {
            name: "wallet".to_string(),
            currencies: vec!["USD".to_string()],
            recurring: false,
        })),
    );
    env.gateways.register(
        tenant,
        Arc::new(MockGateway::new(MockGatewayConfig {
            name: "cards".to_string(),
            currencies: vec!["USD".to_string()],
            recurring: true,
        })),
    );

    env.engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    let payments = env.engine.history.payments(tenant, sub.id).await.unwrap();
    assert_eq!(payments[0].gateway, "cards");

    env.clock.set(Utc.with_ymd_and_hms(2025, 6, 11, 0, 0, 0).unwrap());
    let outcome = env
        .engine
        .cancellations
        .cancel(sub.id, tenant, immediate_cancel("downgrading", true))
        .await
        .unwrap();

    // The mock prefixes refund ids with its name, so this proves which
    // gateway executed the refund.
    assert_eq!(outcome.refund_amount, Some(dec!(20.00)));
    assert!(outcome.refund_id.unwrap().starts_with("cards_re_"));
}

#[tokio::test]
async fn failed_gateway_refund_degrades_to_manual_tracking() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);

    env.engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    env.clock.set(Utc.with_ymd_and_hms(2025, 6, 11, 0, 0, 0).unwrap());
    env.gateway
        .push_refund_outcome(MockOutcome::Transient("processor unavailable".to_string()));

    let outcome = env
        .engine
        .cancellations
        .cancel(sub.id, tenant, immediate_cancel("downgrading", true))
        .await
        .unwrap();
    // Cancellation proceeds; the refund is parked for manual settlement.
    assert!(outcome.refund_pending_manual);
    assert_eq!(outcome.refund_amount, Some(dec!(20.00)));
    assert_eq!(outcome.refund_id, None);

    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Cancelled);

    let payments = env.engine.history.payments(tenant, sub.id).await.unwrap();
    assert_eq!(payments[0].status, PaymentStatus::Completed);
    assert_eq!(payments[0].refunded_amount, dec!(0));

    let refunds = env.store.refund_records(tenant);
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].status, RefundStatus::PendingManual);
    assert!(refunds[0].error_message.is_some());
}

#[tokio::test]
async fn refund_exceeding_payment_is_rejected() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);

    env.engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    let payments = env.engine.history.payments(tenant, sub.id).await.unwrap();
    let payment = &payments[0];

    let result = env
        .engine
        .cancellations
        .execute_refund(tenant, payment, dec!(50.00), "overcharge", env.clock.now())
        .await;
    let Err(BillingError::RefundExceedsPayment {
        requested,
        refundable,
    }) = result
    else {
        panic!("expected RefundExceedsPayment");
    };
    assert_eq!(requested, dec!(50.00));
    assert_eq!(refundable, dec!(30.00));

    // Nothing was sent to the gateway or recorded.
    assert!(env.store.refund_records(tenant).is_empty());
    let payments = env.engine.history.payments(tenant, sub.id).await.unwrap();
    assert_eq!(payments[0].refunded_amount, dec!(0));
}

#[tokio::test]
async fn refund_bound_shrinks_after_partial_refund() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);

    env.engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    let payments = env.engine.history.payments(tenant, sub.id).await.unwrap();

    env.engine
        .cancellations
        .execute_refund(tenant, &payments[0], dec!(20.00), "goodwill", env.clock.now())
        .await
        .unwrap();

    // Only 10.00 remains refundable; re-read the payment for the new bound.
    let payments = env.engine.history.payments(tenant, sub.id).await.unwrap();
    assert_eq!(payments[0].status, PaymentStatus::PartiallyRefunded);
    let result = env
        .engine
        .cancellations
        .execute_refund(tenant, &payments[0], dec!(15.00), "goodwill", env.clock.now())
        .await;
    assert!(matches!(
        result,
        Err(BillingError::RefundExceedsPayment { .. })
    ));

    env.engine
        .cancellations
        .execute_refund(tenant, &payments[0], dec!(10.00), "goodwill", env.clock.now())
        .await
        .unwrap();
    let payments = env.engine.history.payments(tenant, sub.id).await.unwrap();
    assert_eq!(payments[0].status, PaymentStatus::Refunded);
    assert_eq!(payments[0].refunded_amount, dec!(30.00));
}

#[tokio::test]
async fn refund_without_completed_payment_is_rejected() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);

    let result = env
        .engine
        .cancellations
        .cancel(sub.id, tenant, immediate_cancel("mistake", true))
        .await;
    assert!(matches!(result, Err(BillingError::RefundSourceMissing)));

    // The failed refund aborts the cancellation entirely.
    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);
}

// --- pause / resume ---------------------------------------------------------

#[tokio::test]
async fn paused_subscriptions_skip_renewal_and_resume_on_schedule() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);
    env.clock.set(Utc.with_ymd_and_hms(2025, 5, 15, 0, 0, 0).unwrap());

    env.engine
        .cancellations
        .pause(sub.id, tenant, ChangeActor::System)
        .await
        .unwrap();
    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Paused);

    // Past the billing date, the due scan skips it and a direct renewal
    // reports not-due.
    env.clock.set(Utc.with_ymd_and_hms(2025, 6, 5, 0, 0, 0).unwrap());
    let due = env.store.due_subscriptions(env.clock.now(), 100).await.unwrap();
    assert!(due.iter().all(|s| s.id != sub.id));
    let outcome = env
        .engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    assert!(matches!(outcome, RenewalOutcome::NotDue { .. }));

    // Resume keeps the original schedule, so the renewal is due immediately.
    env.engine
        .cancellations
        .resume(sub.id, tenant, ChangeActor::System)
        .await
        .unwrap();
    let current = env.store.subscription(tenant, sub.id).await.unwrap().unwrap();
    assert_eq!(current.status, SubscriptionStatus::Active);
    assert_eq!(current.next_billing_date, sub.next_billing_date);

    let outcome = env
        .engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    assert!(matches!(outcome, RenewalOutcome::Renewed { .. }));
}

#[tokio::test]
async fn resuming_a_subscription_that_is_not_paused_is_rejected() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);

    let result = env
        .engine
        .cancellations
        .resume(sub.id, tenant, ChangeActor::System)
        .await;
    assert!(matches!(
        result,
        Err(BillingError::InvalidTransition { .. })
    ));

    // No spurious resume entry in the audit trail.
    let history = env.engine.history.state_changes(tenant, sub.id).await.unwrap();
    assert!(history.is_empty());
}

#[tokio::test]
async fn past_due_subscriptions_cannot_pause() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);
    for attempt in 1..=3 {
        env.engine
            .dunning
            .handle_failed_payment(sub.id, attempt, tenant)
            .await
            .unwrap();
    }

    let result = env
        .engine
        .cancellations
        .pause(sub.id, tenant, ChangeActor::System)
        .await;
    assert!(matches!(
        result,
        Err(BillingError::InvalidTransition { .. })
    ));
}

// --- overdue sweep ----------------------------------------------------------

#[tokio::test]
async fn pending_invoices_past_due_date_flip_to_overdue() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);
    env.gateway.push_confirm_outcome(MockOutcome::Decline {
        code: "card_declined".to_string(),
        message: "insufficient funds".to_string(),
    });
    let _ = env.engine.renewals.process_renewal(sub.id, tenant).await;

    // Nothing is overdue at the due date itself.
    let flipped = env.store.mark_overdue_invoices(env.clock.now()).await.unwrap();
    assert!(flipped.is_empty());

    env.clock.set(Utc.with_ymd_and_hms(2025, 6, 4, 0, 0, 0).unwrap());
    let flipped = env.store.mark_overdue_invoices(env.clock.now()).await.unwrap();
    assert_eq!(flipped.len(), 1);
    assert_eq!(flipped[0].status, InvoiceStatus::Overdue);

    // An overdue invoice is still open, so a recovering renewal reuses it.
    let outcome = env
        .engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    let RenewalOutcome::Renewed { invoice_id, .. } = outcome else {
        panic!("expected Renewed, got {outcome:?}");
    };
    assert_eq!(invoice_id, flipped[0].id);
}

// --- audit ordering ---------------------------------------------------------

#[tokio::test]
async fn audit_trail_preserves_chronological_order() {
    let env = TestEnv::new();
    let (tenant, sub) = fixtures::active_subscription(&env);

    env.engine
        .renewals
        .process_renewal(sub.id, tenant)
        .await
        .unwrap();
    env.clock.set(Utc.with_ymd_and_hms(2025, 6, 20, 0, 0, 0).unwrap());
    env.engine
        .cancellations
        .cancel(sub.id, tenant, period_end_cancel("seasonal"))
        .await
        .unwrap();

    let history = env.engine.history.state_changes(tenant, sub.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].created_at <= history[1].created_at);
    assert_eq!(history[0].reason, "successful_renewal");
    assert_eq!(history[1].reason, "cancellation_requested");
    assert_eq!(
        history[1].metadata["effective_at"],
        serde_json::json!(Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap())
    );
}
