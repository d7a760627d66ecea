//! Cancellation and refund service.
//!
//! Period-end cancellation parks the subscription in `pending_cancellation`
//! until the renewal scan expires it; immediate cancellation can refund the
//! unused portion of the current period against the most recent completed
//! payment. A gateway refund failure degrades to a manual-tracking record
//! instead of losing the request.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hostara_shared::{
    ChangeActor, PaymentStatus, RefundRecord, RefundStatus, Subscription, SubscriptionStatus,
};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::audit::{AuditTrail, NewStateChange};
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::gateway::GatewayRegistry;
use crate::proration::unused_time_credit;
use crate::state::{ensure_transition, TransitionReason};
use crate::store::BillingStore;

/// Options for a cancellation request.
#[derive(Debug, Clone)]
pub struct CancelOptions {
    /// Keep serving until period end instead of cancelling now.
    pub cancel_at_period_end: bool,
    /// Caller-supplied reason, recorded on the subscription and audit trail.
    pub reason: String,
    /// For immediate cancellation: refund the unused portion of the period.
    pub refund_unused_time: bool,
    pub actor: ChangeActor,
}

/// What a cancellation did.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    /// Set for immediate cancellation; `None` while pending at period end.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// When service actually stops.
    pub effective_at: DateTime<Utc>,
    pub refund_amount: Option<Decimal>,
    pub refund_id: Option<String>,
    /// True when the gateway refund failed and the amount is tracked for
    /// manual settlement.
    pub refund_pending_manual: bool,
}

#[derive(Clone)]
pub struct CancellationService {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    gateways: Arc<GatewayRegistry>,
    audit: AuditTrail,
}

impl CancellationService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        gateways: Arc<GatewayRegistry>,
    ) -> Self {
        let audit = AuditTrail::new(store.clone());
        Self {
            store,
            clock,
            gateways,
            audit,
        }
    }

    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        tenant_id: Uuid,
        options: CancelOptions,
    ) -> BillingResult<CancelOutcome> {
        let now = self.clock.now();
        let sub = self
            .store
            .subscription(tenant_id, subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))?;

        if sub.status == SubscriptionStatus::Cancelled {
            return Err(BillingError::AlreadyCancelled);
        }

        if options.cancel_at_period_end {
            self.cancel_at_period_end(&sub, &options, now).await
        } else {
            self.cancel_immediately(&sub, &options, now).await
        }
    }

    async fn cancel_at_period_end(
        &self,
        sub: &Subscription,
        options: &CancelOptions,
        now: DateTime<Utc>,
    ) -> BillingResult<CancelOutcome> {
        ensure_transition(sub.status, SubscriptionStatus::PendingCancellation)?;

        self.store
            .set_cancellation(sub.tenant_id, sub.id, true, &options.reason, None)
            .await?;
        let moved = self
            .store
            .transition_subscription(
                sub.tenant_id,
                sub.id,
                sub.status,
                SubscriptionStatus::PendingCancellation,
                now,
            )
            .await?;
        if !moved {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} changed status during cancellation",
                sub.id
            )));
        }

        self.audit
            .record(
                NewStateChange::new(
                    sub.tenant_id,
                    sub.id,
                    sub.status,
                    SubscriptionStatus::PendingCancellation,
                    TransitionReason::CancellationRequested,
                )
                .actor(options.actor)
                .metadata(serde_json::json!({
                    "note": options.reason,
                    "effective_at": sub.current_period_end,
                })),
                now,
            )
            .await;

        tracing::info!(
            subscription_id = %sub.id,
            effective_at = %sub.current_period_end,
            "Cancellation scheduled for period end"
        );

        Ok(CancelOutcome {
            cancelled_at: None,
            effective_at: sub.current_period_end,
            refund_amount: None,
            refund_id: None,
            refund_pending_manual: false,
        })
    }

    async fn cancel_immediately(
        &self,
        sub: &Subscription,
        options: &CancelOptions,
        now: DateTime<Utc>,
    ) -> BillingResult<CancelOutcome> {
        ensure_transition(sub.status, SubscriptionStatus::Cancelled)?;

        let refund = if options.refund_unused_time {
            self.refund_unused_time(sub, &options.reason, now).await?
        } else {
            None
        };

        let moved = self
            .store
            .transition_subscription(
                sub.tenant_id,
                sub.id,
                sub.status,
                SubscriptionStatus::Cancelled,
                now,
            )
            .await?;
        if !moved {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} changed status during cancellation",
                sub.id
            )));
        }
        self.store
            .set_cancellation(sub.tenant_id, sub.id, false, &options.reason, Some(now))
            .await?;

        let (refund_amount, refund_id, pending_manual) = match &refund {
            Some(r) => (
                Some(r.amount),
                r.gateway_refund_id.clone(),
                r.status == RefundStatus::PendingManual,
            ),
            None => (None, None, false),
        };

        self.audit
            .record(
                NewStateChange::new(
                    sub.tenant_id,
                    sub.id,
                    sub.status,
                    SubscriptionStatus::Cancelled,
                    TransitionReason::ImmediateCancellation,
                )
                .actor(options.actor)
                .metadata(serde_json::json!({
                    "note": options.reason,
                    "refund_amount": refund_amount,
                    "refund_pending_manual": pending_manual,
                })),
                now,
            )
            .await;

        tracing::info!(
            subscription_id = %sub.id,
            refund_amount = ?refund_amount,
            "Subscription cancelled immediately"
        );

        Ok(CancelOutcome {
            cancelled_at: Some(now),
            effective_at: now,
            refund_amount,
            refund_id,
            refund_pending_manual: pending_manual,
        })
    }

    /// Compute and execute the unused-time refund for an immediate
    /// cancellation. Returns `None` when the period is fully consumed and
    /// there is nothing left to credit.
    async fn refund_unused_time(
        &self,
        sub: &Subscription,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<RefundRecord>> {
        let payment = self
            .store
            .latest_completed_payment(sub.tenant_id, sub.id)
            .await?
            .ok_or(BillingError::RefundSourceMissing)?;

        let price = sub.price_override.unwrap_or(payment.amount);
        let credit = unused_time_credit(
            sub.current_period_start,
            sub.current_period_end,
            now,
            price,
        );
        if credit <= Decimal::ZERO {
            return Ok(None);
        }

        self.execute_refund(sub.tenant_id, &payment, credit, reason, now)
            .await
            .map(Some)
    }

    /// Refund `amount` against a specific payment, enforcing the refund
    /// bound. Falls back to a `pending_manual` record on gateway failure.
    pub async fn execute_refund(
        &self,
        tenant_id: Uuid,
        payment: &hostara_shared::Payment,
        amount: Decimal,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<RefundRecord> {
        if amount > payment.refundable() {
            return Err(BillingError::RefundExceedsPayment {
                requested: amount,
                refundable: payment.refundable(),
            });
        }
        let txn_id = payment
            .gateway_txn_id
            .as_deref()
            .ok_or(BillingError::RefundSourceMissing)?;

        // Refunds must go back through the processor that captured the
        // charge, not whichever gateway currently wins selection.
        let gateway = self.gateways.by_name(tenant_id, &payment.gateway)?;

        let mut record = RefundRecord {
            id: Uuid::new_v4(),
            tenant_id,
            payment_id: payment.id,
            amount,
            reason: reason.to_string(),
            status: RefundStatus::Completed,
            gateway_refund_id: None,
            error_message: None,
            created_at: now,
        };

        match gateway.refund(txn_id, amount, reason).await {
            Ok(refund) => {
                record.gateway_refund_id = Some(refund.refund_id);

                let refunded_total = payment.refunded_amount + amount;
                let status = if refunded_total >= payment.amount {
                    PaymentStatus::Refunded
                } else {
                    PaymentStatus::PartiallyRefunded
                };
                self.store
                    .apply_refund(tenant_id, payment.id, refunded_total, status)
                    .await?;

                tracing::info!(
                    payment_id = %payment.id,
                    amount = %amount,
                    "Refund issued"
                );
            }
            Err(e) => {
                // Keep the request alive for manual settlement rather than
                // dropping it.
                record.status = RefundStatus::PendingManual;
                record.error_message = Some(e.to_string());

                tracing::error!(
                    payment_id = %payment.id,
                    amount = %amount,
                    error = %e,
                    "Gateway refund failed; tracking for manual settlement"
                );
            }
        }

        self.store.insert_refund_record(&record).await?;
        Ok(record)
    }

    /// Pause an active subscription. Paused subscriptions are skipped by the
    /// due-renewal scan; resuming restores the existing billing schedule.
    pub async fn pause(
        &self,
        subscription_id: Uuid,
        tenant_id: Uuid,
        actor: ChangeActor,
    ) -> BillingResult<()> {
        self.toggle_pause(
            subscription_id,
            tenant_id,
            actor,
            SubscriptionStatus::Active,
            SubscriptionStatus::Paused,
            TransitionReason::SubscriptionPaused,
        )
        .await
    }

    /// Resume a paused subscription.
    pub async fn resume(
        &self,
        subscription_id: Uuid,
        tenant_id: Uuid,
        actor: ChangeActor,
    ) -> BillingResult<()> {
        self.toggle_pause(
            subscription_id,
            tenant_id,
            actor,
            SubscriptionStatus::Paused,
            SubscriptionStatus::Active,
            TransitionReason::SubscriptionResumed,
        )
        .await
    }

    async fn toggle_pause(
        &self,
        subscription_id: Uuid,
        tenant_id: Uuid,
        actor: ChangeActor,
        expected_from: SubscriptionStatus,
        to: SubscriptionStatus,
        reason: TransitionReason,
    ) -> BillingResult<()> {
        let now = self.clock.now();
        let sub = self
            .store
            .subscription(tenant_id, subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))?;

        if sub.status == SubscriptionStatus::Cancelled {
            return Err(BillingError::AlreadyCancelled);
        }
        // Pause only applies to active subscriptions, resume only to paused
        // ones. Without this check a resume on an active subscription would
        // slip through as a legal Active -> Active self-transition.
        if sub.status != expected_from {
            return Err(BillingError::InvalidTransition {
                from: sub.status,
                to,
            });
        }

        let moved = self
            .store
            .transition_subscription(tenant_id, subscription_id, sub.status, to, now)
            .await?;
        if !moved {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {subscription_id} changed status concurrently"
            )));
        }

        self.audit
            .record(
                NewStateChange::new(tenant_id, subscription_id, sub.status, to, reason)
                    .actor(actor),
                now,
            )
            .await;

        Ok(())
    }
}
