//! Renewal orchestrator.
//!
//! Drives one subscription through a billing-cycle renewal: due check, lease,
//! invoice, charge, period advance, audit. Safe to invoke repeatedly — a
//! subscription already renewed in the current cycle comes back `NotDue`, and
//! a failed charge leaves the prior period fully intact.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hostara_shared::{
    Invoice, InvoiceKind, InvoiceStatus, Payment, PaymentStatus, Plan, Subscription,
    SubscriptionStatus,
};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::audit::{AuditTrail, NewStateChange};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::dunning::DunningManager;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayError, GatewayRegistry};
use crate::notify::BillingNotifier;
use crate::numbering::InvoiceNumbering;
use crate::state::TransitionReason;
use crate::store::BillingStore;

/// Outcome of a renewal attempt that did not error.
#[derive(Debug, Clone)]
pub enum RenewalOutcome {
    /// Renewal is not due yet (or was already processed this cycle).
    NotDue { next_billing_date: DateTime<Utc> },
    /// Another worker currently holds the renewal lease.
    InProgress,
    /// Payment collected and the billing period advanced.
    Renewed {
        invoice_id: Uuid,
        payment_id: Uuid,
        next_billing_date: DateTime<Utc>,
    },
}

#[derive(Clone)]
pub struct RenewalOrchestrator {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    gateways: Arc<GatewayRegistry>,
    notifier: Arc<dyn BillingNotifier>,
    numbering: InvoiceNumbering,
    dunning: DunningManager,
    audit: AuditTrail,
    config: EngineConfig,
}

impl RenewalOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        gateways: Arc<GatewayRegistry>,
        notifier: Arc<dyn BillingNotifier>,
        numbering: InvoiceNumbering,
        dunning: DunningManager,
        config: EngineConfig,
    ) -> Self {
        let audit = AuditTrail::new(store.clone());
        Self {
            store,
            clock,
            gateways,
            notifier,
            numbering,
            dunning,
            audit,
            config,
        }
    }

    /// Process a due renewal for one subscription.
    pub async fn process_renewal(
        &self,
        subscription_id: Uuid,
        tenant_id: Uuid,
    ) -> BillingResult<RenewalOutcome> {
        let now = self.clock.now();
        let sub = self
            .store
            .subscription(tenant_id, subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))?;

        if sub.status == SubscriptionStatus::Cancelled {
            return Err(BillingError::AlreadyCancelled);
        }
        if !sub.is_renewal_due(now) {
            return Ok(RenewalOutcome::NotDue {
                next_billing_date: sub.next_billing_date,
            });
        }

        // Pending cancellations expire at period end instead of renewing.
        if sub.cancel_at_period_end {
            return self.expire_pending_cancellation(&sub, now).await;
        }

        let claimed = self
            .store
            .claim_renewal(tenant_id, subscription_id, now, self.config.renewal_lock_ttl)
            .await?;
        if !claimed {
            tracing::debug!(
                subscription_id = %subscription_id,
                "Renewal lease held by another worker"
            );
            return Ok(RenewalOutcome::InProgress);
        }

        let result = self.renew_locked(tenant_id, subscription_id, now).await;

        if let Err(e) = self.store.release_renewal(tenant_id, subscription_id).await {
            tracing::warn!(
                subscription_id = %subscription_id,
                error = %e,
                "Failed to release renewal lease (will expire by TTL)"
            );
        }

        result
    }

    /// Body of the renewal while the per-subscription lease is held.
    async fn renew_locked(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<RenewalOutcome> {
        // Re-read under the lease; another worker may have just advanced the
        // period.
        let sub = self
            .store
            .subscription(tenant_id, subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))?;
        if !sub.is_renewal_due(now) {
            return Ok(RenewalOutcome::NotDue {
                next_billing_date: sub.next_billing_date,
            });
        }

        let plan = self
            .store
            .plan(tenant_id, sub.plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", sub.plan_id)))?;

        let invoice = self.open_or_create_invoice(&sub, &plan, now).await?;

        match self.collect_payment(&sub, &plan, &invoice, now).await {
            Ok(payment) => {
                self.store
                    .mark_invoice_paid(tenant_id, invoice.id, now)
                    .await?;

                let new_start = sub.current_period_end;
                let new_end = plan.interval.advance(new_start);
                let advanced = self
                    .store
                    .advance_billing_period(
                        tenant_id,
                        subscription_id,
                        sub.next_billing_date,
                        new_start,
                        new_end,
                        new_end,
                        now,
                    )
                    .await?;
                if !advanced {
                    // Payment exists and is reconcilable via the gateway txn
                    // id; the period was advanced concurrently.
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        payment_id = %payment.id,
                        "Billing period advanced concurrently after successful charge"
                    );
                }

                let reason = if sub.status == SubscriptionStatus::Trialing {
                    TransitionReason::TrialConverted
                } else if sub.status == SubscriptionStatus::PastDue {
                    TransitionReason::PaymentRecovered
                } else {
                    TransitionReason::SuccessfulRenewal
                };
                self.audit
                    .record(
                        NewStateChange::new(
                            tenant_id,
                            subscription_id,
                            sub.status,
                            SubscriptionStatus::Active,
                            reason,
                        )
                        .metadata(serde_json::json!({
                            "invoice_id": invoice.id,
                            "payment_id": payment.id,
                            "period_start": new_start,
                            "period_end": new_end,
                        })),
                        now,
                    )
                    .await;

                self.notifier.invoice_paid(&invoice).await;

                tracing::info!(
                    subscription_id = %subscription_id,
                    invoice = %invoice.number,
                    next_billing_date = %new_end,
                    "Renewal succeeded"
                );

                Ok(RenewalOutcome::Renewed {
                    invoice_id: invoice.id,
                    payment_id: payment.id,
                    next_billing_date: new_end,
                })
            }
            Err(err) => {
                // Storage errors are not charge failures and must not feed
                // the dunning counter.
                if !err.counts_as_payment_failure() {
                    return Err(err);
                }

                let attempt = sub.failed_payment_attempts + 1;
                self.dunning
                    .handle_failed_payment(subscription_id, attempt, tenant_id)
                    .await?;

                self.audit
                    .record(
                        NewStateChange::new(
                            tenant_id,
                            subscription_id,
                            sub.status,
                            sub.status,
                            TransitionReason::RenewalFailed,
                        )
                        .metadata(serde_json::json!({
                            "invoice_id": invoice.id,
                            "attempt": attempt,
                            "error": err.to_string(),
                            "retryable": err.is_retryable(),
                        })),
                        now,
                    )
                    .await;

                self.notifier
                    .payment_failed(&sub, attempt, &err.to_string())
                    .await;

                tracing::warn!(
                    subscription_id = %subscription_id,
                    invoice = %invoice.number,
                    attempt = attempt,
                    error = %err,
                    "Renewal payment failed"
                );

                Err(err)
            }
        }
    }

    /// Reuse the open invoice from a previous failed attempt for this period,
    /// or mint a new one.
    async fn open_or_create_invoice(
        &self,
        sub: &Subscription,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> BillingResult<Invoice> {
        let period_start = sub.current_period_end;

        if let Some(existing) = self
            .store
            .open_invoice_for_period(sub.tenant_id, sub.id, period_start)
            .await?
        {
            return Ok(existing);
        }

        let price = sub.price_override.unwrap_or(plan.price);
        let invoice = Invoice {
            id: Uuid::new_v4(),
            tenant_id: sub.tenant_id,
            subscription_id: Some(sub.id),
            number: self.numbering.next_number(sub.tenant_id).await?,
            subtotal: price,
            // Tax computation is out of scope; invoices carry explicit zero.
            tax: Decimal::ZERO,
            total: price,
            currency: plan.currency.clone(),
            status: InvoiceStatus::Pending,
            kind: InvoiceKind::Recurring,
            period_start: Some(period_start),
            period_end: Some(plan.interval.advance(period_start)),
            due_date: now,
            paid_at: None,
            created_at: now,
        };
        self.store.insert_invoice(&invoice).await?;
        self.notifier.invoice_created(&invoice).await;
        Ok(invoice)
    }

    /// Select a gateway and collect the invoice total.
    async fn collect_payment(
        &self,
        sub: &Subscription,
        plan: &Plan,
        invoice: &Invoice,
        now: DateTime<Utc>,
    ) -> BillingResult<Payment> {
        let payment_method = sub
            .payment_method
            .as_deref()
            .ok_or(BillingError::NoPaymentMethod)?;

        let gateway = self.gateways.select(sub.tenant_id, &plan.currency, true)?;

        let metadata = serde_json::json!({
            "subscription_id": sub.id,
            "invoice_number": invoice.number,
            "tenant_id": sub.tenant_id,
        });

        let charge = async {
            let intent_id = gateway
                .create_payment_intent(
                    invoice.total,
                    &plan.currency,
                    &sub.client_id.to_string(),
                    &metadata,
                )
                .await?;
            gateway.confirm_payment(&intent_id, payment_method).await
        };

        // A timed-out confirmation counts as a failed attempt; the stored
        // gateway txn id (when present) allows later webhook reconciliation.
        let outcome = match tokio::time::timeout(self.config.gateway_timeout, charge).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Transient(format!(
                "gateway {} timed out after {:?}",
                gateway.name(),
                self.config.gateway_timeout
            ))),
        };

        match outcome {
            Ok(charge) => {
                let payment = Payment {
                    id: Uuid::new_v4(),
                    tenant_id: sub.tenant_id,
                    invoice_id: invoice.id,
                    amount: invoice.total,
                    currency: invoice.currency.clone(),
                    status: PaymentStatus::Completed,
                    gateway: gateway.name().to_string(),
                    gateway_txn_id: Some(charge.gateway_txn_id),
                    refunded_amount: Decimal::ZERO,
                    error_code: None,
                    error_message: None,
                    retry_count: sub.failed_payment_attempts,
                    next_retry_at: None,
                    created_at: now,
                };
                self.store.insert_payment(&payment).await?;
                Ok(payment)
            }
            Err(err) => {
                let (code, message) = match &err {
                    GatewayError::Declined { code, message } => {
                        (Some(code.clone()), message.clone())
                    }
                    GatewayError::Transient(msg) => (None, msg.clone()),
                };
                let payment = Payment {
                    id: Uuid::new_v4(),
                    tenant_id: sub.tenant_id,
                    invoice_id: invoice.id,
                    amount: invoice.total,
                    currency: invoice.currency.clone(),
                    status: PaymentStatus::Failed,
                    gateway: gateway.name().to_string(),
                    gateway_txn_id: None,
                    refunded_amount: Decimal::ZERO,
                    error_code: code,
                    error_message: Some(message),
                    retry_count: sub.failed_payment_attempts + 1,
                    next_retry_at: None,
                    created_at: now,
                };
                self.store.insert_payment(&payment).await?;
                Err(err.into())
            }
        }
    }

    /// A `cancel_at_period_end` subscription reaching its period end is
    /// cancelled instead of renewed.
    async fn expire_pending_cancellation(
        &self,
        sub: &Subscription,
        now: DateTime<Utc>,
    ) -> BillingResult<RenewalOutcome> {
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
        if moved {
            self.store
                .set_cancellation(
                    sub.tenant_id,
                    sub.id,
                    true,
                    sub.cancellation_reason.as_deref().unwrap_or("period_end"),
                    Some(now),
                )
                .await?;
            self.audit
                .record(
                    NewStateChange::new(
                        sub.tenant_id,
                        sub.id,
                        sub.status,
                        SubscriptionStatus::Cancelled,
                        TransitionReason::PeriodEndExpiry,
                    ),
                    now,
                )
                .await;

            tracing::info!(
                subscription_id = %sub.id,
                "Pending cancellation expired at period end"
            );
        }

        Ok(RenewalOutcome::NotDue {
            next_billing_date: sub.next_billing_date,
        })
    }
}
