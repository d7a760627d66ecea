//! Dunning manager.
//!
//! Tracks consecutive failed payment attempts and escalates the subscription
//! to `past_due` once the threshold is reached. Scheduling of the next retry
//! is the external scheduler's concern — this manager never sleeps or loops.

use std::sync::Arc;

use uuid::Uuid;

use crate::audit::{AuditTrail, NewStateChange};
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::notify::BillingNotifier;
use crate::state::{can_transition, TransitionReason};
use crate::store::BillingStore;
use hostara_shared::SubscriptionStatus;

#[derive(Clone)]
pub struct DunningManager {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    audit: AuditTrail,
    notifier: Arc<dyn BillingNotifier>,
    max_attempts: i32,
}

impl DunningManager {
    pub fn new(
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn BillingNotifier>,
        max_attempts: i32,
    ) -> Self {
        let audit = AuditTrail::new(store.clone());
        Self {
            store,
            clock,
            audit,
            notifier,
            max_attempts,
        }
    }

    /// Record a failed payment attempt and escalate when the threshold is
    /// reached. Attempts below the threshold only update the counter.
    pub async fn handle_failed_payment(
        &self,
        subscription_id: Uuid,
        attempt_number: i32,
        tenant_id: Uuid,
    ) -> BillingResult<()> {
        let now = self.clock.now();
        let sub = self
            .store
            .subscription(tenant_id, subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))?;

        self.store
            .record_payment_failure(tenant_id, subscription_id, attempt_number, now)
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            attempt = attempt_number,
            status = %sub.status,
            "Recorded failed payment attempt"
        );

        if attempt_number < self.max_attempts {
            return Ok(());
        }
        if !can_transition(sub.status, SubscriptionStatus::PastDue) {
            // Already past_due (or pending cancellation); nothing to escalate.
            return Ok(());
        }

        let moved = self
            .store
            .transition_subscription(
                tenant_id,
                subscription_id,
                sub.status,
                SubscriptionStatus::PastDue,
                now,
            )
            .await?;
        if !moved {
            tracing::warn!(
                subscription_id = %subscription_id,
                "Dunning escalation lost a race; subscription status moved concurrently"
            );
            return Ok(());
        }

        self.audit
            .record(
                NewStateChange::new(
                    tenant_id,
                    subscription_id,
                    sub.status,
                    SubscriptionStatus::PastDue,
                    TransitionReason::MaxPaymentAttemptsReached,
                )
                .metadata(serde_json::json!({ "attempts": attempt_number })),
                now,
            )
            .await;

        self.notifier.subscription_past_due(&sub).await;

        tracing::warn!(
            subscription_id = %subscription_id,
            attempts = attempt_number,
            "Subscription escalated to past_due"
        );

        Ok(())
    }
}
