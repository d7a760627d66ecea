//! State-change audit trail.
//!
//! Modeled as an append-only event log. Audit writes are best-effort: a
//! failed insert is logged and swallowed so it can never roll back or fail a
//! completed financial operation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hostara_shared::{ChangeActor, SubscriptionStatus};
use uuid::Uuid;

use crate::state::TransitionReason;
use crate::store::BillingStore;

/// A state change about to be appended.
#[derive(Debug, Clone)]
pub struct NewStateChange {
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub from_status: SubscriptionStatus,
    pub to_status: SubscriptionStatus,
    pub reason: String,
    pub metadata: serde_json::Value,
    pub actor: ChangeActor,
}

impl NewStateChange {
    pub fn new(
        tenant_id: Uuid,
        subscription_id: Uuid,
        from_status: SubscriptionStatus,
        to_status: SubscriptionStatus,
        reason: TransitionReason,
    ) -> Self {
        Self {
            tenant_id,
            subscription_id,
            from_status,
            to_status,
            reason: reason.as_str().to_string(),
            metadata: serde_json::Value::Null,
            actor: ChangeActor::System,
        }
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn actor(mut self, actor: ChangeActor) -> Self {
        self.actor = actor;
        self
    }
}

/// Append-only writer over the state-change log.
#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn BillingStore>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Append a record, swallowing storage failures.
    pub async fn record(&self, change: NewStateChange, at: DateTime<Utc>) {
        let sub_id = change.subscription_id;
        let reason = change.reason.clone();
        if let Err(e) = self.store.append_state_change(&change, at).await {
            tracing::warn!(
                subscription_id = %sub_id,
                reason = %reason,
                error = %e,
                "Failed to append state change audit record"
            );
        }
    }
}
