//! Append-only subscription state-change records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::subscription::SubscriptionStatus;

/// Who drove a lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeActor {
    /// The billing engine itself (renewal, dunning escalation).
    System,
    /// A client or admin user.
    User(Uuid),
}

impl ChangeActor {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            ChangeActor::System => None,
            ChangeActor::User(id) => Some(*id),
        }
    }
}

/// Immutable audit record for one lifecycle transition.
///
/// Written in the same logical operation that changes the subscription row;
/// never mutated or deleted afterwards.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionStateChange {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub from_status: SubscriptionStatus,
    pub to_status: SubscriptionStatus,
    pub reason: String,
    pub metadata: serde_json::Value,
    /// NULL for system-initiated transitions.
    pub actor_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
