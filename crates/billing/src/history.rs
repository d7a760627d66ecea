//! Read-side queries over a subscription's billing history.

use std::sync::Arc;

use hostara_shared::{Invoice, Payment, SubscriptionStateChange};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::BillingStore;

#[derive(Clone)]
pub struct BillingHistory {
    store: Arc<dyn BillingStore>,
}

impl BillingHistory {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// State changes in chronological order.
    pub async fn state_changes(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionStateChange>> {
        self.store.state_changes(tenant_id, subscription_id).await
    }

    pub async fn invoices(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Invoice>> {
        self.store
            .invoices_for_subscription(tenant_id, subscription_id)
            .await
    }

    pub async fn payments(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Payment>> {
        self.store
            .payments_for_subscription(tenant_id, subscription_id)
            .await
    }
}
