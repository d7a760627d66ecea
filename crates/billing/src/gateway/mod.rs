//! Payment gateway adapter and selection.
//!
//! One uniform interface regardless of processor. Each tenant configures its
//! own gateways (credentials, priority); selection picks the first configured
//! gateway capable of the charge. Gateway errors are classified up front:
//! network/timeout problems are retryable, explicit declines are terminal for
//! the attempt but still count toward the dunning threshold.

pub mod mock;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub use mock::{MockGateway, MockGatewayConfig, MockOutcome};

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network failure or timeout; the attempt may be retried later.
    #[error("transient gateway error: {0}")]
    Transient(String),
    /// Explicit decline; terminal for this attempt.
    #[error("declined ({code}): {message}")]
    Declined { code: String, message: String },
}

impl From<GatewayError> for BillingError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Transient(msg) => BillingError::GatewayTransient(msg),
            GatewayError::Declined { code, message } => {
                BillingError::GatewayDeclined { code, message }
            }
        }
    }
}

/// Outcome of a confirmed charge.
#[derive(Debug, Clone)]
pub struct GatewayCharge {
    /// Processor-side transaction id, retained for later reconciliation.
    pub gateway_txn_id: String,
    /// Raw processor response for diagnostics.
    pub raw: serde_json::Value,
}

/// Outcome of a refund execution.
#[derive(Debug, Clone)]
pub struct GatewayRefund {
    pub refund_id: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Capability queries used by gateway selection.
    fn supports_currency(&self, currency: &str) -> bool;
    fn supports_recurring(&self) -> bool;

    async fn create_payment_intent(
        &self,
        amount: Decimal,
        currency: &str,
        customer_ref: &str,
        metadata: &serde_json::Value,
    ) -> Result<String, GatewayError>;

    async fn confirm_payment(
        &self,
        intent_id: &str,
        payment_method: &str,
    ) -> Result<GatewayCharge, GatewayError>;

    async fn refund(
        &self,
        gateway_txn_id: &str,
        amount: Decimal,
        reason: &str,
    ) -> Result<GatewayRefund, GatewayError>;
}

/// Per-tenant gateway configuration.
///
/// Gateways are tried in registration order; the first one capable of the
/// charge wins. A default list serves tenants without explicit configuration
/// (sandbox installs register the mock gateway there).
#[derive(Default)]
pub struct GatewayRegistry {
    tenants: RwLock<HashMap<Uuid, Vec<Arc<dyn PaymentGateway>>>>,
    default: RwLock<Vec<Arc<dyn PaymentGateway>>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tenant_id: Uuid, gateway: Arc<dyn PaymentGateway>) {
        self.tenants_mut().entry(tenant_id).or_default().push(gateway);
    }

    pub fn register_default(&self, gateway: Arc<dyn PaymentGateway>) {
        self.default
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(gateway);
    }

    /// Pick the best-fit gateway for a charge.
    pub fn select(
        &self,
        tenant_id: Uuid,
        currency: &str,
        recurring: bool,
    ) -> BillingResult<Arc<dyn PaymentGateway>> {
        let pick = |gateways: &[Arc<dyn PaymentGateway>]| {
            gateways
                .iter()
                .find(|g| g.supports_currency(currency) && (!recurring || g.supports_recurring()))
                .cloned()
        };

        if let Some(gateway) = self.tenants().get(&tenant_id).and_then(|g| pick(g)) {
            return Ok(gateway);
        }
        pick(&self
            .default
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
        .ok_or(BillingError::NoUsableGateway)
    }

    /// Look up a configured gateway by name. Refunds use this to route back
    /// through the processor that captured the original charge.
    pub fn by_name(
        &self,
        tenant_id: Uuid,
        name: &str,
    ) -> BillingResult<Arc<dyn PaymentGateway>> {
        let find = |gateways: &[Arc<dyn PaymentGateway>]| {
            gateways.iter().find(|g| g.name() == name).cloned()
        };

        if let Some(gateway) = self.tenants().get(&tenant_id).and_then(|g| find(g)) {
            return Ok(gateway);
        }
        find(&self
            .default
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
        .ok_or(BillingError::NoUsableGateway)
    }

    fn tenants(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Vec<Arc<dyn PaymentGateway>>>> {
        self.tenants.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tenants_mut(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Vec<Arc<dyn PaymentGateway>>>> {
        self.tenants.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
