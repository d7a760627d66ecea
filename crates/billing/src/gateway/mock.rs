//! Deterministic gateway for tests and sandbox tenants.
//!
//! Outcomes are scripted per call; with no script the gateway approves
//! everything. Transaction ids are sequential so assertions stay stable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::{GatewayCharge, GatewayError, GatewayRefund, PaymentGateway};

#[derive(Debug, Clone)]
pub struct MockGatewayConfig {
    pub name: String,
    pub currencies: Vec<String>,
    pub recurring: bool,
}

impl Default for MockGatewayConfig {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            currencies: vec!["USD".to_string()],
            recurring: true,
        }
    }
}

/// Scripted outcome for the next confirm or refund call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Succeed,
    Decline { code: String, message: String },
    Transient(String),
}

#[derive(Default)]
struct Script {
    confirms: VecDeque<MockOutcome>,
    refunds: VecDeque<MockOutcome>,
}

pub struct MockGateway {
    config: MockGatewayConfig,
    script: Mutex<Script>,
    sequence: AtomicU64,
}

impl MockGateway {
    pub fn new(config: MockGatewayConfig) -> Self {
        Self {
            config,
            script: Mutex::new(Script::default()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn approving() -> Self {
        Self::new(MockGatewayConfig::default())
    }

    /// Queue an outcome for the next `confirm_payment` call.
    pub fn push_confirm_outcome(&self, outcome: MockOutcome) {
        self.locked().confirms.push_back(outcome);
    }

    /// Queue an outcome for the next `refund` call.
    pub fn push_refund_outcome(&self, outcome: MockOutcome) {
        self.locked().refunds.push_back(outcome);
    }

    fn locked(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}_{}_{:04}", self.config.name, prefix, n)
    }

    fn apply(outcome: Option<MockOutcome>) -> Result<(), GatewayError> {
        match outcome.unwrap_or(MockOutcome::Succeed) {
            MockOutcome::Succeed => Ok(()),
            MockOutcome::Decline { code, message } => Err(GatewayError::Declined { code, message }),
            MockOutcome::Transient(msg) => Err(GatewayError::Transient(msg)),
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn supports_currency(&self, currency: &str) -> bool {
        self.config.currencies.iter().any(|c| c == currency)
    }

    fn supports_recurring(&self) -> bool {
        self.config.recurring
    }

    async fn create_payment_intent(
        &self,
        _amount: Decimal,
        _currency: &str,
        _customer_ref: &str,
        _metadata: &serde_json::Value,
    ) -> Result<String, GatewayError> {
        Ok(self.next_id("pi"))
    }

    async fn confirm_payment(
        &self,
        intent_id: &str,
        _payment_method: &str,
    ) -> Result<GatewayCharge, GatewayError> {
        let outcome = self.locked().confirms.pop_front();
        Self::apply(outcome)?;
        Ok(GatewayCharge {
            gateway_txn_id: self.next_id("txn"),
            raw: serde_json::json!({ "intent_id": intent_id, "status": "succeeded" }),
        })
    }

    async fn refund(
        &self,
        gateway_txn_id: &str,
        _amount: Decimal,
        _reason: &str,
    ) -> Result<GatewayRefund, GatewayError> {
        let outcome = self.locked().refunds.pop_front();
        Self::apply(outcome)?;
        let _ = gateway_txn_id;
        Ok(GatewayRefund {
            refund_id: self.next_id("re"),
        })
    }
}
