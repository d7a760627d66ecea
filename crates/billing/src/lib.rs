// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Store primitives take full row state
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Hostara Billing Engine
//!
//! Subscription lifecycle billing for multi-tenant hosting panels.
//!
//! ## Features
//!
//! - **Renewals**: Due-date driven billing cycle renewals with idempotent
//!   invoicing and a per-subscription lease for worker safety
//! - **Invoice Numbering**: Tenant-scoped sequential numbers, yearly reset
//! - **Proration**: Day-granularity credit/charge for mid-cycle changes
//! - **Gateways**: Pluggable payment gateway adapters with per-tenant routing
//! - **Dunning**: Failed-payment attempt tracking and `past_due` escalation
//! - **Cancellation**: Period-end or immediate, with unused-time refunds
//! - **Audit Trail**: Append-only subscription state change history

pub mod audit;
pub mod cancellation;
pub mod clock;
pub mod config;
pub mod dunning;
pub mod error;
pub mod gateway;
pub mod history;
pub mod notify;
pub mod numbering;
pub mod proration;
pub mod renewal;
pub mod state;
pub mod store;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
pub(crate) mod test_support;

pub use audit::{AuditTrail, NewStateChange};
pub use cancellation::{CancelOptions, CancelOutcome, CancellationService};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{EngineConfig, MAX_PAYMENT_ATTEMPTS};
pub use dunning::DunningManager;
pub use error::{BillingError, BillingResult};
pub use gateway::{
    GatewayCharge, GatewayError, GatewayRefund, GatewayRegistry, MockGateway, MockGatewayConfig,
    MockOutcome, PaymentGateway,
};
pub use history::BillingHistory;
pub use notify::{BillingNotifier, LogNotifier};
pub use numbering::InvoiceNumbering;
pub use proration::{calculate_proration, unused_time_credit, ProrationResult};
pub use renewal::{RenewalOrchestrator, RenewalOutcome};
pub use state::{can_transition, ensure_transition, TransitionReason};
pub use store::{BillingStore, InMemoryStore, PostgresStore};

use std::sync::Arc;

/// Wires the billing services around one store, clock, and gateway registry.
///
/// The worker builds one of these at startup; tests build one over
/// [`InMemoryStore`] and [`FixedClock`].
pub struct BillingEngine {
    pub renewals: RenewalOrchestrator,
    pub cancellations: CancellationService,
    pub dunning: DunningManager,
    pub numbering: InvoiceNumbering,
    pub history: BillingHistory,
}

impl BillingEngine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        gateways: Arc<GatewayRegistry>,
        notifier: Arc<dyn BillingNotifier>,
        config: EngineConfig,
    ) -> Self {
        let numbering = InvoiceNumbering::new(
            store.clone(),
            clock.clone(),
            config.invoice_prefix.clone(),
        );
        let dunning = DunningManager::new(
            store.clone(),
            clock.clone(),
            notifier.clone(),
            config.max_payment_attempts,
        );
        let renewals = RenewalOrchestrator::new(
            store.clone(),
            clock.clone(),
            gateways.clone(),
            notifier,
            numbering.clone(),
            dunning.clone(),
            config,
        );
        let cancellations = CancellationService::new(store.clone(), clock, gateways);
        let history = BillingHistory::new(store);

        Self {
            renewals,
            cancellations,
            dunning,
            numbering,
            history,
        }
    }
}
