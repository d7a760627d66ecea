//! Shared test harness: an engine over the in-memory store, a fixed clock,
//! and a scriptable gateway.

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use crate::clock::FixedClock;
use crate::config::EngineConfig;
use crate::gateway::{GatewayRegistry, MockGateway};
use crate::notify::LogNotifier;
use crate::store::InMemoryStore;
use crate::BillingEngine;

pub struct TestEnv {
    pub engine: BillingEngine,
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<FixedClock>,
    pub gateway: Arc<MockGateway>,
    pub gateways: Arc<GatewayRegistry>,
}

impl TestEnv {
    /// Engine at 2025-06-01T00:00:00Z with an approving mock gateway.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ));
        let gateway = Arc::new(MockGateway::approving());
        let registry = Arc::new(GatewayRegistry::new());
        registry.register_default(gateway.clone());

        let engine = BillingEngine::new(
            store.clone(),
            clock.clone(),
            registry.clone(),
            Arc::new(LogNotifier),
            config,
        );

        Self {
            engine,
            store,
            clock,
            gateway,
            gateways: registry,
        }
    }
}

pub mod fixtures {
    use chrono::{TimeZone, Utc};
    use hostara_shared::{BillingInterval, Plan, Subscription, SubscriptionStatus};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    use super::TestEnv;

    /// Monthly $30 USD plan.
    pub fn monthly_plan(tenant_id: Uuid) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            tenant_id,
            name: "Web Hosting - Pro".to_string(),
            price: dec!(30.00),
            currency: "USD".to_string(),
            interval: BillingInterval::Monthly,
            trial_days: 0,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    /// An active subscription whose renewal is due exactly at the test
    /// clock's start time (period May 2025, next billing 2025-06-01).
    pub fn active_subscription(env: &TestEnv) -> (Uuid, Subscription) {
        let tenant_id = Uuid::new_v4();
        let plan = monthly_plan(tenant_id);
        let sub = subscription_on_plan(tenant_id, &plan);
        env.store.put_plan(plan);
        env.store.put_subscription(sub.clone());
        (tenant_id, sub)
    }

    pub fn subscription_on_plan(tenant_id: Uuid, plan: &Plan) -> Subscription {
        let period_start = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        let period_end = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        Subscription {
            id: Uuid::new_v4(),
            tenant_id,
            client_id: Uuid::new_v4(),
            plan_id: plan.id,
            status: SubscriptionStatus::Active,
            current_period_start: period_start,
            current_period_end: period_end,
            next_billing_date: period_end,
            trial_start: None,
            trial_end: None,
            cancel_at_period_end: false,
            cancellation_reason: None,
            cancelled_at: None,
            failed_payment_attempts: 0,
            last_payment_attempt: None,
            price_override: None,
            payment_method: Some("pm_123".to_string()),
            created_at: period_start,
            updated_at: period_start,
        }
    }
}
