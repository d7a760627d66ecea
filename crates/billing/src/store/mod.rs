//! Storage port.
//!
//! The engine never touches a database handle directly: all persistence goes
//! through [`BillingStore`], injected at construction. [`postgres::PostgresStore`]
//! is the production implementation; [`memory::InMemoryStore`] backs tests and
//! sandbox tenants.
//!
//! Concurrency-sensitive operations are modeled as single atomic primitives
//! rather than read-then-write sequences:
//! - [`BillingStore::increment_invoice_counter`] is one conditional
//!   increment-and-read,
//! - [`BillingStore::advance_billing_period`] is a compare-and-swap keyed on
//!   the previously observed `next_billing_date`,
//! - [`BillingStore::claim_renewal`] is a TTL lease serializing renewal
//!   processing per subscription.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hostara_shared::{
    Invoice, Payment, PaymentStatus, Plan, RefundRecord, Subscription, SubscriptionStateChange,
    SubscriptionStatus,
};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::audit::NewStateChange;
use crate::error::BillingResult;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

#[async_trait]
pub trait BillingStore: Send + Sync {
    // --- subscriptions -----------------------------------------------------

    async fn subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Subscription>>;

    async fn plan(&self, tenant_id: Uuid, plan_id: Uuid) -> BillingResult<Option<Plan>>;

    /// Billable subscriptions whose `next_billing_date` has passed.
    async fn due_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;

    /// Take the per-subscription renewal lease. Returns false when another
    /// worker holds an unexpired lease.
    async fn claim_renewal(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> BillingResult<bool>;

    async fn release_renewal(&self, tenant_id: Uuid, subscription_id: Uuid) -> BillingResult<()>;

    /// Advance the billing period, reset the failure counter, and set the
    /// subscription active — conditional on `next_billing_date` still being
    /// `expected_next`. Returns false if another process advanced first.
    #[allow(clippy::too_many_arguments)]
    async fn advance_billing_period(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        expected_next: DateTime<Utc>,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        new_next: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<bool>;

    /// Conditional status change (`WHERE status = from`). Returns false when
    /// the row was concurrently moved to a different status.
    async fn transition_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> BillingResult<bool>;

    /// Persist the dunning counter and last-attempt timestamp.
    async fn record_payment_failure(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        attempts: i32,
        at: DateTime<Utc>,
    ) -> BillingResult<()>;

    /// Persist cancellation flags. `cancelled_at` is set only on immediate
    /// cancellation or period-end expiry.
    async fn set_cancellation(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        cancel_at_period_end: bool,
        reason: &str,
        cancelled_at: Option<DateTime<Utc>>,
    ) -> BillingResult<()>;

    // --- invoices ----------------------------------------------------------

    async fn insert_invoice(&self, invoice: &Invoice) -> BillingResult<()>;

    /// The open (pending/overdue) invoice covering a billing period, if a
    /// previous failed renewal already created one.
    async fn open_invoice_for_period(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> BillingResult<Option<Invoice>>;

    async fn mark_invoice_paid(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        paid_at: DateTime<Utc>,
    ) -> BillingResult<()>;

    /// Flip pending invoices past their due date to overdue; returns the
    /// affected invoices so notifications can fire.
    async fn mark_overdue_invoices(&self, now: DateTime<Utc>) -> BillingResult<Vec<Invoice>>;

    async fn invoices_for_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Invoice>>;

    // --- payments ----------------------------------------------------------

    async fn insert_payment(&self, payment: &Payment) -> BillingResult<()>;

    async fn latest_completed_payment(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Payment>>;

    /// Record a refund against a payment: bump `refunded_amount` and set the
    /// payment status.
    async fn apply_refund(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        refunded_amount: Decimal,
        status: PaymentStatus,
    ) -> BillingResult<()>;

    async fn insert_refund_record(&self, record: &RefundRecord) -> BillingResult<()>;

    async fn payments_for_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Payment>>;

    // --- counters ----------------------------------------------------------

    /// Atomic increment-and-read of the per-(tenant, year) invoice counter.
    /// First call for a new year starts the counter at 1.
    async fn increment_invoice_counter(&self, tenant_id: Uuid, year: i32) -> BillingResult<i64>;

    // --- audit -------------------------------------------------------------

    async fn append_state_change(
        &self,
        change: &NewStateChange,
        at: DateTime<Utc>,
    ) -> BillingResult<()>;

    async fn state_changes(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionStateChange>>;
}
