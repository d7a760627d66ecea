//! Postgres store.
//!
//! Runtime-checked sqlx queries against the tables in
//! `migrations/0001_billing.sql`. The counter increment, the period-advance
//! CAS, and the renewal lease are each a single SQL statement so they stay
//! atomic under concurrent workers.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hostara_shared::{
    Invoice, Payment, PaymentStatus, Plan, RefundRecord, Subscription, SubscriptionStateChange,
    SubscriptionStatus,
};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::audit::NewStateChange;
use crate::error::BillingResult;
use crate::store::BillingStore;

const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, client_id, plan_id, status, \
     current_period_start, current_period_end, next_billing_date, trial_start, trial_end, \
     cancel_at_period_end, cancellation_reason, cancelled_at, failed_payment_attempts, \
     last_payment_attempt, price_override, payment_method, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, tenant_id, subscription_id, number, subtotal, tax, total, \
     currency, status, kind, period_start, period_end, due_date, paid_at, created_at";

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingStore for PostgresStore {
    async fn subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(subscription_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    async fn plan(&self, tenant_id: Uuid, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(
            "SELECT id, tenant_id, name, price, currency, interval, trial_days, created_at
             FROM plans WHERE id = $1 AND tenant_id = $2",
        )
        .bind(plan_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(plan)
    }

    async fn due_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE next_billing_date <= $1
               AND status IN ('trialing', 'active', 'past_due', 'pending_cancellation')
             ORDER BY next_billing_date ASC
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(subs)
    }

    async fn claim_renewal(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> BillingResult<bool> {
        // Expired leases are taken over so a crashed worker never wedges a
        // subscription.
        let rows = sqlx::query(
            r#"
            INSERT INTO renewal_leases (tenant_id, subscription_id, locked_until)
            VALUES ($1, $2, $3)
            ON CONFLICT (subscription_id)
            DO UPDATE SET locked_until = EXCLUDED.locked_until
            WHERE renewal_leases.locked_until < $4
            "#,
        )
        .bind(tenant_id)
        .bind(subscription_id)
        .bind(now + ttl)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    async fn release_renewal(&self, tenant_id: Uuid, subscription_id: Uuid) -> BillingResult<()> {
        sqlx::query("DELETE FROM renewal_leases WHERE subscription_id = $1 AND tenant_id = $2")
            .bind(subscription_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn advance_billing_period(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        expected_next: DateTime<Utc>,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        new_next: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE subscriptions SET
                current_period_start = $1,
                current_period_end = $2,
                next_billing_date = $3,
                status = 'active',
                failed_payment_attempts = 0,
                updated_at = $4
            WHERE id = $5 AND tenant_id = $6 AND next_billing_date = $7
            "#,
        )
        .bind(new_start)
        .bind(new_end)
        .bind(new_next)
        .bind(now)
        .bind(subscription_id)
        .bind(tenant_id)
        .bind(expected_next)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    async fn transition_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let rows = sqlx::query(
            "UPDATE subscriptions SET status = $1, updated_at = $2
             WHERE id = $3 AND tenant_id = $4 AND status = $5",
        )
        .bind(to)
        .bind(now)
        .bind(subscription_id)
        .bind(tenant_id)
        .bind(from)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    async fn record_payment_failure(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        attempts: i32,
        at: DateTime<Utc>,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE subscriptions SET failed_payment_attempts = $1, last_payment_attempt = $2,
                 updated_at = $2
             WHERE id = $3 AND tenant_id = $4",
        )
        .bind(attempts)
        .bind(at)
        .bind(subscription_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_cancellation(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        cancel_at_period_end: bool,
        reason: &str,
        cancelled_at: Option<DateTime<Utc>>,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE subscriptions SET cancel_at_period_end = $1, cancellation_reason = $2,
                 cancelled_at = $3
             WHERE id = $4 AND tenant_id = $5",
        )
        .bind(cancel_at_period_end)
        .bind(reason)
        .bind(cancelled_at)
        .bind(subscription_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO invoices (
                id, tenant_id, subscription_id, number, subtotal, tax, total,
                currency, status, kind, period_start, period_end, due_date, paid_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.tenant_id)
        .bind(invoice.subscription_id)
        .bind(&invoice.number)
        .bind(invoice.subtotal)
        .bind(invoice.tax)
        .bind(invoice.total)
        .bind(&invoice.currency)
        .bind(invoice.status)
        .bind(invoice.kind)
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(invoice.due_date)
        .bind(invoice.paid_at)
        .bind(invoice.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn open_invoice_for_period(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> BillingResult<Option<Invoice>> {
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices
             WHERE tenant_id = $1 AND subscription_id = $2 AND period_start = $3
               AND status IN ('pending', 'overdue')
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(tenant_id)
        .bind(subscription_id)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;

        Ok(invoice)
    }

    async fn mark_invoice_paid(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        paid_at: DateTime<Utc>,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE invoices SET status = 'paid', paid_at = $1
             WHERE id = $2 AND tenant_id = $3 AND status IN ('pending', 'overdue')",
        )
        .bind(paid_at)
        .bind(invoice_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_overdue_invoices(&self, now: DateTime<Utc>) -> BillingResult<Vec<Invoice>> {
        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            "UPDATE invoices SET status = 'overdue'
             WHERE status = 'pending' AND due_date < $1
             RETURNING {INVOICE_COLUMNS}"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(invoices)
    }

    async fn invoices_for_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Invoice>> {
        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices
             WHERE tenant_id = $1 AND subscription_id = $2
             ORDER BY created_at ASC"
        ))
        .bind(tenant_id)
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(invoices)
    }

    async fn insert_payment(&self, payment: &Payment) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments (
                id, tenant_id, invoice_id, amount, currency, status, gateway,
                gateway_txn_id, refunded_amount, error_code, error_message,
                retry_count, next_retry_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(payment.id)
        .bind(payment.tenant_id)
        .bind(payment.invoice_id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.status)
        .bind(&payment.gateway)
        .bind(&payment.gateway_txn_id)
        .bind(payment.refunded_amount)
        .bind(&payment.error_code)
        .bind(&payment.error_message)
        .bind(payment.retry_count)
        .bind(payment.next_retry_at)
        .bind(payment.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest_completed_payment(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(
            "SELECT p.id, p.tenant_id, p.invoice_id, p.amount, p.currency, p.status, p.gateway,
                    p.gateway_txn_id, p.refunded_amount, p.error_code, p.error_message,
                    p.retry_count, p.next_retry_at, p.created_at
             FROM payments p
             JOIN invoices i ON i.id = p.invoice_id
             WHERE p.tenant_id = $1 AND i.subscription_id = $2 AND p.status = 'completed'
             ORDER BY p.created_at DESC
             LIMIT 1",
        )
        .bind(tenant_id)
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    async fn apply_refund(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        refunded_amount: Decimal,
        status: PaymentStatus,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE payments SET refunded_amount = $1, status = $2
             WHERE id = $3 AND tenant_id = $4",
        )
        .bind(refunded_amount)
        .bind(status)
        .bind(payment_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_refund_record(&self, record: &RefundRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO refunds (
                id, tenant_id, payment_id, amount, reason, status,
                gateway_refund_id, error_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.tenant_id)
        .bind(record.payment_id)
        .bind(record.amount)
        .bind(&record.reason)
        .bind(record.status)
        .bind(&record.gateway_refund_id)
        .bind(&record.error_message)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn payments_for_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(
            "SELECT p.id, p.tenant_id, p.invoice_id, p.amount, p.currency, p.status, p.gateway,
                    p.gateway_txn_id, p.refunded_amount, p.error_code, p.error_message,
                    p.retry_count, p.next_retry_at, p.created_at
             FROM payments p
             JOIN invoices i ON i.id = p.invoice_id
             WHERE p.tenant_id = $1 AND i.subscription_id = $2
             ORDER BY p.created_at ASC",
        )
        .bind(tenant_id)
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(payments)
    }

    async fn increment_invoice_counter(&self, tenant_id: Uuid, year: i32) -> BillingResult<i64> {
        // Single atomic increment-and-read; concurrent callers serialize on
        // the (tenant_id, year) row and each receive a distinct number.
        let (number,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO invoice_counters (tenant_id, year, last_number)
            VALUES ($1, $2, 1)
            ON CONFLICT (tenant_id, year)
            DO UPDATE SET last_number = invoice_counters.last_number + 1
            RETURNING last_number
            "#,
        )
        .bind(tenant_id)
        .bind(year)
        .fetch_one(&self.pool)
        .await?;

        Ok(number)
    }

    async fn append_state_change(
        &self,
        change: &NewStateChange,
        at: DateTime<Utc>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_state_changes (
                id, tenant_id, subscription_id, from_status, to_status,
                reason, metadata, actor_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(change.tenant_id)
        .bind(change.subscription_id)
        .bind(change.from_status)
        .bind(change.to_status)
        .bind(&change.reason)
        .bind(&change.metadata)
        .bind(change.actor.user_id())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn state_changes(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionStateChange>> {
        let changes = sqlx::query_as::<_, SubscriptionStateChange>(
            "SELECT id, tenant_id, subscription_id, from_status, to_status, reason, metadata,
                    actor_id, created_at
             FROM subscription_state_changes
             WHERE tenant_id = $1 AND subscription_id = $2
             ORDER BY created_at ASC",
        )
        .bind(tenant_id)
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(changes)
    }
}
