//! In-memory store.
//!
//! Backs unit tests and sandbox tenants. All operations take one short-lived
//! mutex, which makes the counter increment and the period-advance CAS atomic
//! under concurrent callers exactly like their SQL counterparts.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hostara_shared::{
    Invoice, InvoiceStatus, Payment, PaymentStatus, Plan, RefundRecord, Subscription,
    SubscriptionStateChange, SubscriptionStatus,
};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::audit::NewStateChange;
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<Uuid, Subscription>,
    plans: HashMap<Uuid, Plan>,
    invoices: HashMap<Uuid, Invoice>,
    payments: HashMap<Uuid, Payment>,
    refunds: Vec<RefundRecord>,
    counters: HashMap<(Uuid, i32), i64>,
    state_changes: Vec<SubscriptionStateChange>,
    leases: HashMap<Uuid, DateTime<Utc>>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn put_subscription(&self, subscription: Subscription) {
        self.locked().subscriptions.insert(subscription.id, subscription);
    }

    pub fn put_plan(&self, plan: Plan) {
        self.locked().plans.insert(plan.id, plan);
    }

    pub fn invoice(&self, invoice_id: Uuid) -> Option<Invoice> {
        self.locked().invoices.get(&invoice_id).cloned()
    }

    pub fn payment(&self, payment_id: Uuid) -> Option<Payment> {
        self.locked().payments.get(&payment_id).cloned()
    }

    pub fn refund_records(&self, tenant_id: Uuid) -> Vec<RefundRecord> {
        self.locked()
            .refunds
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BillingStore for InMemoryStore {
    async fn subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .locked()
            .subscriptions
            .get(&subscription_id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn plan(&self, tenant_id: Uuid, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self
            .locked()
            .plans
            .get(&plan_id)
            .filter(|p| p.tenant_id == tenant_id)
            .cloned())
    }

    async fn due_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let guard = self.locked();
        let mut due: Vec<Subscription> = guard
            .subscriptions
            .values()
            .filter(|s| s.is_renewal_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_billing_date);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn claim_renewal(
        &self,
        _tenant_id: Uuid,
        subscription_id: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> BillingResult<bool> {
        let mut guard = self.locked();
        match guard.leases.get(&subscription_id) {
            Some(locked_until) if *locked_until > now => Ok(false),
            _ => {
                guard.leases.insert(subscription_id, now + ttl);
                Ok(true)
            }
        }
    }

    async fn release_renewal(
        &self,
        _tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<()> {
        self.locked().leases.remove(&subscription_id);
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
        let mut guard = self.locked();
        let Some(sub) = guard
            .subscriptions
            .get_mut(&subscription_id)
            .filter(|s| s.tenant_id == tenant_id)
        else {
            return Ok(false);
        };
        if sub.next_billing_date != expected_next {
            return Ok(false);
        }
        sub.current_period_start = new_start;
        sub.current_period_end = new_end;
        sub.next_billing_date = new_next;
        sub.status = SubscriptionStatus::Active;
        sub.failed_payment_attempts = 0;
        sub.updated_at = now;
        Ok(true)
    }

    async fn transition_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let mut guard = self.locked();
        let Some(sub) = guard
            .subscriptions
            .get_mut(&subscription_id)
            .filter(|s| s.tenant_id == tenant_id)
        else {
            return Ok(false);
        };
        if sub.status != from {
            return Ok(false);
        }
        sub.status = to;
        sub.updated_at = now;
        Ok(true)
    }

    async fn record_payment_failure(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        attempts: i32,
        at: DateTime<Utc>,
    ) -> BillingResult<()> {
        let mut guard = self.locked();
        let sub = guard
            .subscriptions
            .get_mut(&subscription_id)
            .filter(|s| s.tenant_id == tenant_id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))?;
        sub.failed_payment_attempts = attempts;
        sub.last_payment_attempt = Some(at);
        sub.updated_at = at;
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
        let mut guard = self.locked();
        let sub = guard
            .subscriptions
            .get_mut(&subscription_id)
            .filter(|s| s.tenant_id == tenant_id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))?;
        sub.cancel_at_period_end = cancel_at_period_end;
        sub.cancellation_reason = Some(reason.to_string());
        sub.cancelled_at = cancelled_at;
        Ok(())
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        self.locked().invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn open_invoice_for_period(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
    ) -> BillingResult<Option<Invoice>> {
        Ok(self
            .locked()
            .invoices
            .values()
            .find(|i| {
                i.tenant_id == tenant_id
                    && i.subscription_id == Some(subscription_id)
                    && i.period_start == Some(period_start)
                    && i.status.is_open()
            })
            .cloned())
    }

    async fn mark_invoice_paid(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        paid_at: DateTime<Utc>,
    ) -> BillingResult<()> {
        let mut guard = self.locked();
        let invoice = guard
            .invoices
            .get_mut(&invoice_id)
            .filter(|i| i.tenant_id == tenant_id)
            .ok_or_else(|| BillingError::NotFound(format!("invoice {invoice_id}")))?;
        invoice.status = InvoiceStatus::Paid;
        invoice.paid_at = Some(paid_at);
        Ok(())
    }

    async fn mark_overdue_invoices(&self, now: DateTime<Utc>) -> BillingResult<Vec<Invoice>> {
        let mut guard = self.locked();
        let mut flipped = Vec::new();
        for invoice in guard.invoices.values_mut() {
            if invoice.status == InvoiceStatus::Pending && invoice.due_date < now {
                invoice.status = InvoiceStatus::Overdue;
                flipped.push(invoice.clone());
            }
        }
        Ok(flipped)
    }

    async fn invoices_for_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .locked()
            .invoices
            .values()
            .filter(|i| i.tenant_id == tenant_id && i.subscription_id == Some(subscription_id))
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.created_at);
        Ok(invoices)
    }

    async fn insert_payment(&self, payment: &Payment) -> BillingResult<()> {
        self.locked().payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn latest_completed_payment(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Payment>> {
        let guard = self.locked();
        let invoice_ids: Vec<Uuid> = guard
            .invoices
            .values()
            .filter(|i| i.tenant_id == tenant_id && i.subscription_id == Some(subscription_id))
            .map(|i| i.id)
            .collect();
        let mut completed: Vec<&Payment> = guard
            .payments
            .values()
            .filter(|p| {
                p.status == PaymentStatus::Completed && invoice_ids.contains(&p.invoice_id)
            })
            .collect();
        completed.sort_by_key(|p| p.created_at);
        Ok(completed.last().map(|p| (*p).clone()))
    }

    async fn apply_refund(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        refunded_amount: Decimal,
        status: PaymentStatus,
    ) -> BillingResult<()> {
        let mut guard = self.locked();
        let payment = guard
            .payments
            .get_mut(&payment_id)
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or_else(|| BillingError::NotFound(format!("payment {payment_id}")))?;
        payment.refunded_amount = refunded_amount;
        payment.status = status;
        Ok(())
    }

    async fn insert_refund_record(&self, record: &RefundRecord) -> BillingResult<()> {
        self.locked().refunds.push(record.clone());
        Ok(())
    }

    async fn payments_for_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Payment>> {
        let guard = self.locked();
        let invoice_ids: Vec<Uuid> = guard
            .invoices
            .values()
            .filter(|i| i.tenant_id == tenant_id && i.subscription_id == Some(subscription_id))
            .map(|i| i.id)
            .collect();
        let mut payments: Vec<Payment> = guard
            .payments
            .values()
            .filter(|p| invoice_ids.contains(&p.invoice_id))
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn increment_invoice_counter(
        &self,
        tenant_id: Uuid,
        year: i32,
    ) -> BillingResult<i64> {
        let mut guard = self.locked();
        let counter = guard.counters.entry((tenant_id, year)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn append_state_change(
        &self,
        change: &NewStateChange,
        at: DateTime<Utc>,
    ) -> BillingResult<()> {
        let record = SubscriptionStateChange {
            id: Uuid::new_v4(),
            tenant_id: change.tenant_id,
            subscription_id: change.subscription_id,
            from_status: change.from_status,
            to_status: change.to_status,
            reason: change.reason.clone(),
            metadata: change.metadata.clone(),
            actor_id: change.actor.user_id(),
            created_at: at,
        };
        self.locked().state_changes.push(record);
        Ok(())
    }

    async fn state_changes(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionStateChange>> {
        Ok(self
            .locked()
            .state_changes
            .iter()
            .filter(|c| c.tenant_id == tenant_id && c.subscription_id == subscription_id)
            .cloned()
            .collect())
    }
}
