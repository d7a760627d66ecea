//! Notification hooks.
//!
//! The engine only emits events; delivery (email templates, webhooks to the
//! panel UI) lives outside. Hooks are fire-and-forget — implementations must
//! not fail the billing path, and the engine ignores anything they do.

use async_trait::async_trait;
use hostara_shared::{Invoice, Subscription};

#[async_trait]
pub trait BillingNotifier: Send + Sync {
    async fn invoice_created(&self, invoice: &Invoice);
    async fn invoice_paid(&self, invoice: &Invoice);
    async fn invoice_overdue(&self, invoice: &Invoice);
    async fn payment_failed(&self, subscription: &Subscription, attempt: i32, error: &str);
    async fn subscription_past_due(&self, subscription: &Subscription);
}

/// Default notifier: structured log lines only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl BillingNotifier for LogNotifier {
    async fn invoice_created(&self, invoice: &Invoice) {
        tracing::info!(
            invoice_id = %invoice.id,
            number = %invoice.number,
            total = %invoice.total,
            "Invoice created"
        );
    }

    async fn invoice_paid(&self, invoice: &Invoice) {
        tracing::info!(invoice_id = %invoice.id, number = %invoice.number, "Invoice paid");
    }

    async fn invoice_overdue(&self, invoice: &Invoice) {
        tracing::warn!(invoice_id = %invoice.id, number = %invoice.number, "Invoice overdue");
    }

    async fn payment_failed(&self, subscription: &Subscription, attempt: i32, error: &str) {
        tracing::warn!(
            subscription_id = %subscription.id,
            attempt = attempt,
            error = %error,
            "Payment attempt failed"
        );
    }

    async fn subscription_past_due(&self, subscription: &Subscription) {
        tracing::warn!(
            subscription_id = %subscription.id,
            "Subscription escalated to past_due"
        );
    }
}
