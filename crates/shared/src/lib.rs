// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Hostara Shared Types
//!
//! Domain types shared between the billing engine and the worker:
//! subscription/invoice/payment entities, the closed status enumerations,
//! billing-interval arithmetic, and the single monetary rounding helper.

pub mod audit;
pub mod invoice;
pub mod money;
pub mod payment;
pub mod plan;
pub mod subscription;

pub use audit::{ChangeActor, SubscriptionStateChange};
pub use invoice::{Invoice, InvoiceKind, InvoiceStatus};
pub use money::{ceil_days, round_money};
pub use payment::{Payment, PaymentStatus, RefundRecord, RefundStatus};
pub use plan::{BillingInterval, Plan};
pub use subscription::{Subscription, SubscriptionStatus};
