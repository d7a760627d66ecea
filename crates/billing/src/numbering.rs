//! Invoice numbering service.
//!
//! Tenant-scoped, year-scoped sequential numbers. The store's counter
//! increment is a single atomic statement, so concurrent callers for the same
//! tenant and year always receive distinct numbers; year rollover simply
//! starts a fresh counter at 1.

use std::sync::Arc;

use chrono::Datelike;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::BillingResult;
use crate::store::BillingStore;

#[derive(Clone)]
pub struct InvoiceNumbering {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
}

impl InvoiceNumbering {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>, prefix: String) -> Self {
        Self {
            store,
            clock,
            prefix,
        }
    }

    /// Allocate the next invoice number for a tenant, e.g. `INV-2025-000123`.
    pub async fn next_number(&self, tenant_id: Uuid) -> BillingResult<String> {
        let year = self.clock.now().year();
        let number = self.store.increment_invoice_counter(tenant_id, year).await?;
        Ok(format!("{}-{}-{:06}", self.prefix, year, number))
    }
}
