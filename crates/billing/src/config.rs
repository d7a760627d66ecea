//! Engine configuration.
//!
//! The engine carries no ambient globals: configuration is an explicit struct
//! passed to [`crate::BillingEngine::new`]. `from_env` exists for binaries
//! that configure through the environment (the worker).

use chrono::Duration;

/// Failed attempts before a subscription escalates to `past_due`.
pub const MAX_PAYMENT_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Prefix for generated invoice numbers, e.g. `INV-2025-000123`.
    pub invoice_prefix: String,
    /// Dunning threshold.
    pub max_payment_attempts: i32,
    /// Bound on every gateway network call.
    pub gateway_timeout: std::time::Duration,
    /// TTL of the per-subscription renewal lease; expired leases can be
    /// taken over so a crashed worker never wedges a subscription.
    pub renewal_lock_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            invoice_prefix: "INV".to_string(),
            max_payment_attempts: MAX_PAYMENT_ATTEMPTS,
            gateway_timeout: std::time::Duration::from_secs(30),
            renewal_lock_ttl: Duration::minutes(5),
        }
    }
}

impl EngineConfig {
    /// Read overrides from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(prefix) = std::env::var("INVOICE_PREFIX") {
            if !prefix.is_empty() {
                config.invoice_prefix = prefix;
            }
        }
        if let Some(secs) = env_u64("GATEWAY_TIMEOUT_SECS") {
            config.gateway_timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(mins) = env_u64("RENEWAL_LOCK_TTL_MINUTES") {
            config.renewal_lock_ttl = Duration::minutes(mins as i64);
        }

        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
