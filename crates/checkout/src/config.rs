//! Engine configuration loaded from environment variables.

use chrono::Duration;

/// Reservation engine configuration with sensible defaults.
///
/// Reads from environment variables (all in whole seconds):
/// - `STOCK_RESERVATION_TTL_SECS` — stock lease length (default: 900)
/// - `COUPON_RESERVATION_TTL_SECS` — coupon lease length (default: 900)
/// - `SWEEP_INTERVAL_SECS` — pause between sweeps (default: 60)
/// - `SWEEP_GRACE_SECS` — margin before a record counts as orphaned/expired (default: 300)
/// - `PENDING_PAYMENT_TIMEOUT_SECS` — window before an unpaid order without a
///   payment session is cancelled (default: 86400)
/// - `IDEMPOTENCY_RETENTION_SECS` — idempotency record retention (default: 604800)
/// - `SWEEP_BATCH_LIMIT` — max records per check per sweep (default: 200)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub stock_ttl: Duration,
    pub coupon_ttl: Duration,
    pub sweep_interval: Duration,
    pub sweep_grace: Duration,
    pub pending_payment_timeout: Duration,
    pub idempotency_retention: Duration,
    pub sweep_batch_limit: usize,
}

fn env_secs(name: &str, default: i64) -> Duration {
    Duration::seconds(
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            stock_ttl: env_secs("STOCK_RESERVATION_TTL_SECS", 900),
            coupon_ttl: env_secs("COUPON_RESERVATION_TTL_SECS", 900),
            sweep_interval: env_secs("SWEEP_INTERVAL_SECS", 60),
            sweep_grace: env_secs("SWEEP_GRACE_SECS", 300),
            pending_payment_timeout: env_secs("PENDING_PAYMENT_TIMEOUT_SECS", 86_400),
            idempotency_retention: env_secs("IDEMPOTENCY_RETENTION_SECS", 604_800),
            sweep_batch_limit: std::env::var("SWEEP_BATCH_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(200),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stock_ttl: Duration::seconds(900),
            coupon_ttl: Duration::seconds(900),
            sweep_interval: Duration::seconds(60),
            sweep_grace: Duration::seconds(300),
            pending_payment_timeout: Duration::seconds(86_400),
            idempotency_retention: Duration::seconds(604_800),
            sweep_batch_limit: 200,
        }
    }
}
