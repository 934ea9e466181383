//! Per-tenant token-bucket rate limiting.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;
use profile_types::TenantId;
use shard_ring::HealthyInstanceCounter;

use crate::limits::Limits;

/// How long a bucket runs on its cached rate before re-consulting the
/// strategy.
pub(crate) const RATE_RECHECK_PERIOD: Duration = Duration::from_secs(10);

/// Produces the effective rate and burst for a tenant's bucket.
pub trait RateLimiterStrategy: Send + Sync + Debug {
    /// Tokens (bytes) added per second.
    fn rate(&self, tenant_id: &TenantId) -> f64;

    /// Bucket capacity (bytes).
    fn burst(&self, tenant_id: &TenantId) -> usize;
}

/// Divides each tenant's global rate budget across the healthy distributor
/// instances, so the fleet as a whole admits the configured rate.
///
/// A scale-out briefly over-admits until every bucket's recheck lapses;
/// that window is bounded by [`RATE_RECHECK_PERIOD`].
#[derive(Debug)]
pub struct GlobalRateStrategy {
    limits: Arc<dyn Limits>,
    healthy_instances: Arc<HealthyInstanceCounter>,
}

impl GlobalRateStrategy {
    pub fn new(limits: Arc<dyn Limits>, healthy_instances: Arc<HealthyInstanceCounter>) -> Self {
        Self {
            limits,
            healthy_instances,
        }
    }
}

impl RateLimiterStrategy for GlobalRateStrategy {
    fn rate(&self, tenant_id: &TenantId) -> f64 {
        let instances = self.healthy_instances.count().max(1);
        self.limits.ingestion_rate_bytes(tenant_id) / f64::from(instances)
    }

    fn burst(&self, tenant_id: &TenantId) -> usize {
        self.limits.ingestion_burst_size_bytes(tenant_id)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    rate: f64,
    burst: usize,
    last_refill: Instant,
    last_recheck: Instant,
}

/// A token-bucket rate limiter with one bucket per tenant.
///
/// [`RateLimiter::allow_n`] is atomic per tenant and does not consume
/// tokens when it denies.
#[derive(Debug)]
pub struct RateLimiter {
    strategy: Arc<dyn RateLimiterStrategy>,
    recheck_period: Duration,
    buckets: Mutex<HashMap<TenantId, Bucket>>,
}

impl RateLimiter {
    pub fn new(strategy: Arc<dyn RateLimiterStrategy>, recheck_period: Duration) -> Self {
        Self {
            strategy,
            recheck_period,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `n` tokens may be spent by `tenant_id` at `now`.
    ///
    /// New buckets start full at the strategy's burst size.
    pub fn allow_n(&self, now: Instant, tenant_id: &TenantId, n: usize) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(tenant_id.clone()).or_insert_with(|| {
            let burst = self.strategy.burst(tenant_id);
            Bucket {
                tokens: burst as f64,
                rate: self.strategy.rate(tenant_id),
                burst,
                last_refill: now,
                last_recheck: now,
            }
        });

        if now.saturating_duration_since(bucket.last_recheck) >= self.recheck_period {
            bucket.rate = self.strategy.rate(tenant_id);
            bucket.burst = self.strategy.burst(tenant_id);
            bucket.last_recheck = now;
        }

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + bucket.rate * elapsed.as_secs_f64()).min(bucket.burst as f64);
        bucket.last_refill = now;

        if (n as f64) <= bucket.tokens {
            bucket.tokens -= n as f64;
            return true;
        }
        false
    }
}
