//! Per-tenant ingest limits.

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use profile_types::TenantId;

/// Read access to the per-tenant limits the pipeline enforces.
///
/// Implementations are consulted on every request; they should be cheap and
/// never block.
pub trait Limits: Send + Sync + Debug {
    /// The tenant's global ingest rate budget, in uncompressed bytes per
    /// second, shared across all distributors.
    fn ingestion_rate_bytes(&self, tenant_id: &TenantId) -> f64;

    /// The tenant's token-bucket burst capacity, in uncompressed bytes.
    fn ingestion_burst_size_bytes(&self, tenant_id: &TenantId) -> usize;

    /// The size of the tenant's ingester shuffle shard. Zero uses the whole
    /// ring.
    fn ingestion_tenant_shard_size(&self, tenant_id: &TenantId) -> usize;

    fn max_label_name_length(&self, tenant_id: &TenantId) -> usize;
    fn max_label_value_length(&self, tenant_id: &TenantId) -> usize;
    fn max_label_names_per_series(&self, tenant_id: &TenantId) -> usize;

    /// Maximum decompressed profile size, in bytes.
    fn max_profile_size_bytes(&self, tenant_id: &TenantId) -> usize;
    fn max_profile_stacktrace_samples(&self, tenant_id: &TenantId) -> usize;
    fn max_profile_stacktrace_depth(&self, tenant_id: &TenantId) -> usize;
    fn max_profile_stacktrace_sample_labels(&self, tenant_id: &TenantId) -> usize;

    /// Maximum length of any string in a profile's symbol table.
    fn max_profile_symbol_value_length(&self, tenant_id: &TenantId) -> usize;

    /// How many distinct `session_id` values a series may spread over.
    /// Zero drops the label entirely.
    fn max_sessions_per_series(&self, tenant_id: &TenantId) -> usize;

    /// Reject profiles older than this relative to the ingest wall clock.
    fn reject_older_than(&self, tenant_id: &TenantId) -> Duration;

    /// Reject profiles further in the future than this.
    fn reject_newer_than(&self, tenant_id: &TenantId) -> Duration;
}

/// A flat set of limit values, applied to every tenant alike.
#[derive(Debug, Clone)]
pub struct TenantLimits {
    pub ingestion_rate_bytes: f64,
    pub ingestion_burst_size_bytes: usize,
    pub ingestion_tenant_shard_size: usize,
    pub max_label_name_length: usize,
    pub max_label_value_length: usize,
    pub max_label_names_per_series: usize,
    pub max_profile_size_bytes: usize,
    pub max_profile_stacktrace_samples: usize,
    pub max_profile_stacktrace_depth: usize,
    pub max_profile_stacktrace_sample_labels: usize,
    pub max_profile_symbol_value_length: usize,
    pub max_sessions_per_series: usize,
    pub reject_older_than: Duration,
    pub reject_newer_than: Duration,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            ingestion_rate_bytes: (4 << 20) as f64,
            ingestion_burst_size_bytes: 2 << 20,
            ingestion_tenant_shard_size: 0,
            max_label_name_length: 1024,
            max_label_value_length: 2048,
            max_label_names_per_series: 30,
            max_profile_size_bytes: 4 << 20,
            max_profile_stacktrace_samples: 16_000,
            max_profile_stacktrace_depth: 1_000,
            max_profile_stacktrace_sample_labels: 100,
            max_profile_symbol_value_length: 65_535,
            max_sessions_per_series: 0,
            reject_older_than: Duration::from_secs(3600),
            reject_newer_than: Duration::from_secs(600),
        }
    }
}

macro_rules! forward_limit {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            fn $name(&self, tenant_id: &TenantId) -> $ty {
                self.tenant(tenant_id).$name
            }
        )*
    };
}

impl Limits for TenantLimits {
    forward_limit! {
        ingestion_rate_bytes: f64,
        ingestion_burst_size_bytes: usize,
        ingestion_tenant_shard_size: usize,
        max_label_name_length: usize,
        max_label_value_length: usize,
        max_label_names_per_series: usize,
        max_profile_size_bytes: usize,
        max_profile_stacktrace_samples: usize,
        max_profile_stacktrace_depth: usize,
        max_profile_stacktrace_sample_labels: usize,
        max_profile_symbol_value_length: usize,
        max_sessions_per_series: usize,
        reject_older_than: Duration,
        reject_newer_than: Duration,
    }
}

impl TenantLimits {
    fn tenant(&self, _tenant_id: &TenantId) -> &Self {
        self
    }
}

/// Per-tenant limit overrides layered over a default set.
#[derive(Debug, Clone, Default)]
pub struct PerTenantLimits {
    default: TenantLimits,
    overrides: HashMap<TenantId, TenantLimits>,
}

impl PerTenantLimits {
    pub fn new(default: TenantLimits) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<TenantId>, limits: TenantLimits) -> Self {
        self.overrides.insert(tenant_id.into(), limits);
        self
    }

    fn tenant(&self, tenant_id: &TenantId) -> &TenantLimits {
        self.overrides.get(tenant_id).unwrap_or(&self.default)
    }
}

impl Limits for PerTenantLimits {
    forward_limit! {
        ingestion_rate_bytes: f64,
        ingestion_burst_size_bytes: usize,
        ingestion_tenant_shard_size: usize,
        max_label_name_length: usize,
        max_label_value_length: usize,
        max_label_names_per_series: usize,
        max_profile_size_bytes: usize,
        max_profile_stacktrace_samples: usize,
        max_profile_stacktrace_depth: usize,
        max_profile_stacktrace_sample_labels: usize,
        max_profile_symbol_value_length: usize,
        max_sessions_per_series: usize,
        reject_older_than: Duration,
        reject_newer_than: Duration,
    }
}
