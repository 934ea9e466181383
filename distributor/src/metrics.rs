//! Distributor instrumentation.

use metric::{
    Attributes, DurationHistogram, Metric, U64Counter, U64Gauge, U64Histogram, U64HistogramOptions,
};
use profile_types::TenantId;

use crate::validation::DiscardReason;

/// Byte-size histogram buckets, 4 KiB to 64 MiB.
const BYTE_SIZE_BUCKETS: [u64; 9] = [
    4 << 10,
    16 << 10,
    64 << 10,
    256 << 10,
    1 << 20,
    4 << 20,
    16 << 20,
    64 << 20,
    u64::MAX,
];

/// Sample-count histogram buckets.
const SAMPLE_COUNT_BUCKETS: [u64; 7] = [10, 100, 1_000, 10_000, 100_000, 1_000_000, u64::MAX];

#[derive(Debug)]
pub(crate) struct DistributorMetrics {
    pub(crate) received_compressed_bytes: Metric<U64Histogram>,
    pub(crate) received_decompressed_bytes: Metric<U64Histogram>,
    pub(crate) received_samples: Metric<U64Histogram>,
    pub(crate) discarded_profiles: Metric<U64Counter>,
    pub(crate) discarded_bytes: Metric<U64Counter>,
    pub(crate) replication_factor: U64Gauge,
    pub(crate) push_duration: Metric<DurationHistogram>,
}

impl DistributorMetrics {
    pub(crate) fn new(registry: &metric::Registry) -> Self {
        Self {
            received_compressed_bytes: registry.register_metric_with_options(
                "distributor_received_compressed_bytes",
                "the compressed size of pushed profiles",
                || U64HistogramOptions::new(BYTE_SIZE_BUCKETS),
            ),
            received_decompressed_bytes: registry.register_metric_with_options(
                "distributor_received_decompressed_bytes",
                "the decompressed size of pushed profiles",
                || U64HistogramOptions::new(BYTE_SIZE_BUCKETS),
            ),
            received_samples: registry.register_metric_with_options(
                "distributor_received_samples",
                "the number of samples per pushed profile",
                || U64HistogramOptions::new(SAMPLE_COUNT_BUCKETS),
            ),
            discarded_profiles: registry.register_metric(
                "distributor_discarded_profiles",
                "the number of discarded profiles, by reason",
            ),
            discarded_bytes: registry.register_metric(
                "distributor_discarded_bytes",
                "the number of discarded uncompressed bytes, by reason",
            ),
            replication_factor: registry
                .register_metric::<U64Gauge>(
                    "distributor_replication_factor",
                    "the configured replication factor",
                )
                .recorder(&[]),
            push_duration: registry.register_metric(
                "distributor_push_duration",
                "the duration of push requests, by result",
            ),
        }
    }

    /// Attributes labelling a per-profile-type, per-tenant observation.
    pub(crate) fn profile_attributes(profile_name: &str, tenant_id: &TenantId) -> Attributes {
        Attributes::from([
            ("type", profile_name.to_owned()),
            ("tenant", tenant_id.to_string()),
        ])
    }

    /// Bump the discard counters for `reason`.
    pub(crate) fn discarded(
        &self,
        reason: DiscardReason,
        tenant_id: &TenantId,
        profiles: u64,
        bytes: u64,
    ) {
        let attributes = Attributes::from([
            ("reason", reason.as_str().to_owned()),
            ("tenant", tenant_id.to_string()),
        ]);
        self.discarded_profiles.recorder(attributes.clone()).inc(profiles);
        self.discarded_bytes.recorder(attributes).inc(bytes);
    }
}
