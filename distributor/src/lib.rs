//! The profile ingestion distributor: the first hop of the profiling
//! write path.
//!
//! [`Distributor::push`] validates, normalises and splits pushed profile
//! payloads, enforces per-tenant rate limits divided across the distributor
//! fleet, selects ingesters for every resulting series from a
//! consistent-hash ring, and replicates each series to its replication set,
//! acknowledging the client once every series reaches its write quorum.
//!
//! ```text
//! client ──> push ──> validate ──> rate limit ──> split ──> tokenize
//!                                                              │
//!            response <── quorum wait <── fan-out <── shard-select
//! ```
//!
//! Replication tasks are detached from the calling request: a client that
//! disconnects mid-push does not abort in-flight replicas, only the
//! per-push timeout does. This asymmetry is deliberate - client-visible
//! liveness must not compromise replica agreement.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use generated_types::{PushRequest, PushResponse};
use hashbrown::HashMap;
use hyper::{Body, Response};
use observability_deps::tracing::*;
use profile_types::{
    Labels, ProfileSample, ProfileSeries, SessionId, TenantId, LABEL_NAME_PROFILE,
    LABEL_NAME_SERVICE, LABEL_NAME_SESSION, SERVICE_NAME_UNSPECIFIED,
};
use shard_ring::{
    token_for, HealthyInstanceCounter, InstanceDesc, KvError, KvStore, Lifecycler,
    LifecyclerConfig, Op, ReadRing, RingError,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod http;
pub mod limits;
mod metrics;
pub mod pool;
mod quorum;
pub mod rate_limiter;
mod split;
pub mod validation;

pub use limits::{Limits, PerTenantLimits, TenantLimits};
pub use pool::{
    GrpcPushClientFactory, IngesterPool, PoolConfig, PushClient, PushClientFactory, RpcPushError,
};

use metrics::DistributorMetrics;
use quorum::{PushTracker, SeriesTracker};
use rate_limiter::{GlobalRateStrategy, RateLimiter, RATE_RECHECK_PERIOD};
use validation::{validate_profile, validate_series_labels, DiscardReason};

/// Distributor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Timeout of a single ingester push RPC, including the dial.
    pub push_timeout: Duration,
    pub pool: PoolConfig,
    /// Membership configuration of the distributor ring.
    pub ring: LifecyclerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            push_timeout: Duration::from_secs(5),
            pool: PoolConfig::default(),
            ring: LifecyclerConfig::default(),
        }
    }
}

/// Request-scoped context handed to [`Distributor::push`].
///
/// Tenant extraction from transport credentials happens in the server
/// interceptor; cancellation is signalled by the server when the caller
/// goes away.
#[derive(Debug, Default)]
pub struct PushContext {
    tenant_id: Option<TenantId>,
    cancel: CancellationToken,
}

impl PushContext {
    pub fn new(tenant_id: impl Into<TenantId>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            cancel: CancellationToken::new(),
        }
    }

    /// A context with no tenant identity attached.
    pub fn unauthenticated() -> Self {
        Self::default()
    }

    /// Attach a cancellation token tracking the caller's liveness.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }
}

/// Errors returned by [`Distributor::push`].
#[derive(Debug, Error)]
pub enum PushError {
    /// The request context carries no tenant id.
    #[error("no tenant id in request context")]
    Unauthenticated,

    /// A pushed payload did not decode as a pprof profile.
    #[error("malformed profile: {0}")]
    Malformed(#[from] pprof_codec::DecodeError),

    /// A profile or series violated the tenant's validation limits.
    #[error(transparent)]
    Validation(#[from] validation::ValidationError),

    /// The request contained no profiles at all.
    #[error("no profiles received")]
    NoProfiles,

    /// The tenant's ingestion rate limit denied the request.
    #[error(
        "push rate limit ({}) exceeded while adding {}",
        format_ibytes(*.limit_bytes),
        format_ibytes(*.attempted_bytes as f64)
    )]
    RateLimited {
        limit_bytes: f64,
        attempted_bytes: usize,
    },

    /// Instance selection from the ingester ring failed.
    #[error(transparent)]
    Ring(#[from] RingError),

    /// Replication failed: a series exceeded its failure budget, and this
    /// is the error its last failing ingester reported.
    #[error(transparent)]
    Ingester(#[from] RpcPushError),

    /// Re-encoding a split profile failed.
    #[error("error re-encoding profile: {0}")]
    Encode(#[from] pprof_codec::EncodeError),

    /// The caller's context was cancelled while waiting for the quorum.
    #[error("request cancelled")]
    Cancelled,
}

impl PushError {
    /// The wire status code for this error.
    pub fn code(&self) -> tonic::Code {
        match self {
            Self::Unauthenticated => tonic::Code::Unauthenticated,
            Self::Malformed(_) | Self::Validation(_) | Self::NoProfiles => {
                tonic::Code::InvalidArgument
            }
            Self::RateLimited { .. } => tonic::Code::ResourceExhausted,
            Self::Ring(_) => tonic::Code::Unavailable,
            Self::Ingester(RpcPushError::Upstream(status)) => status.code(),
            Self::Ingester(RpcPushError::Timeout { .. }) => tonic::Code::DeadlineExceeded,
            Self::Ingester(RpcPushError::Connect { .. }) => tonic::Code::Unavailable,
            Self::Encode(_) => tonic::Code::Internal,
            Self::Cancelled => tonic::Code::DeadlineExceeded,
        }
    }
}

impl From<PushError> for tonic::Status {
    fn from(err: PushError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

/// Coordinates replication and distribution of pushed profiles.
#[derive(Debug)]
pub struct Distributor {
    cfg: Config,
    limits: Arc<dyn Limits>,
    ingesters_ring: Arc<dyn ReadRing>,
    pool: Arc<IngesterPool>,
    /// Present only when running with global limits; feeds the healthy
    /// instance count.
    lifecycler: Option<Lifecycler>,
    healthy_instances: Arc<HealthyInstanceCounter>,
    ingestion_rate_limiter: RateLimiter,
    metrics: DistributorMetrics,
}

impl Distributor {
    /// Create a distributor pushing to instances of `ingesters_ring`.
    ///
    /// With a KV store the distributor joins the distributor ring under
    /// `cfg.ring` and divides tenant rate limits across the healthy fleet;
    /// without one it runs stand-alone and applies the full limits itself.
    pub async fn new(
        cfg: Config,
        ingesters_ring: Arc<dyn ReadRing>,
        factory: Arc<dyn PushClientFactory>,
        limits: Arc<dyn Limits>,
        kv: Option<Arc<dyn KvStore>>,
        registry: &metric::Registry,
    ) -> Result<Self, KvError> {
        let metrics = DistributorMetrics::new(registry);
        metrics
            .replication_factor
            .set(ingesters_ring.replication_factor() as u64);

        let pool = Arc::new(IngesterPool::new(cfg.pool, factory, registry));

        let healthy_instances = Arc::new(HealthyInstanceCounter::new(cfg.ring.heartbeat_timeout));
        let lifecycler = match kv {
            Some(kv) => Some(
                Lifecycler::spawn(
                    cfg.ring.clone(),
                    kv,
                    vec![Arc::clone(&healthy_instances) as _],
                )
                .await?,
            ),
            None => None,
        };

        let ingestion_rate_limiter = RateLimiter::new(
            Arc::new(GlobalRateStrategy::new(
                Arc::clone(&limits),
                Arc::clone(&healthy_instances),
            )),
            RATE_RECHECK_PERIOD,
        );

        Ok(Self {
            cfg,
            limits,
            ingesters_ring,
            pool,
            lifecycler,
            healthy_instances,
            ingestion_rate_limiter,
            metrics,
        })
    }

    /// The number of healthy distributor instances in the ring.
    ///
    /// Each instance admits `global_rate / healthy_instances` of a tenant's
    /// budget.
    pub fn healthy_instances_count(&self) -> u32 {
        self.healthy_instances.count()
    }

    /// Serve the ring status page.
    pub fn ring_status(&self) -> Response<Body> {
        http::ring_status_page(self.lifecycler.as_ref().map(|l| l.ring_desc()))
    }

    /// Leave the distributor ring and release background tasks.
    pub async fn shutdown(self) {
        if let Some(lifecycler) = self.lifecycler {
            lifecycler.shutdown().await;
        }
    }

    /// Push a wire-format request: decode every payload, then run the
    /// parsed pipeline.
    pub async fn push(
        &self,
        ctx: &PushContext,
        req: PushRequest,
    ) -> Result<PushResponse, PushError> {
        let mut parsed = profile_types::PushRequest {
            series: Vec::with_capacity(req.series.len()),
            ..Default::default()
        };

        for wire_series in req.series {
            let mut series = ProfileSeries {
                labels: Labels::from(wire_series.labels),
                samples: Vec::with_capacity(wire_series.samples.len()),
            };
            for wire_sample in wire_series.samples {
                let profile = pprof_codec::RawProfile::parse(&wire_sample.raw_profile)?;
                parsed.raw_profile_size += wire_sample.raw_profile.len();
                series.samples.push(ProfileSample {
                    profile,
                    raw_profile: wire_sample.raw_profile,
                    id: wire_sample.id,
                });
            }
            parsed.series.push(series);
        }

        self.push_parsed(ctx, parsed).await
    }

    /// Push an already-decoded request.
    ///
    /// Ingest adapters for compound formats (jfr, otel) decode into the
    /// request model themselves and enter the pipeline here.
    pub async fn push_parsed(
        &self,
        ctx: &PushContext,
        req: profile_types::PushRequest,
    ) -> Result<PushResponse, PushError> {
        let start = Instant::now();
        let result = self.push_parsed_inner(ctx, req).await;
        let outcome = if result.is_ok() { "success" } else { "error" };
        self.metrics
            .push_duration
            .recorder(&[("result", outcome)])
            .record(start.elapsed());
        result
    }

    async fn push_parsed_inner(
        &self,
        ctx: &PushContext,
        mut req: profile_types::PushRequest,
    ) -> Result<PushResponse, PushError> {
        let tenant_id = ctx.tenant_id().ok_or(PushError::Unauthenticated)?.clone();
        let now_nanos = unix_now_nanos();

        // Bring every series' labels into canonical form.
        for series in &mut req.series {
            if !series.labels.contains(LABEL_NAME_SERVICE) {
                series
                    .labels
                    .push(LABEL_NAME_SERVICE, SERVICE_NAME_UNSPECIFIED);
            }
            self.limit_session_labels(&tenant_id, &mut series.labels);
            series.labels.sort();
        }

        // Size accounting and per-profile validation.
        let have_raw_pprof = req.raw_profile_type == profile_types::RawProfileType::Pprof;
        if !have_raw_pprof {
            // Compound formats compress all profile types together, so
            // compressed bytes can only be attributed per request.
            self.metrics
                .received_compressed_bytes
                .recorder(DistributorMetrics::profile_attributes(
                    req.raw_profile_type.as_str(),
                    &tenant_id,
                ))
                .record(req.raw_profile_size as u64);
        }

        let mut total_uncompressed_bytes = 0usize;
        let mut total_profiles = 0u64;
        for series in &req.series {
            for label in &series.labels {
                total_uncompressed_bytes += label.name.len() + label.value.len();
            }
            let profile_name = series.labels.get(LABEL_NAME_PROFILE).unwrap_or("");
            let attributes = DistributorMetrics::profile_attributes(profile_name, &tenant_id);

            for sample in &series.samples {
                if have_raw_pprof {
                    self.metrics
                        .received_compressed_bytes
                        .recorder(attributes.clone())
                        .record(sample.raw_profile.len() as u64);
                }
                total_profiles += 1;

                let decompressed_size = sample.profile.size_bytes();
                self.metrics
                    .received_decompressed_bytes
                    .recorder(attributes.clone())
                    .record(decompressed_size as u64);
                self.metrics
                    .received_samples
                    .recorder(attributes.clone())
                    .record(sample.profile.sample_count() as u64);
                total_uncompressed_bytes += decompressed_size;

                if let Err(error) = validate_profile(
                    &*self.limits,
                    &tenant_id,
                    &sample.profile,
                    decompressed_size,
                    now_nanos,
                ) {
                    debug!(%error, %tenant_id, "invalid profile");
                    self.metrics.discarded(
                        error.reason(),
                        &tenant_id,
                        total_profiles,
                        total_uncompressed_bytes as u64,
                    );
                    return Err(error.into());
                }
            }
        }

        if total_profiles == 0 {
            return Err(PushError::NoProfiles);
        }

        if !self
            .ingestion_rate_limiter
            .allow_n(Instant::now(), &tenant_id, total_uncompressed_bytes)
        {
            self.metrics.discarded(
                DiscardReason::RateLimited,
                &tenant_id,
                total_profiles,
                total_uncompressed_bytes as u64,
            );
            return Err(PushError::RateLimited {
                limit_bytes: self.limits.ingestion_rate_bytes(&tenant_id),
                attempted_bytes: total_uncompressed_bytes,
            });
        }

        // Split series by sample labels, then re-validate the resulting
        // label sets and derive their ring tokens.
        let mut series_list = split::extract_sample_series(req);
        let mut tokens = Vec::with_capacity(series_list.len());
        for series in &series_list {
            if let Err(error) = validate_series_labels(&*self.limits, &tenant_id, &series.labels) {
                self.metrics.discarded(
                    error.reason(),
                    &tenant_id,
                    total_profiles,
                    total_uncompressed_bytes as u64,
                );
                return Err(error.into());
            }
            tokens.push(token_for(tenant_id.as_str(), &series.labels.to_string()));
        }

        // Re-serialise the (possibly transformed) profiles into their
        // transport payloads and give every sample a fresh id.
        for series in &mut series_list {
            for sample in &mut series.samples {
                let mut buf = Vec::with_capacity(sample.raw_profile.len().max(128));
                sample.profile.write_gzipped(&mut buf)?;
                sample.id = Uuid::new_v4().to_string();
                sample.raw_profile = Bytes::from(buf);
            }
        }

        // Select a replication set per series and invert the relation into
        // per-ingester batches.
        let shard_size = self.limits.ingestion_tenant_shard_size(&tenant_id);
        let series_count = series_list.len();
        let mut series_by_ingester: HashMap<String, Vec<Arc<SeriesTracker>>> = HashMap::new();
        let mut ingester_descs: HashMap<String, InstanceDesc> = HashMap::new();
        for (series, token) in series_list.into_iter().zip(tokens) {
            let subring = self
                .ingesters_ring
                .shuffle_shard(tenant_id.as_str(), shard_size);
            let set = subring.get(token, Op::Write)?;
            let tracker = Arc::new(SeriesTracker::new(
                series,
                set.min_success(),
                set.max_errors,
            ));
            for instance in set.instances {
                series_by_ingester
                    .entry(instance.addr.clone())
                    .or_default()
                    .push(Arc::clone(&tracker));
                ingester_descs.insert(instance.addr.clone(), instance);
            }
        }

        let (push_tracker, mut done_rx, mut err_rx) = PushTracker::new(series_count);
        for (addr, trackers) in series_by_ingester {
            let Some(instance) = ingester_descs.remove(&addr) else {
                continue;
            };
            // Detached on purpose: replication must finish (or time out)
            // even if this caller returns early.
            tokio::spawn(
                send_profiles(
                    Arc::clone(&self.pool),
                    instance,
                    trackers,
                    Arc::clone(&push_tracker),
                    self.cfg.push_timeout,
                    tenant_id.clone(),
                )
                .instrument(Span::current()),
            );
        }

        tokio::select! {
            Some(err) = err_rx.recv() => Err(err.into()),
            Some(()) = done_rx.recv() => Ok(PushResponse::default()),
            _ = ctx.cancel.cancelled() => Err(PushError::Cancelled),
        }
    }

    /// Constrain the `session_id` label to the tenant's session budget:
    /// dropped entirely when sessions are disabled, otherwise reduced
    /// modulo the budget, preserving the hexadecimal form.
    fn limit_session_labels(&self, tenant_id: &TenantId, labels: &mut Labels) {
        let max_sessions = self.limits.max_sessions_per_series(tenant_id);
        if max_sessions == 0 {
            labels.delete(LABEL_NAME_SESSION);
            return;
        }
        let parsed = match labels.get(LABEL_NAME_SESSION) {
            None => return,
            Some(value) => value.parse::<SessionId>(),
        };
        match parsed {
            Ok(session) => labels.set(
                LABEL_NAME_SESSION,
                SessionId(session.0 % max_sessions as u64).to_string(),
            ),
            Err(error) => {
                debug!(%error, %tenant_id, "invalid session_id label");
                labels.delete(LABEL_NAME_SESSION);
            }
        }
    }
}

/// Push one ingester's batch and report the outcome to the quorum tracker.
async fn send_profiles(
    pool: Arc<IngesterPool>,
    ingester: InstanceDesc,
    trackers: Vec<Arc<SeriesTracker>>,
    push_tracker: Arc<PushTracker>,
    push_timeout: Duration,
    tenant_id: TenantId,
) {
    let request = PushRequest {
        series: trackers.iter().map(|t| t.to_wire()).collect(),
    };

    let result = tokio::time::timeout(push_timeout, async {
        let client = pool.client_for(&ingester.addr).await?;
        client.push(&tenant_id, request).await
    })
    .await
    .unwrap_or_else(|_| {
        Err(RpcPushError::Timeout {
            addr: ingester.addr.clone(),
        })
    });

    if let Err(error) = &result {
        warn!(%error, ingester = %ingester.addr, "failed to push profiles to ingester");
    }
    push_tracker.observe(&trackers, &result);
}

fn unix_now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Render a byte quantity in binary units, e.g. `2.0 MiB`.
fn format_ibytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", value.round() as u64)
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
