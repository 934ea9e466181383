//! End-to-end tests of the push pipeline against mock ingesters.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use distributor::pool::mock::{MockPushClient, MockPushClientFactory};
use distributor::{Config, Distributor, PushContext, PushError, RpcPushError, TenantLimits};
use generated_types::{LabelPair, PushRequest, RawProfileSeries, RawSample};
use metric::{Observation, RawReporter};
use pprof_codec::{proto, RawProfile};
use shard_ring::{now_unix, HashRing, InstanceDesc, InstanceState, MemoryKv, ReadRing};
use tokio_util::sync::CancellationToken;

const TENANT: &str = "t1";

/// A pipeline under test plus its mock ingesters.
struct Harness {
    distributor: Distributor,
    ingesters: Vec<(String, Arc<MockPushClient>)>,
    registry: Arc<metric::Registry>,
}

struct HarnessBuilder {
    replication_factor: usize,
    ingesters: Vec<Arc<MockPushClient>>,
    limits: TenantLimits,
    cfg: Config,
    with_ring: bool,
}

impl HarnessBuilder {
    fn new(replication_factor: usize) -> Self {
        Self {
            replication_factor,
            ingesters: Vec::new(),
            limits: TenantLimits::default(),
            cfg: Config::default(),
            with_ring: false,
        }
    }

    fn ingester(mut self, client: MockPushClient) -> Self {
        self.ingesters.push(Arc::new(client));
        self
    }

    fn limits(mut self, limits: TenantLimits) -> Self {
        self.limits = limits;
        self
    }

    fn push_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.push_timeout = timeout;
        self
    }

    fn with_ring(mut self) -> Self {
        self.with_ring = true;
        self
    }

    async fn build(self) -> Harness {
        let n = self.ingesters.len() as u32;
        let mut factory = MockPushClientFactory::new();
        let mut ingesters = Vec::new();
        let ring_instances: Vec<_> = self
            .ingesters
            .iter()
            .enumerate()
            .map(|(i, client)| {
                let addr = format!("10.0.0.{i}:8080");
                factory = std::mem::take(&mut factory).with_client(addr.clone(), Arc::clone(client));
                ingesters.push((addr.clone(), Arc::clone(client)));
                (
                    format!("ingester-{i}"),
                    InstanceDesc {
                        addr,
                        state: InstanceState::Active,
                        zone: String::new(),
                        tokens: vec![i as u32 * (u32::MAX / n)],
                        heartbeat_unix: now_unix(),
                    },
                )
            })
            .collect();

        let ring = Arc::new(HashRing::with_instances(
            self.replication_factor,
            ring_instances,
        ));
        let registry = Arc::new(metric::Registry::new());
        let kv = self
            .with_ring
            .then(|| Arc::new(MemoryKv::new()) as Arc<dyn shard_ring::KvStore>);

        let distributor = Distributor::new(
            self.cfg,
            ring as Arc<dyn ReadRing>,
            Arc::new(factory),
            Arc::new(self.limits),
            kv,
            &registry,
        )
        .await
        .unwrap();

        Harness {
            distributor,
            ingesters,
            registry,
        }
    }
}

impl Harness {
    /// All recorded calls across ingesters, tagged with the ingester index.
    fn calls(&self) -> Vec<(usize, profile_types::TenantId, PushRequest)> {
        self.ingesters
            .iter()
            .enumerate()
            .flat_map(|(i, (_, client))| {
                client
                    .calls()
                    .into_iter()
                    .map(move |(tenant, req)| (i, tenant, req))
            })
            .collect()
    }

    fn discarded_bytes(&self, reason: &str) -> Option<u64> {
        let mut reporter = RawReporter::default();
        self.registry.report(&mut reporter);
        let counter = reporter.metric("distributor_discarded_bytes")?;
        let observation = counter.observation([
            ("reason", reason.to_owned()),
            ("tenant", TENANT.to_owned()),
        ])?;
        match observation {
            Observation::U64Counter(v) => Some(*v),
            _ => None,
        }
    }
}

/// A pprof payload with one unlabelled CPU sample.
fn cpu_profile() -> proto::Profile {
    proto::Profile {
        string_table: vec![
            "".into(),
            "cpu".into(),
            "nanoseconds".into(),
            "main".into(),
        ],
        sample_type: vec![proto::ValueType { r#type: 1, unit: 2 }],
        function: vec![proto::Function {
            id: 1,
            name: 3,
            system_name: 3,
            ..Default::default()
        }],
        location: vec![proto::Location {
            id: 1,
            line: vec![proto::Line {
                function_id: 1,
                line: 7,
            }],
            ..Default::default()
        }],
        sample: vec![proto::Sample {
            location_id: vec![1],
            value: vec![100],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// A payload whose samples carry `span_id=a` / `span_id=b` labels plus one
/// unlabelled sample.
fn span_labelled_profile() -> proto::Profile {
    let mut p = cpu_profile();
    p.string_table.extend(["span_id".into(), "a".into(), "b".into()]);
    p.sample = vec![
        proto::Sample {
            location_id: vec![1],
            value: vec![100],
            label: vec![proto::Label {
                key: 4,
                str: 5,
                ..Default::default()
            }],
        },
        proto::Sample {
            location_id: vec![1],
            value: vec![200],
            label: vec![proto::Label {
                key: 4,
                str: 6,
                ..Default::default()
            }],
        },
        proto::Sample {
            location_id: vec![1],
            value: vec![300],
            label: vec![],
        },
    ];
    p
}

fn gzipped(profile: &proto::Profile) -> Bytes {
    let mut buf = Vec::new();
    RawProfile::from_proto(profile.clone())
        .write_gzipped(&mut buf)
        .unwrap();
    Bytes::from(buf)
}

fn wire_request(labels: &[(&str, &str)], profile: &proto::Profile) -> PushRequest {
    PushRequest {
        series: vec![RawProfileSeries {
            labels: labels
                .iter()
                .map(|(name, value)| LabelPair {
                    name: (*name).to_owned(),
                    value: (*value).to_owned(),
                })
                .collect(),
            samples: vec![RawSample {
                raw_profile: gzipped(profile),
                id: String::new(),
            }],
        }],
    }
}

fn ctx() -> PushContext {
    PushContext::new(TENANT)
}

#[tokio::test]
async fn test_push_replicates_to_all_replicas() {
    let harness = HarnessBuilder::new(3)
        .ingester(MockPushClient::default())
        .ingester(MockPushClient::default())
        .ingester(MockPushClient::default())
        .build()
        .await;

    let response = harness
        .distributor
        .push(&ctx(), wire_request(&[("__name__", "cpu")], &cpu_profile()))
        .await;
    assert_matches!(response, Ok(_));

    // Wait for the in-flight replicas to land: the push returns at quorum.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while harness.calls().len() < 3 {
        assert!(std::time::Instant::now() < deadline, "replicas never landed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for (_, tenant, request) in harness.calls() {
        assert_eq!(tenant.as_str(), TENANT);
        assert_eq!(request.series.len(), 1);
        let series = &request.series[0];

        // Labels are canonical: sorted, with service_name synthesized.
        let names: Vec<_> = series.labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["__name__", "service_name"]);
        assert_eq!(series.labels[1].value, "unspecified");

        // Samples carry a fresh UUID and a decodable payload.
        assert_eq!(series.samples.len(), 1);
        let sample = &series.samples[0];
        assert!(uuid::Uuid::parse_str(&sample.id).is_ok());
        let decoded = RawProfile::parse(&sample.raw_profile).unwrap();
        assert_eq!(decoded.sample_count(), 1);
    }
}

#[tokio::test]
async fn test_push_succeeds_with_one_hanging_replica() {
    // RF 3 tolerates one failure: two fast acks reach the quorum while the
    // third replica hangs until its timeout.
    let harness = HarnessBuilder::new(3)
        .ingester(MockPushClient::default())
        .ingester(MockPushClient::hanging())
        .ingester(MockPushClient::default())
        .push_timeout(Duration::from_millis(100))
        .build()
        .await;

    let response = harness
        .distributor
        .push(&ctx(), wire_request(&[("__name__", "cpu")], &cpu_profile()))
        .await;
    assert_matches!(response, Ok(_));
}

#[tokio::test]
async fn test_push_fails_when_quorum_unreachable() {
    // RF 3, max_errors 1: two failing replicas exceed the budget and the
    // upstream error surfaces.
    let failing = || {
        MockPushClient::default().with_ret(vec![Err(RpcPushError::Upstream(
            tonic::Status::internal("disk full"),
        ))])
    };
    let harness = HarnessBuilder::new(3)
        .ingester(failing())
        .ingester(failing())
        .ingester(MockPushClient::default())
        .build()
        .await;

    let response = harness
        .distributor
        .push(&ctx(), wire_request(&[("__name__", "cpu")], &cpu_profile()))
        .await;
    assert_matches!(
        response,
        Err(PushError::Ingester(RpcPushError::Upstream(status))) => {
            assert_eq!(status.code(), tonic::Code::Internal);
        }
    );
}

#[tokio::test]
async fn test_push_without_tenant_is_unauthenticated() {
    let harness = HarnessBuilder::new(1)
        .ingester(MockPushClient::default())
        .build()
        .await;

    let response = harness
        .distributor
        .push(
            &PushContext::unauthenticated(),
            wire_request(&[("__name__", "cpu")], &cpu_profile()),
        )
        .await;
    assert_matches!(response, Err(PushError::Unauthenticated));
}

#[tokio::test]
async fn test_empty_push_is_invalid() {
    let harness = HarnessBuilder::new(1)
        .ingester(MockPushClient::default())
        .build()
        .await;

    let response = harness
        .distributor
        .push(&ctx(), PushRequest { series: vec![] })
        .await;
    assert_matches!(response, Err(PushError::NoProfiles));
    assert_eq!(
        tonic::Status::from(response.unwrap_err()).code(),
        tonic::Code::InvalidArgument
    );
}

#[tokio::test]
async fn test_malformed_payload_is_invalid() {
    let harness = HarnessBuilder::new(1)
        .ingester(MockPushClient::default())
        .build()
        .await;

    let request = PushRequest {
        series: vec![RawProfileSeries {
            labels: vec![],
            samples: vec![RawSample {
                raw_profile: Bytes::from_static(b"not a profile"),
                id: String::new(),
            }],
        }],
    };
    let response = harness.distributor.push(&ctx(), request).await;
    assert_matches!(response, Err(PushError::Malformed(_)));
}

#[tokio::test]
async fn test_rate_limit_denial_updates_discard_counters() {
    let harness = HarnessBuilder::new(1)
        .ingester(MockPushClient::default())
        .limits(TenantLimits {
            ingestion_rate_bytes: 1000.0,
            ingestion_burst_size_bytes: 1000,
            ..Default::default()
        })
        .build()
        .await;

    // Push enough samples that the uncompressed size exceeds the burst.
    let mut request = wire_request(&[("__name__", "cpu")], &cpu_profile());
    let sample = request.series[0].samples[0].clone();
    for _ in 0..32 {
        request.series[0].samples.push(sample.clone());
    }

    let response = harness.distributor.push(&ctx(), request).await;
    let attempted = assert_matches!(
        response,
        Err(PushError::RateLimited {
            limit_bytes,
            attempted_bytes,
        }) => {
            assert_eq!(limit_bytes, 1000.0);
            assert!(attempted_bytes > 1000);
            attempted_bytes
        }
    );

    // Denied bytes are accounted under the rate_limited reason.
    assert_eq!(
        harness.discarded_bytes("rate_limited"),
        Some(attempted as u64)
    );

    // Nothing reached any ingester.
    assert!(harness.calls().is_empty());
}

#[tokio::test]
async fn test_session_id_reduced_modulo_budget() {
    let harness = HarnessBuilder::new(1)
        .ingester(MockPushClient::default())
        .limits(TenantLimits {
            max_sessions_per_series: 8,
            ..Default::default()
        })
        .build()
        .await;

    let response = harness
        .distributor
        .push(
            &ctx(),
            wire_request(
                &[("__name__", "cpu"), ("session_id", "42")],
                &cpu_profile(),
            ),
        )
        .await;
    assert_matches!(response, Ok(_));

    let calls = harness.calls();
    let labels = &calls[0].2.series[0].labels;
    let session = labels.iter().find(|l| l.name == "session_id").unwrap();
    // 0x42 % 8 == 2, rendered in the same hexadecimal form.
    assert_eq!(session.value, "2");
}

#[tokio::test]
async fn test_session_id_dropped_when_sessions_disabled() {
    let harness = HarnessBuilder::new(1)
        .ingester(MockPushClient::default())
        .build()
        .await;

    let response = harness
        .distributor
        .push(
            &ctx(),
            wire_request(
                &[("__name__", "cpu"), ("session_id", "42")],
                &cpu_profile(),
            ),
        )
        .await;
    assert_matches!(response, Ok(_));

    let calls = harness.calls();
    let labels = &calls[0].2.series[0].labels;
    assert!(!labels.iter().any(|l| l.name == "session_id"));
}

#[tokio::test]
async fn test_push_splits_series_by_span_id() {
    let harness = HarnessBuilder::new(1)
        .ingester(MockPushClient::default())
        .build()
        .await;

    let response = harness
        .distributor
        .push(
            &ctx(),
            wire_request(&[("__name__", "cpu")], &span_labelled_profile()),
        )
        .await;
    assert_matches!(response, Ok(_));

    // All series land on the single ingester: two span-labelled series plus
    // the unlabelled remainder, possibly over multiple requests.
    let calls = harness.calls();
    let all_series: Vec<&RawProfileSeries> =
        calls.iter().flat_map(|(_, _, req)| &req.series).collect();
    assert_eq!(all_series.len(), 3);

    let mut span_values: Vec<Option<String>> = all_series
        .iter()
        .map(|s| {
            s.labels
                .iter()
                .find(|l| l.name == "span_id")
                .map(|l| l.value.clone())
        })
        .collect();
    span_values.sort();
    assert_eq!(
        span_values,
        vec![None, Some("a".to_owned()), Some("b".to_owned())]
    );

    // Sample counts are preserved across the split.
    let total: usize = all_series
        .iter()
        .flat_map(|s| &s.samples)
        .map(|s| RawProfile::parse(&s.raw_profile).unwrap().sample_count())
        .sum();
    assert_eq!(total, 3);
}

#[tokio::test]
async fn test_unlabelled_profile_roundtrips() {
    let harness = HarnessBuilder::new(1)
        .ingester(MockPushClient::default())
        .build()
        .await;

    let profile = cpu_profile();
    let response = harness
        .distributor
        .push(&ctx(), wire_request(&[("__name__", "cpu")], &profile))
        .await;
    assert_matches!(response, Ok(_));

    // A profile with no sample labels passes through the split unchanged:
    // the delivered payload decodes to the original (normalised) profile.
    let calls = harness.calls();
    let delivered = RawProfile::parse(&calls[0].2.series[0].samples[0].raw_profile).unwrap();
    let mut expected = RawProfile::from_proto(profile);
    expected.normalize();
    assert_eq!(delivered.profile(), expected.profile());
}

#[tokio::test]
async fn test_tenant_shard_size_pins_series_to_subring() {
    let harness = HarnessBuilder::new(1)
        .ingester(MockPushClient::default())
        .ingester(MockPushClient::default())
        .ingester(MockPushClient::default())
        .ingester(MockPushClient::default())
        .limits(TenantLimits {
            ingestion_tenant_shard_size: 1,
            ..Default::default()
        })
        .build()
        .await;

    // Several distinct series, all forced onto the tenant's 1-instance
    // shard.
    for name in ["cpu", "heap", "mutex", "goroutine"] {
        let response = harness
            .distributor
            .push(&ctx(), wire_request(&[("__name__", name)], &cpu_profile()))
            .await;
        assert_matches!(response, Ok(_));
    }

    let used: std::collections::HashSet<usize> =
        harness.calls().iter().map(|(i, _, _)| *i).collect();
    assert_eq!(used.len(), 1, "all series must land on the tenant's shard");
}

#[tokio::test]
async fn test_cancellation_returns_early_without_aborting_replication() {
    let harness = HarnessBuilder::new(1)
        .ingester(MockPushClient::hanging())
        .push_timeout(Duration::from_secs(30))
        .build()
        .await;

    let cancel = CancellationToken::new();
    let push_ctx = PushContext::new(TENANT).with_cancellation(cancel.clone());

    let request = wire_request(&[("__name__", "cpu")], &cpu_profile());
    let push = harness.distributor.push(&push_ctx, request);
    tokio::pin!(push);

    // The push blocks on the hanging replica until the caller goes away.
    tokio::select! {
        _ = &mut push => panic!("push completed with a hanging replica"),
        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
    }
    cancel.cancel();

    let response = push.await;
    assert_matches!(response, Err(PushError::Cancelled));

    // The replica RPC was dispatched and is still owned by the detached
    // task, not the caller.
    assert_eq!(harness.calls().len(), 1);
}

#[tokio::test]
async fn test_distributor_with_ring_counts_itself() {
    let harness = HarnessBuilder::new(1)
        .ingester(MockPushClient::default())
        .with_ring()
        .build()
        .await;

    assert_eq!(harness.distributor.healthy_instances_count(), 1);

    let response = harness
        .distributor
        .push(&ctx(), wire_request(&[("__name__", "cpu")], &cpu_profile()))
        .await;
    assert_matches!(response, Ok(_));

    harness.distributor.shutdown().await;
}

#[tokio::test]
async fn test_ring_status_page() {
    let with_ring = HarnessBuilder::new(1)
        .ingester(MockPushClient::default())
        .with_ring()
        .build()
        .await;
    let body = hyper::body::to_bytes(with_ring.distributor.ring_status().into_body())
        .await
        .unwrap();
    assert!(std::str::from_utf8(&body).unwrap().contains("ACTIVE"));
    with_ring.distributor.shutdown().await;

    let without_ring = HarnessBuilder::new(1)
        .ingester(MockPushClient::default())
        .build()
        .await;
    let body = hyper::body::to_bytes(without_ring.distributor.ring_status().into_body())
        .await
        .unwrap();
    assert!(std::str::from_utf8(&body)
        .unwrap()
        .contains("not running with global limits"));
}
