//! A pool of push clients keyed by ingester address.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use generated_types::pusher_service_client::PusherServiceClient;
use generated_types::PushRequest;
use hashbrown::HashMap;
use metric::U64Gauge;
use observability_deps::tracing::*;
use parking_lot::Mutex;
use profile_types::TenantId;
use thiserror::Error;
use tokio::task::JoinHandle;

/// The request metadata key carrying the tenant id to ingesters.
pub const TENANT_ID_HEADER: &str = "x-tenant-id";

/// Errors pushing to a single ingester.
#[derive(Debug, Error, Clone)]
pub enum RpcPushError {
    /// The upstream ingester returned an error response.
    #[error("upstream ingester error: {0}")]
    Upstream(#[from] tonic::Status),

    /// The RPC did not complete within the configured push timeout.
    #[error("timeout pushing to ingester {addr}")]
    Timeout { addr: String },

    /// Dialling the ingester failed.
    #[error("failed to connect to ingester {addr}: {message}")]
    Connect { addr: String, message: String },
}

/// An abstract client pushing profiles to one ingester.
#[async_trait]
pub trait PushClient: Send + Sync + Debug {
    /// Push `request` on behalf of `tenant_id` and wait for the response.
    async fn push(&self, tenant_id: &TenantId, request: PushRequest) -> Result<(), RpcPushError>;
}

/// Creates a [`PushClient`] for an ingester address on first use.
#[async_trait]
pub trait PushClientFactory: Send + Sync + Debug {
    async fn create(&self, addr: &str) -> Result<Arc<dyn PushClient>, RpcPushError>;
}

/// A [`PushClient`] over the tonic gRPC push service.
#[derive(Debug)]
pub struct GrpcPushClient {
    client: PusherServiceClient<tonic::transport::Channel>,
}

#[async_trait]
impl PushClient for GrpcPushClient {
    async fn push(&self, tenant_id: &TenantId, request: PushRequest) -> Result<(), RpcPushError> {
        let mut request = tonic::Request::new(request);
        let tenant = tonic::metadata::MetadataValue::try_from(tenant_id.as_str())
            .map_err(|_| tonic::Status::invalid_argument("tenant id is not valid metadata"))?;
        request.metadata_mut().insert(TENANT_ID_HEADER, tenant);

        // The generated client takes `&mut self` for connection reuse;
        // channels are cheap to clone and share the underlying connection.
        self.client.clone().push(request).await?;
        Ok(())
    }
}

/// The default [`PushClientFactory`], dialling plaintext gRPC.
#[derive(Debug, Default, Clone, Copy)]
pub struct GrpcPushClientFactory;

#[async_trait]
impl PushClientFactory for GrpcPushClientFactory {
    async fn create(&self, addr: &str) -> Result<Arc<dyn PushClient>, RpcPushError> {
        let client = PusherServiceClient::connect(format!("http://{addr}"))
            .await
            .map_err(|e| RpcPushError::Connect {
                addr: addr.to_owned(),
                message: e.to_string(),
            })?;
        Ok(Arc::new(GrpcPushClient { client }))
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Evict clients unused for this long.
    pub idle_timeout: Duration,
    /// How often the eviction pass runs.
    pub cleanup_period: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            cleanup_period: Duration::from_secs(15),
        }
    }
}

#[derive(Debug)]
struct PoolEntry {
    client: Arc<dyn PushClient>,
    last_used: Instant,
}

#[derive(Debug)]
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort()
    }
}

/// Lazily dials and caches one [`PushClient`] per ingester address.
///
/// Clients are shared between concurrent requests; entries idle longer than
/// [`PoolConfig::idle_timeout`] are evicted by a background task whose
/// lifetime is tied to the pool.
#[derive(Debug)]
pub struct IngesterPool {
    factory: Arc<dyn PushClientFactory>,
    clients: Arc<Mutex<HashMap<String, PoolEntry>>>,
    client_count: U64Gauge,
    _cleanup_task: AbortOnDrop,
}

impl IngesterPool {
    /// Create a pool dialling through `factory`, exporting the client count
    /// as the `distributor_ingester_clients` gauge.
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn PushClientFactory>,
        metrics: &metric::Registry,
    ) -> Self {
        let client_count = metrics
            .register_metric::<U64Gauge>(
                "distributor_ingester_clients",
                "the current number of ingester clients",
            )
            .recorder(&[]);

        let clients: Arc<Mutex<HashMap<String, PoolEntry>>> = Default::default();
        let cleanup_task = tokio::spawn(cleanup_loop(
            Arc::clone(&clients),
            client_count.clone(),
            config,
        ));

        Self {
            factory,
            clients,
            client_count,
            _cleanup_task: AbortOnDrop(cleanup_task),
        }
    }

    /// The pooled client for `addr`, dialling if none is cached.
    ///
    /// Concurrent first uses of the same address may dial more than once;
    /// one client wins the cache and the rest are dropped after their call.
    pub async fn client_for(&self, addr: &str) -> Result<Arc<dyn PushClient>, RpcPushError> {
        if let Some(entry) = self.clients.lock().get_mut(addr) {
            entry.last_used = Instant::now();
            return Ok(Arc::clone(&entry.client));
        }

        let client = self.factory.create(addr).await?;

        let mut clients = self.clients.lock();
        let entry = clients.entry_ref(addr).or_insert(PoolEntry {
            client,
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();
        let client = Arc::clone(&entry.client);
        self.client_count.set(clients.len() as u64);
        Ok(client)
    }

    /// The number of currently pooled clients.
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn cleanup_loop(
    clients: Arc<Mutex<HashMap<String, PoolEntry>>>,
    client_count: U64Gauge,
    config: PoolConfig,
) {
    let mut interval = tokio::time::interval(config.cleanup_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let mut clients = clients.lock();
        let before = clients.len();
        clients.retain(|_, entry| entry.last_used.elapsed() < config.idle_timeout);
        let evicted = before - clients.len();
        if evicted > 0 {
            debug!(evicted, remaining = clients.len(), "evicted idle ingester clients");
        }
        client_count.set(clients.len() as u64);
    }
}

/// Mock clients and factories for tests.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Default)]
    struct State {
        calls: Vec<(TenantId, PushRequest)>,
        ret: VecDeque<Result<(), RpcPushError>>,
    }

    /// A [`PushClient`] recording its calls and answering from a scripted
    /// queue (`Ok` once the queue is drained).
    #[derive(Debug, Default)]
    pub struct MockPushClient {
        state: Mutex<State>,
        hang: bool,
    }

    impl MockPushClient {
        /// A client that never completes its calls, as a peer that accepts
        /// the connection but stalls would.
        pub fn hanging() -> Self {
            Self {
                state: Default::default(),
                hang: true,
            }
        }

        pub fn with_ret(self, ret: impl Into<VecDeque<Result<(), RpcPushError>>>) -> Self {
            self.state.lock().ret = ret.into();
            self
        }

        /// The requests this mock received.
        pub fn calls(&self) -> Vec<(TenantId, PushRequest)> {
            self.state.lock().calls.clone()
        }
    }

    #[async_trait]
    impl PushClient for MockPushClient {
        async fn push(
            &self,
            tenant_id: &TenantId,
            request: PushRequest,
        ) -> Result<(), RpcPushError> {
            let ret = {
                let mut state = self.state.lock();
                state.calls.push((tenant_id.clone(), request));
                state.ret.pop_front().unwrap_or(Ok(()))
            };
            if self.hang {
                futures::future::pending::<()>().await;
            }
            ret
        }
    }

    /// A [`PushClientFactory`] handing out pre-registered mock clients.
    #[derive(Debug, Default)]
    pub struct MockPushClientFactory {
        clients: Mutex<HashMap<String, Arc<MockPushClient>>>,
        dials: Mutex<Vec<String>>,
    }

    impl MockPushClientFactory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_client(self, addr: impl Into<String>, client: Arc<MockPushClient>) -> Self {
            self.clients.lock().insert(addr.into(), client);
            self
        }

        /// Every address dialled, in order.
        pub fn dials(&self) -> Vec<String> {
            self.dials.lock().clone()
        }
    }

    #[async_trait]
    impl PushClientFactory for MockPushClientFactory {
        async fn create(&self, addr: &str) -> Result<Arc<dyn PushClient>, RpcPushError> {
            self.dials.lock().push(addr.to_owned());
            self.clients
                .lock()
                .get(addr)
                .map(|c| Arc::clone(c) as Arc<dyn PushClient>)
                .ok_or_else(|| RpcPushError::Connect {
                    addr: addr.to_owned(),
                    message: "no route to ingester".to_owned(),
                })
        }
    }
}
