//! Membership lifecycle: registration, heartbeats and departure.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use observability_deps::tracing::*;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{now_unix, InstanceDesc, InstanceState, KvError, KvStore, RingDesc};

/// Configuration of a ring [`Lifecycler`].
#[derive(Debug, Clone)]
pub struct LifecyclerConfig {
    /// The key the ring is stored under in the KV backend.
    pub ring_key: String,
    /// The unique id this instance registers as.
    pub instance_id: String,
    /// The address peers reach this instance on.
    pub instance_addr: String,
    /// The availability zone, or empty when zone-awareness is unused.
    pub zone: String,
    /// How many ring tokens to claim on registration.
    pub num_tokens: usize,
    /// How often the instance renews its heartbeat.
    pub heartbeat_period: Duration,
    /// How stale a heartbeat may be before peers consider the instance
    /// unhealthy.
    pub heartbeat_timeout: Duration,
    /// Peers with heartbeats older than `auto_forget_periods ×
    /// heartbeat_timeout` are removed from the ring.
    pub auto_forget_periods: u32,
}

impl Default for LifecyclerConfig {
    fn default() -> Self {
        Self {
            ring_key: "distributor".to_owned(),
            instance_id: "localhost".to_owned(),
            instance_addr: "127.0.0.1:0".to_owned(),
            zone: String::new(),
            num_tokens: 64,
            heartbeat_period: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(60),
            auto_forget_periods: 10,
        }
    }
}

impl LifecyclerConfig {
    fn forget_after(&self) -> Duration {
        self.heartbeat_timeout * self.auto_forget_periods
    }
}

/// Observes every ring view the lifecycler publishes.
pub trait RingObserver: Send + Sync + Debug {
    fn ring_updated(&self, desc: &RingDesc);
}

/// A [`RingObserver`] tracking how many ring members are healthy.
///
/// The count feeds the global rate limiter: each distributor admits
/// `global_rate / healthy_count` of the tenant's budget.
#[derive(Debug)]
pub struct HealthyInstanceCounter {
    count: AtomicU32,
    heartbeat_timeout: Duration,
}

impl HealthyInstanceCounter {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            count: AtomicU32::new(0),
            heartbeat_timeout,
        }
    }

    /// The number of healthy instances in the last observed ring view.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

impl RingObserver for HealthyInstanceCounter {
    fn ring_updated(&self, desc: &RingDesc) {
        let healthy = desc.healthy_count(self.heartbeat_timeout, now_unix()) as u32;
        self.count.store(healthy, Ordering::Relaxed);
    }
}

/// Maintains this instance's presence in a KV-backed ring.
///
/// On spawn the instance registers itself ACTIVE with freshly generated
/// tokens. A background task renews the heartbeat every `heartbeat_period`
/// and removes peers whose heartbeat lapsed the auto-forget horizon. On
/// [`Lifecycler::shutdown`] the instance transitions to LEAVING and then
/// removes its entry.
#[derive(Debug)]
pub struct Lifecycler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    ring_rx: watch::Receiver<RingDesc>,
    instance_id: String,
}

impl Lifecycler {
    /// Register in the ring and start the heartbeat task.
    pub async fn spawn(
        cfg: LifecyclerConfig,
        kv: Arc<dyn KvStore>,
        observers: Vec<Arc<dyn RingObserver>>,
    ) -> Result<Self, KvError> {
        let tokens = generate_tokens(cfg.num_tokens);

        let desc = register(&cfg, &*kv, &tokens).await?;
        info!(
            instance_id = %cfg.instance_id,
            ring_key = %cfg.ring_key,
            num_tokens = tokens.len(),
            "registered in ring"
        );

        let (ring_tx, ring_rx) = watch::channel(desc.clone());
        publish(&ring_tx, &observers, desc);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            cfg.clone(),
            kv,
            tokens,
            observers,
            ring_tx,
            cancel.clone(),
        ));

        Ok(Self {
            cancel,
            task,
            ring_rx,
            instance_id: cfg.instance_id,
        })
    }

    /// The id this instance registered under.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// A snapshot of the last published ring view.
    pub fn ring_desc(&self) -> RingDesc {
        self.ring_rx.borrow().clone()
    }

    /// Leave the ring and stop the heartbeat task.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for Lifecycler {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn run(
    cfg: LifecyclerConfig,
    kv: Arc<dyn KvStore>,
    tokens: Vec<u32>,
    observers: Vec<Arc<dyn RingObserver>>,
    ring_tx: watch::Sender<RingDesc>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(cfg.heartbeat_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; registration just heartbeated.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match heartbeat(&cfg, &*kv, &tokens).await {
                    Ok(desc) => publish(&ring_tx, &observers, desc),
                    Err(error) => warn!(%error, "ring heartbeat failed"),
                }
            }
        }
    }

    match deregister(&cfg, &*kv).await {
        Ok(desc) => {
            publish(&ring_tx, &observers, desc);
            info!(instance_id = %cfg.instance_id, "left ring");
        }
        Err(error) => warn!(%error, "failed to leave ring"),
    }
}

fn publish(ring_tx: &watch::Sender<RingDesc>, observers: &[Arc<dyn RingObserver>], desc: RingDesc) {
    for observer in observers {
        observer.ring_updated(&desc);
    }
    // Receivers may all be gone; observers got their callback regardless.
    let _ = ring_tx.send(desc);
}

/// N distinct random ring tokens, sorted ascending.
fn generate_tokens(n: usize) -> Vec<u32> {
    let mut rng = rand::thread_rng();
    let mut tokens = std::collections::BTreeSet::new();
    while tokens.len() < n {
        tokens.insert(rng.gen::<u32>());
    }
    tokens.into_iter().collect()
}

async fn register(
    cfg: &LifecyclerConfig,
    kv: &dyn KvStore,
    tokens: &[u32],
) -> Result<RingDesc, KvError> {
    mutate(cfg, kv, |cfg, desc| {
        forget_stale_peers(cfg, desc);
        desc.instances.insert(
            cfg.instance_id.clone(),
            InstanceDesc {
                addr: cfg.instance_addr.clone(),
                state: InstanceState::Active,
                zone: cfg.zone.clone(),
                tokens: tokens.to_vec(),
                heartbeat_unix: now_unix(),
            },
        );
    })
    .await
}

async fn heartbeat(
    cfg: &LifecyclerConfig,
    kv: &dyn KvStore,
    tokens: &[u32],
) -> Result<RingDesc, KvError> {
    mutate(cfg, kv, |cfg, desc| {
        forget_stale_peers(cfg, desc);
        match desc.instances.get_mut(&cfg.instance_id) {
            Some(instance) => instance.heartbeat_unix = now_unix(),
            // Someone (or a KV wipe) removed us: re-register.
            None => {
                desc.instances.insert(
                    cfg.instance_id.clone(),
                    InstanceDesc {
                        addr: cfg.instance_addr.clone(),
                        state: InstanceState::Active,
                        zone: cfg.zone.clone(),
                        tokens: tokens.to_vec(),
                        heartbeat_unix: now_unix(),
                    },
                );
            }
        }
    })
    .await
}

async fn deregister(cfg: &LifecyclerConfig, kv: &dyn KvStore) -> Result<RingDesc, KvError> {
    mutate(cfg, kv, |cfg, desc| {
        if let Some(instance) = desc.instances.get_mut(&cfg.instance_id) {
            instance.state = InstanceState::Leaving;
            instance.heartbeat_unix = now_unix();
        }
    })
    .await?;
    mutate(cfg, kv, |cfg, desc| {
        desc.instances.remove(&cfg.instance_id);
    })
    .await
}

fn forget_stale_peers(cfg: &LifecyclerConfig, desc: &mut RingDesc) {
    for forgotten in desc.remove_stale(cfg.forget_after(), now_unix()) {
        info!(
            instance_id = %forgotten,
            ring_key = %cfg.ring_key,
            "auto-forgot unhealthy ring member"
        );
    }
}

/// Run a ring mutation through the KV CAS, starting from an empty ring when
/// none is stored yet.
async fn mutate(
    cfg: &LifecyclerConfig,
    kv: &dyn KvStore,
    mutation: impl Fn(&LifecyclerConfig, &mut RingDesc) + Send + Sync,
) -> Result<RingDesc, KvError> {
    let stored = kv
        .cas(&cfg.ring_key, &mut |current| {
            let mut desc = current.unwrap_or_default();
            mutation(cfg, &mut desc);
            Some(desc)
        })
        .await?;
    // The mutation always returns Some, so a value is always stored.
    stored.ok_or_else(|| KvError("cas stored no value".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(id: &str) -> LifecyclerConfig {
        LifecyclerConfig {
            ring_key: "distributor".to_owned(),
            instance_id: id.to_owned(),
            instance_addr: "10.0.0.1:8000".to_owned(),
            num_tokens: 16,
            heartbeat_period: Duration::from_millis(10),
            heartbeat_timeout: Duration::from_secs(60),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_register_and_observe() {
        let kv: Arc<dyn KvStore> = Arc::new(crate::MemoryKv::new());
        let counter = Arc::new(HealthyInstanceCounter::new(Duration::from_secs(60)));

        let lifecycler = Lifecycler::spawn(
            test_config("dist-1"),
            Arc::clone(&kv),
            vec![Arc::clone(&counter) as _],
        )
        .await
        .unwrap();

        let desc = kv.get("distributor").await.unwrap().unwrap();
        let instance = desc.instances.get("dist-1").unwrap();
        assert_eq!(instance.state, InstanceState::Active);
        assert_eq!(instance.tokens.len(), 16);
        assert!(instance.tokens.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(counter.count(), 1);
        assert_eq!(lifecycler.ring_desc(), desc);

        lifecycler.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_instances_count_each_other() {
        let kv: Arc<dyn KvStore> = Arc::new(crate::MemoryKv::new());
        let counter = Arc::new(HealthyInstanceCounter::new(Duration::from_secs(60)));

        let a = Lifecycler::spawn(test_config("dist-a"), Arc::clone(&kv), vec![])
            .await
            .unwrap();
        let b = Lifecycler::spawn(
            test_config("dist-b"),
            Arc::clone(&kv),
            vec![Arc::clone(&counter) as _],
        )
        .await
        .unwrap();

        assert_eq!(counter.count(), 2);

        a.shutdown().await;
        b.shutdown().await;
        assert!(kv
            .get("distributor")
            .await
            .unwrap()
            .unwrap()
            .instances
            .is_empty());
    }

    #[tokio::test]
    async fn test_registration_forgets_dead_peers() {
        let kv: Arc<dyn KvStore> = Arc::new(crate::MemoryKv::new());

        // Seed the ring with a peer whose heartbeat lapsed the forget
        // horizon (10 × 60s by default).
        kv.cas("distributor", &mut |_| {
            let mut desc = RingDesc::default();
            desc.instances.insert(
                "dist-dead".to_owned(),
                InstanceDesc {
                    addr: "10.0.0.9:8080".into(),
                    state: InstanceState::Active,
                    zone: String::new(),
                    tokens: vec![7],
                    heartbeat_unix: now_unix() - 24 * 3600,
                },
            );
            Some(desc)
        })
        .await
        .unwrap();

        let lifecycler = Lifecycler::spawn(test_config("dist-1"), Arc::clone(&kv), vec![])
            .await
            .unwrap();

        let desc = kv.get("distributor").await.unwrap().unwrap();
        assert!(!desc.instances.contains_key("dist-dead"));
        assert!(desc.instances.contains_key("dist-1"));

        lifecycler.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_renews_timestamp() {
        let kv: Arc<dyn KvStore> = Arc::new(crate::MemoryKv::new());
        let lifecycler = Lifecycler::spawn(test_config("dist-1"), Arc::clone(&kv), vec![])
            .await
            .unwrap();

        // Age our own entry, then wait for a heartbeat tick to renew it.
        kv.cas("distributor", &mut |current| {
            let mut desc = current.unwrap();
            desc.instances.get_mut("dist-1").unwrap().heartbeat_unix = 12345;
            Some(desc)
        })
        .await
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let desc = kv.get("distributor").await.unwrap().unwrap();
            if desc.instances.get("dist-1").unwrap().heartbeat_unix != 12345 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "heartbeat never renewed"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        lifecycler.shutdown().await;
    }
}
