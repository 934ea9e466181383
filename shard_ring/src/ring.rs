//! A read-side consistent-hash ring with shuffle-shard support.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::{
    now_unix, shuffle_shard_token, InstanceDesc, InstanceState, ReplicationSet, RingDesc,
    RingError,
};

/// The operation a ring lookup selects instances for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Write,
    Read,
}

/// Read access to a consistent-hash ring of instances.
pub trait ReadRing: Debug + Send + Sync {
    /// Select the replication set for `token`: the next
    /// `replication_factor` distinct usable instances clockwise from the
    /// token, zone-diverse when the topology spans multiple zones.
    fn get(&self, token: u32, op: Op) -> Result<ReplicationSet, RingError>;

    /// A deterministic, stable sub-ring of (at least) `size` instances
    /// derived from the tenant id. `size == 0` returns the whole ring.
    fn shuffle_shard(&self, tenant_id: &str, size: usize) -> Arc<dyn ReadRing>;

    fn replication_factor(&self) -> usize;

    /// The number of instances currently in the ring, in any state.
    fn instance_count(&self) -> usize;
}

/// The provided [`ReadRing`] implementation.
///
/// Topology updates replace an immutable snapshot under a lock, so lookups
/// never observe a half-applied update and hold no lock while walking.
#[derive(Debug)]
pub struct HashRing {
    replication_factor: usize,
    /// When set, instances whose heartbeat is older than this are skipped
    /// during selection.
    heartbeat_timeout: Option<Duration>,
    state: RwLock<Arc<RingState>>,
}

#[derive(Debug, Default)]
struct RingState {
    /// Instance id and description, in insertion order.
    instances: Vec<(String, InstanceDesc)>,
    /// `(token, instance index)` sorted ascending by token.
    entries: Vec<(u32, usize)>,
    /// True when more than one distinct non-empty zone is present.
    zone_aware: bool,
}

impl RingState {
    fn build(instances: Vec<(String, InstanceDesc)>) -> Self {
        let mut entries: Vec<(u32, usize)> = instances
            .iter()
            .enumerate()
            .flat_map(|(i, (_, desc))| desc.tokens.iter().map(move |&t| (t, i)))
            .collect();
        entries.sort_unstable();

        let mut zones: Vec<&str> = instances
            .iter()
            .map(|(_, desc)| desc.zone.as_str())
            .filter(|z| !z.is_empty())
            .collect();
        zones.sort_unstable();
        zones.dedup();
        let zone_aware = zones.len() > 1;

        Self {
            instances,
            entries,
            zone_aware,
        }
    }
}

impl HashRing {
    /// An empty ring with the given replication factor.
    pub fn new(replication_factor: usize) -> Self {
        assert!(replication_factor > 0, "replication factor must be nonzero");
        Self {
            replication_factor,
            heartbeat_timeout: None,
            state: RwLock::new(Arc::new(RingState::default())),
        }
    }

    /// A ring pre-populated with `instances` (id, description).
    pub fn with_instances(
        replication_factor: usize,
        instances: impl IntoIterator<Item = (String, InstanceDesc)>,
    ) -> Self {
        let ring = Self::new(replication_factor);
        ring.set_instances(instances);
        ring
    }

    /// Skip instances whose heartbeat is older than `timeout` during
    /// selection.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    /// Replace the ring topology.
    pub fn set_instances(&self, instances: impl IntoIterator<Item = (String, InstanceDesc)>) {
        let state = RingState::build(instances.into_iter().collect());
        *self.state.write() = Arc::new(state);
    }

    /// Replace the ring topology from a persisted ring description.
    pub fn update_from_desc(&self, desc: &RingDesc) {
        self.set_instances(desc.instances.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    fn snapshot(&self) -> Arc<RingState> {
        Arc::clone(&self.state.read())
    }

    fn usable(&self, instance: &InstanceDesc, op: Op, now_unix: i64) -> bool {
        let state_ok = match op {
            Op::Write => instance.state == InstanceState::Active,
            Op::Read => matches!(instance.state, InstanceState::Active | InstanceState::Leaving),
        };
        state_ok
            && self
                .heartbeat_timeout
                .map(|t| instance.is_heartbeat_fresh(t, now_unix))
                .unwrap_or(true)
    }

    fn from_state(&self, state: RingState) -> Arc<dyn ReadRing> {
        Arc::new(Self {
            replication_factor: self.replication_factor,
            heartbeat_timeout: self.heartbeat_timeout,
            state: RwLock::new(Arc::new(state)),
        })
    }
}

impl ReadRing for HashRing {
    fn get(&self, token: u32, op: Op) -> Result<ReplicationSet, RingError> {
        let state = self.snapshot();
        if state.entries.is_empty() {
            return Err(RingError::Empty);
        }
        let now = now_unix();

        let start = state.entries.partition_point(|&(t, _)| t < token);
        let mut selected: Vec<usize> = Vec::with_capacity(self.replication_factor);
        let mut zones: Vec<&str> = Vec::new();
        // Usable instances passed over because their zone was taken; used to
        // fill the set when distinct zones run out.
        let mut same_zone: Vec<usize> = Vec::new();

        for step in 0..state.entries.len() {
            if selected.len() == self.replication_factor {
                break;
            }
            let (_, idx) = state.entries[(start + step) % state.entries.len()];
            if selected.contains(&idx) || same_zone.contains(&idx) {
                continue;
            }
            let instance = &state.instances[idx].1;
            if !self.usable(instance, op, now) {
                continue;
            }
            if state.zone_aware
                && !instance.zone.is_empty()
                && zones.contains(&instance.zone.as_str())
            {
                same_zone.push(idx);
                continue;
            }
            zones.push(instance.zone.as_str());
            selected.push(idx);
        }
        for idx in same_zone {
            if selected.len() == self.replication_factor {
                break;
            }
            selected.push(idx);
        }

        let quorum = self.replication_factor / 2 + 1;
        if selected.len() < quorum {
            return Err(RingError::TooManyUnhealthy {
                healthy: selected.len(),
                required: quorum,
            });
        }

        Ok(ReplicationSet {
            max_errors: selected.len() - quorum,
            instances: selected
                .into_iter()
                .map(|idx| state.instances[idx].1.clone())
                .collect(),
        })
    }

    fn shuffle_shard(&self, tenant_id: &str, size: usize) -> Arc<dyn ReadRing> {
        let state = self.snapshot();
        if size == 0 || size >= state.instances.len() {
            return self.from_state(RingState::build(state.instances.clone()));
        }

        // One seed token per shard slot; each walks the full ring clockwise
        // and claims the first unclaimed instance. Seeds depend only on the
        // tenant id, so the subset is stable for a given topology.
        let mut selected: Vec<usize> = Vec::with_capacity(size);
        for n in 0..size {
            let seed = shuffle_shard_token(tenant_id, n as u32);
            let start = state.entries.partition_point(|&(t, _)| t < seed);
            for step in 0..state.entries.len() {
                let (_, idx) = state.entries[(start + step) % state.entries.len()];
                if !selected.contains(&idx) {
                    selected.push(idx);
                    break;
                }
            }
        }

        let instances = selected
            .into_iter()
            .map(|idx| state.instances[idx].clone())
            .collect();
        self.from_state(RingState::build(instances))
    }

    fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    fn instance_count(&self) -> usize {
        self.snapshot().instances.len()
    }
}
