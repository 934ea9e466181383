//! The persisted description of a ring and its member instances.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The lifecycle state of a ring member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Registered but not yet serving.
    Joining,
    /// Serving and eligible for writes.
    Active,
    /// Draining ahead of shutdown.
    Leaving,
    /// Gone; retained only transiently before removal.
    Left,
}

/// A single member of a ring.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDesc {
    /// The network address peers reach this instance on.
    pub addr: String,
    pub state: InstanceState,
    /// The availability zone, or empty when zone-awareness is unused.
    pub zone: String,
    /// The ring tokens owned by this instance, sorted ascending.
    pub tokens: Vec<u32>,
    /// Unix timestamp (seconds) of the last heartbeat.
    pub heartbeat_unix: i64,
}

impl InstanceDesc {
    /// Whether the instance heartbeated within `timeout` of `now`.
    pub fn is_heartbeat_fresh(&self, timeout: Duration, now_unix: i64) -> bool {
        now_unix.saturating_sub(self.heartbeat_unix) <= timeout.as_secs() as i64
    }
}

/// The full ring as stored in the KV backend: instance id to description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RingDesc {
    pub instances: BTreeMap<String, InstanceDesc>,
}

impl RingDesc {
    /// The number of instances with a fresh heartbeat, regardless of state.
    ///
    /// Leaving instances still accept their share of traffic, so they keep
    /// counting towards rate-limit division until their heartbeat lapses.
    pub fn healthy_count(&self, heartbeat_timeout: Duration, now_unix: i64) -> usize {
        self.instances
            .values()
            .filter(|i| i.is_heartbeat_fresh(heartbeat_timeout, now_unix))
            .count()
    }

    /// Remove instances whose heartbeat is older than `forget_after`,
    /// returning the forgotten ids.
    pub fn remove_stale(&mut self, forget_after: Duration, now_unix: i64) -> Vec<String> {
        let stale: Vec<_> = self
            .instances
            .iter()
            .filter(|(_, i)| !i.is_heartbeat_fresh(forget_after, now_unix))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.instances.remove(id);
        }
        stale
    }
}

/// The current wall-clock time as unix seconds.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
