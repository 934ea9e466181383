//! The KV backend abstraction ring state is persisted in.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::RingDesc;

/// Errors talking to the KV backend.
#[derive(Debug, Error, Clone)]
#[error("kv store: {0}")]
pub struct KvError(pub String);

/// The compare-and-swap mutation passed to [`KvStore::cas`].
///
/// Receives the current value (if any) and returns the replacement, or
/// `None` to leave the stored value untouched.
pub type CasFn<'a> = &'a mut (dyn FnMut(Option<RingDesc>) -> Option<RingDesc> + Send);

/// A strongly-consistent store for ring descriptions.
///
/// Implementations must make [`KvStore::cas`] atomic: concurrent mutations
/// of the same key must serialise, never interleave.
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug + 'static {
    /// Atomically read-modify-write the ring stored under `key`, returning
    /// the value stored after the operation.
    async fn cas(&self, key: &str, f: CasFn<'_>) -> Result<Option<RingDesc>, KvError>;

    /// Read the ring stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<RingDesc>, KvError>;
}

/// An in-process [`KvStore`].
///
/// Backs single-binary deployments and tests; clustered deployments
/// implement [`KvStore`] over an external backend instead.
#[derive(Debug, Default)]
pub struct MemoryKv {
    values: Mutex<HashMap<String, RingDesc>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn cas(&self, key: &str, f: CasFn<'_>) -> Result<Option<RingDesc>, KvError> {
        let mut values = self.values.lock();
        let current = values.get(key).cloned();
        Ok(match f(current.clone()) {
            Some(next) => {
                values.insert(key.to_owned(), next.clone());
                Some(next)
            }
            None => current,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<RingDesc>, KvError> {
        Ok(self.values.lock().get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstanceDesc, InstanceState};

    fn desc_with(id: &str) -> RingDesc {
        let mut desc = RingDesc::default();
        desc.instances.insert(
            id.to_owned(),
            InstanceDesc {
                addr: "10.0.0.1:8080".into(),
                state: InstanceState::Active,
                zone: String::new(),
                tokens: vec![42],
                heartbeat_unix: 0,
            },
        );
        desc
    }

    #[tokio::test]
    async fn test_cas_stores_and_returns() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("ring").await.unwrap(), None);

        let stored = kv
            .cas("ring", &mut |current| {
                assert_eq!(current, None);
                Some(desc_with("a"))
            })
            .await
            .unwrap();
        assert_eq!(stored, Some(desc_with("a")));
        assert_eq!(kv.get("ring").await.unwrap(), Some(desc_with("a")));
    }

    #[tokio::test]
    async fn test_cas_none_leaves_value() {
        let kv = MemoryKv::new();
        kv.cas("ring", &mut |_| Some(desc_with("a"))).await.unwrap();

        let stored = kv.cas("ring", &mut |_| None).await.unwrap();
        assert_eq!(stored, Some(desc_with("a")));
        assert_eq!(kv.get("ring").await.unwrap(), Some(desc_with("a")));
    }
}
