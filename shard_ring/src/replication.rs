//! Replication sets: the instances selected to receive a given write.

use crate::InstanceDesc;

/// The set of instances a single series is replicated to, along with how
/// many failures the write tolerates.
///
/// `min_success() + max_errors == instances.len()` always holds.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationSet {
    pub instances: Vec<InstanceDesc>,
    /// How many instance errors this write can absorb and still succeed.
    pub max_errors: usize,
}

impl ReplicationSet {
    /// The number of successful replica acknowledgements required.
    pub fn min_success(&self) -> usize {
        self.instances.len() - self.max_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InstanceState;

    #[test]
    fn test_min_success_complements_max_errors() {
        let instance = InstanceDesc {
            addr: "10.0.0.1:8080".into(),
            state: InstanceState::Active,
            zone: String::new(),
            tokens: vec![],
            heartbeat_unix: 0,
        };
        let set = ReplicationSet {
            instances: vec![instance.clone(), instance.clone(), instance],
            max_errors: 1,
        };
        assert_eq!(set.min_success(), 2);
        assert_eq!(set.min_success() + set.max_errors, set.instances.len());
    }
}
