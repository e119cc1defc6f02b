use crate::transport::Transport;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// Network transports available for cross-node peers, indexed by
    /// `peer % nranks_per_node`.
    pub network_pool: Vec<Transport>,
    /// Capacity of a device's compiled kernel cache.
    pub kernel_cache: usize,
    /// Bound on a single collective rendezvous. `None` blocks until every peer shows up.
    pub rendezvous_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network_pool: (0..8).map(Transport::Ib).collect(),
            kernel_cache: 16,
            rendezvous_timeout: None,
        }
    }
}

#[test]
fn test_default() {
    let config = Config::default();
    assert_eq!(config.network_pool.len(), 8);
    assert_eq!(config.network_pool[0], Transport::Ib(0));
    assert_eq!(config.network_pool[7], Transport::Ib(7));
    assert!(config.rendezvous_timeout.is_none());
}
