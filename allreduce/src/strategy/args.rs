use crate::{transport::Transport, Config, DevBuf, HardwareOf, RankGroup, Topology};
use std::sync::Arc;

/// What a strategy is built over.
pub struct Args<G: RankGroup> {
    pub topology: Topology,
    /// The buffer being reduced. Every strategy except the hierarchical one
    /// reduces it in place.
    pub buffer: DevBuf<HardwareOf<G>>,
    /// Destination when it is not `buffer`.
    pub output: Option<DevBuf<HardwareOf<G>>>,
    /// The rank's proxy service, shared by every strategy on the rank.
    pub proxy: Option<Arc<G::Proxy>>,
    pub network_pool: Vec<Transport>,
}

impl<G: RankGroup> Args<G> {
    pub fn new(topology: Topology, buffer: DevBuf<HardwareOf<G>>) -> Self {
        Self {
            topology,
            buffer,
            output: None,
            proxy: None,
            network_pool: Config::default().network_pool,
        }
    }

    #[inline]
    pub fn with_output(self, output: DevBuf<HardwareOf<G>>) -> Self {
        Self {
            output: Some(output),
            ..self
        }
    }

    #[inline]
    pub fn with_proxy(self, proxy: Arc<G::Proxy>) -> Self {
        Self {
            proxy: Some(proxy),
            ..self
        }
    }

    #[inline]
    pub fn with_config(self, config: &Config) -> Self {
        Self {
            network_pool: config.network_pool.clone(),
            ..self
        }
    }
}
