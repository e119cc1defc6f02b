use crate::{transport_unavailable, CommError, PeerMap, Topology};
use log::debug;
use std::fmt;

/// Communication medium between two ranks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Transport {
    /// Same-node, direct device-to-device access.
    CudaIpc,
    /// One of the node's network interfaces.
    Ib(u8),
}

impl Transport {
    #[inline]
    pub const fn is_network(self) -> bool {
        matches!(self, Self::Ib(_))
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::CudaIpc => write!(f, "CudaIpc"),
            Self::Ib(i) => write!(f, "IB{i}"),
        }
    }
}

/// A peer together with the transport used to reach it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Connection {
    pub peer: usize,
    pub transport: Transport,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Policy {
    /// Every peer over IPC. Only valid inside one node.
    IpcOnly,
    /// IPC inside the node, a pooled network transport across nodes.
    Mixed,
}

/// Maps peers to transports.
#[derive(Clone, Debug)]
pub struct TransportPlanner {
    pool: Vec<Transport>,
}

impl TransportPlanner {
    pub fn new(pool: impl Into<Vec<Transport>>) -> Self {
        Self { pool: pool.into() }
    }

    #[inline]
    pub fn pool(&self) -> &[Transport] {
        &self.pool
    }

    pub fn plan(
        &self,
        topo: &Topology,
        me: usize,
        policy: Policy,
    ) -> Result<PeerMap<Transport>, CommError> {
        topo.check_rank(me)?;
        let npn = topo.nranks_per_node();
        if policy == Policy::Mixed && self.pool.len() < npn {
            return Err(transport_unavailable(format!(
                "{npn} ranks per node need {npn} network transports, pool has {}",
                self.pool.len()
            )));
        }

        let mut ans = PeerMap::new();
        for peer in topo.peers(me) {
            let transport = if topo.same_node(me, peer) {
                Transport::CudaIpc
            } else {
                match policy {
                    Policy::Mixed => self.pool[peer % npn],
                    Policy::IpcOnly => {
                        return Err(transport_unavailable(format!(
                            "rank {peer} is not on the node of rank {me}, ipc cannot reach it"
                        )))
                    }
                }
            };
            ans.insert(peer, transport);
        }
        debug!("rank {me} transport plan: {ans:?}");
        Ok(ans)
    }
}
