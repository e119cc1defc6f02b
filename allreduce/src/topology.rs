use crate::{invalid_topology, CommError};

/// Rank count and node width of a communication group.
///
/// Consecutive ranks share a node: rank `r` lives on node `r / nranks_per_node`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Topology {
    nranks: usize,
    nranks_per_node: usize,
}

impl Topology {
    pub fn new(nranks: usize, nranks_per_node: usize) -> Result<Self, CommError> {
        if nranks == 0 || nranks_per_node == 0 {
            return Err(invalid_topology(format!(
                "nranks = {nranks}, nranks_per_node = {nranks_per_node}"
            )));
        }
        if nranks % nranks_per_node != 0 {
            return Err(invalid_topology(format!(
                "{nranks} ranks cannot be split into nodes of {nranks_per_node}"
            )));
        }
        Ok(Self {
            nranks,
            nranks_per_node,
        })
    }

    /// All ranks on one node.
    #[inline]
    pub fn single_node(nranks: usize) -> Result<Self, CommError> {
        Self::new(nranks, nranks)
    }

    #[inline]
    pub const fn nranks(&self) -> usize {
        self.nranks
    }

    #[inline]
    pub const fn nranks_per_node(&self) -> usize {
        self.nranks_per_node
    }

    #[inline]
    pub const fn nnodes(&self) -> usize {
        self.nranks / self.nranks_per_node
    }

    #[inline]
    pub const fn node_of(&self, rank: usize) -> usize {
        rank / self.nranks_per_node
    }

    #[inline]
    pub const fn same_node(&self, a: usize, b: usize) -> bool {
        self.node_of(a) == self.node_of(b)
    }

    pub(crate) fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank < self.nranks {
            Ok(())
        } else {
            Err(invalid_topology(format!(
                "rank {rank} out of group of {}",
                self.nranks
            )))
        }
    }

    /// Every rank except `me`, ascending.
    pub fn peers(&self, me: usize) -> impl Iterator<Item = usize> {
        (0..self.nranks).filter(move |&r| r != me)
    }
}

/// Which peers of a rank a channel group covers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PeerSet {
    All,
    SameNode,
    CrossNode,
}

impl PeerSet {
    pub const fn count(self, topo: &Topology) -> usize {
        match self {
            Self::All => topo.nranks - 1,
            Self::SameNode => topo.nranks_per_node - 1,
            Self::CrossNode => topo.nranks - topo.nranks_per_node,
        }
    }

    #[inline]
    pub fn contains(self, topo: &Topology, me: usize, peer: usize) -> bool {
        peer != me
            && match self {
                Self::All => true,
                Self::SameNode => topo.same_node(me, peer),
                Self::CrossNode => !topo.same_node(me, peer),
            }
    }

    pub fn members(self, topo: Topology, me: usize) -> impl Iterator<Item = usize> {
        topo.peers(me)
            .filter(move |&peer| self.contains(&topo, me, peer))
    }
}
