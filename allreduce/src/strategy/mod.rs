//! AllReduce strategies.
//!
//! Each strategy owns the connections, channels and scratch memory it builds in
//! `new`, and afterwards only repacks its parameter blob when reconfigured.

mod args;
mod inner;

pub mod direct;
pub mod hierarchical;
pub mod pipelined;
pub mod scratch;
pub mod two_round;

pub use args::Args;
pub use direct::Direct;
pub use hierarchical::Hierarchical;
pub use pipelined::Pipelined;
pub use scratch::Scratch;
pub use two_round::TwoRound;

use crate::{
    args_not_support,
    channel::ChannelSet,
    params::{BufferRole, ChannelGroup, ParamBlob, Schema},
    transport::{Connection, Policy},
    tune::{AutoTune, TuneSpace, TuningConfig},
    CommError, DevBuf, HardwareOf, PeerMap, QueueOf, RankGroup, Topology,
};
use std::{fmt, str::FromStr};

/// 一种 AllReduce 实现。
pub trait CollectiveOperation {
    type Group: RankGroup;

    fn algorithm(&self) -> Algorithm;
    fn topology(&self) -> Topology;

    /// The launch configuration currently in effect.
    fn config(&self) -> TuningConfig;
    /// Applies `config` and repacks the parameter blob. Idempotent.
    fn configure(&mut self, config: TuningConfig) -> Result<(), CommError>;
    /// The blob the next launch receives.
    fn params(&self) -> &ParamBlob;

    fn connections(&self) -> &PeerMap<Connection>;
    fn channels(&self, group: ChannelGroup) -> Option<&ChannelSet>;
    fn buffer(&self, role: BufferRole) -> Option<DevBuf<HardwareOf<Self::Group>>>;

    /// Launches the reduction of the whole buffer on `queue` and returns the
    /// buffer the result lands in.
    fn execute(
        &self,
        queue: &QueueOf<HardwareOf<Self::Group>>,
    ) -> Result<&DevBuf<HardwareOf<Self::Group>>, CommError>;

    /// Same as [`Self::execute`], reducing only the first `nelems` elements.
    fn execute_n(
        &self,
        nelems: usize,
        queue: &QueueOf<HardwareOf<Self::Group>>,
    ) -> Result<&DevBuf<HardwareOf<Self::Group>>, CommError>;

    #[inline]
    fn tune_space(&self) -> TuneSpace {
        self.algorithm().tune_space()
    }

    #[inline]
    fn auto_tune(&mut self) -> AutoTune<'_, Self>
    where
        Self: Sized,
    {
        AutoTune::new(self)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Algorithm {
    /// One-phase read-reduce over direct channels.
    Direct,
    /// Staged through an 8x scratch, optionally out of place.
    Scratch,
    /// Two proxy rounds over one scratch.
    TwoRound,
    /// Intra-node reduce-scatter and all-gather pipelined with proxy traffic.
    Pipelined,
    /// Direct channels inside the node, proxy channels and a staging buffer
    /// across nodes.
    Hierarchical,
}

impl Algorithm {
    pub const ALL: [Self; 5] = [
        Self::Direct,
        Self::Scratch,
        Self::TwoRound,
        Self::Pipelined,
        Self::Hierarchical,
    ];

    /// Kernel entry point.
    pub const fn entry(self) -> &'static str {
        match self {
            Self::Direct => "allreduce1",
            Self::Scratch => "allreduce2",
            Self::TwoRound => "allreduce3",
            Self::Pipelined => "allreduce4",
            Self::Hierarchical => "allreduce5",
        }
    }

    pub const fn schema(self) -> Schema {
        match self {
            Self::Direct => direct::SCHEMA,
            Self::Scratch => scratch::SCHEMA,
            Self::TwoRound => two_round::SCHEMA,
            Self::Pipelined => pipelined::SCHEMA,
            Self::Hierarchical => hierarchical::SCHEMA,
        }
    }

    pub const fn tune_space(self) -> TuneSpace {
        match self {
            Self::Direct => direct::SPACE,
            Self::Scratch => scratch::SPACE,
            Self::TwoRound => two_round::SPACE,
            Self::Pipelined => pipelined::SPACE,
            Self::Hierarchical => hierarchical::SPACE,
        }
    }

    pub const fn default_config(self) -> TuningConfig {
        match self {
            Self::Direct => direct::DEFAULT,
            Self::Scratch => scratch::DEFAULT,
            Self::TwoRound => two_round::DEFAULT,
            Self::Pipelined => pipelined::DEFAULT,
            Self::Hierarchical => hierarchical::DEFAULT,
        }
    }

    pub const fn policy(self) -> Policy {
        match self {
            Self::Direct | Self::Scratch | Self::TwoRound => Policy::IpcOnly,
            Self::Pipelined | Self::Hierarchical => Policy::Mixed,
        }
    }

    pub const fn needs_proxy(self) -> bool {
        !matches!(self, Self::Direct | Self::Scratch)
    }
}

impl fmt::Display for Algorithm {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.entry())
    }
}

impl FromStr for Algorithm {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.entry() == s)
            .ok_or_else(|| args_not_support(format!("no allreduce kernel named {s}")))
    }
}

/// Forwards [`CollectiveOperation`] to the strategy's shared state.
macro_rules! collective {
    ($name:ident) => {
        impl<G: $crate::RankGroup> $crate::CollectiveOperation for $name<G> {
            type Group = G;

            #[inline]
            fn algorithm(&self) -> $crate::Algorithm {
                self.0.algorithm()
            }
            #[inline]
            fn topology(&self) -> $crate::Topology {
                self.0.topology()
            }
            #[inline]
            fn config(&self) -> $crate::TuningConfig {
                self.0.config()
            }
            #[inline]
            fn configure(&mut self, config: $crate::TuningConfig) -> Result<(), $crate::CommError> {
                self.0.configure(config)
            }
            #[inline]
            fn params(&self) -> &$crate::params::ParamBlob {
                self.0.params()
            }
            #[inline]
            fn connections(&self) -> &$crate::PeerMap<$crate::transport::Connection> {
                self.0.connections()
            }
            #[inline]
            fn channels(
                &self,
                group: $crate::params::ChannelGroup,
            ) -> Option<&$crate::channel::ChannelSet> {
                self.0.channels(group)
            }
            #[inline]
            fn buffer(
                &self,
                role: $crate::params::BufferRole,
            ) -> Option<$crate::DevBuf<$crate::HardwareOf<G>>> {
                self.0.buffer(role)
            }
            #[inline]
            fn execute(
                &self,
                queue: &$crate::QueueOf<$crate::HardwareOf<G>>,
            ) -> Result<&$crate::DevBuf<$crate::HardwareOf<G>>, $crate::CommError> {
                let len = self.0.buffer($crate::params::BufferRole::Input).map_or(0, |b| b.len);
                self.0.execute(len, queue)
            }
            #[inline]
            fn execute_n(
                &self,
                nelems: usize,
                queue: &$crate::QueueOf<$crate::HardwareOf<G>>,
            ) -> Result<&$crate::DevBuf<$crate::HardwareOf<G>>, $crate::CommError> {
                self.0.execute(nelems, queue)
            }
        }
    };
}

pub(crate) use collective;

/// Any one of the strategies, chosen at run time.
pub enum AllReduce<G: RankGroup> {
    Direct(Direct<G>),
    Scratch(Scratch<G>),
    TwoRound(TwoRound<G>),
    Pipelined(Pipelined<G>),
    Hierarchical(Hierarchical<G>),
}

impl<G: RankGroup> AllReduce<G> {
    /// Collectively builds the strategy named by `algorithm`.
    pub fn new(algorithm: Algorithm, group: &G, args: Args<G>) -> Result<Self, CommError> {
        Ok(match algorithm {
            Algorithm::Direct => Self::Direct(Direct::new(group, args)?),
            Algorithm::Scratch => Self::Scratch(Scratch::new(group, args)?),
            Algorithm::TwoRound => Self::TwoRound(TwoRound::new(group, args)?),
            Algorithm::Pipelined => Self::Pipelined(Pipelined::new(group, args)?),
            Algorithm::Hierarchical => Self::Hierarchical(Hierarchical::new(group, args)?),
        })
    }
}

macro_rules! dispatch {
    ($self:expr, $op:ident => $body:expr) => {
        match $self {
            Self::Direct($op) => $body,
            Self::Scratch($op) => $body,
            Self::TwoRound($op) => $body,
            Self::Pipelined($op) => $body,
            Self::Hierarchical($op) => $body,
        }
    };
}

impl<G: RankGroup> CollectiveOperation for AllReduce<G> {
    type Group = G;

    fn algorithm(&self) -> Algorithm {
        dispatch!(self, op => op.algorithm())
    }
    fn topology(&self) -> Topology {
        dispatch!(self, op => op.topology())
    }
    fn config(&self) -> TuningConfig {
        dispatch!(self, op => op.config())
    }
    fn configure(&mut self, config: TuningConfig) -> Result<(), CommError> {
        dispatch!(self, op => op.configure(config))
    }
    fn params(&self) -> &ParamBlob {
        dispatch!(self, op => op.params())
    }
    fn connections(&self) -> &PeerMap<Connection> {
        dispatch!(self, op => op.connections())
    }
    fn channels(&self, group: ChannelGroup) -> Option<&ChannelSet> {
        dispatch!(self, op => op.channels(group))
    }
    fn buffer(&self, role: BufferRole) -> Option<DevBuf<HardwareOf<G>>> {
        dispatch!(self, op => op.buffer(role))
    }
    fn execute(&self, queue: &QueueOf<HardwareOf<G>>) -> Result<&DevBuf<HardwareOf<G>>, CommError> {
        dispatch!(self, op => op.execute(queue))
    }
    fn execute_n(
        &self,
        nelems: usize,
        queue: &QueueOf<HardwareOf<G>>,
    ) -> Result<&DevBuf<HardwareOf<G>>, CommError> {
        dispatch!(self, op => op.execute_n(nelems, queue))
    }
}

#[cfg(test)]
mod test;
