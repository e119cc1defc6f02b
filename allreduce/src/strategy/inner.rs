use super::{Algorithm, Args};
use crate::{
    args_not_support, channel::ChannelKind, channel::ChannelRegistry, channel::ChannelSet,
    channel_creation_failure, invalid_topology, kernel_launch_failure,
    params::{BufferRole, ChannelGroup, HandleWidths, ParamBlob, Values},
    sizeof,
    transport::{Connection, TransportPlanner},
    type_name,
    tune::{Knob, TuningConfig},
    Alloc, CommError, CommErrorKind, DevBuf, Device, HardwareOf, Kernel, KernelKey, PeerMap,
    PeerSet, ProxyService, QueueOf, RankGroup, Topology,
};
use digit_layout::DigitLayout;
use log::{debug, info, warn};
use std::{collections::HashMap, mem::ManuallyDrop, sync::Arc};

pub(super) type KernelOf<G> = <HardwareOf<G> as Device>::Kernel;

/// Device memory owned by a strategy, returned to the allocator on drop.
pub(super) struct Scratch<D: Device> {
    device: D,
    mem: ManuallyDrop<D::DevMem>,
}

impl<D: Device> Scratch<D> {
    fn new(device: &D, len: usize, dt: DigitLayout) -> Result<(Self, DevBuf<D>), CommError> {
        let mut mem = device.alloc(len * sizeof(dt)?);
        let buf = DevBuf::new(mem.as_mut_ptr(), len, dt);
        let scratch = Self {
            device: device.clone(),
            mem: ManuallyDrop::new(mem),
        };
        Ok((scratch, buf))
    }
}

impl<D: Device> Drop for Scratch<D> {
    fn drop(&mut self) {
        let mem = unsafe { ManuallyDrop::take(&mut self.mem) };
        self.device.free(mem)
    }
}

/// State every strategy carries once constructed.
pub(super) struct Inner<G: RankGroup> {
    group: G,
    topo: Topology,
    algorithm: Algorithm,
    widths: HandleWidths,
    kernel: Arc<KernelOf<G>>,

    connections: PeerMap<Connection>,
    channels: HashMap<ChannelGroup, ChannelSet>,
    handles: HashMap<ChannelGroup, Box<[u8]>>,
    buffers: HashMap<BufferRole, DevBuf<HardwareOf<G>>>,
    // 通道先于暂存区释放
    _scratch: Vec<Scratch<HardwareOf<G>>>,
    _proxy: Option<Arc<G::Proxy>>,

    config: TuningConfig,
    blob: ParamBlob,
}

/// Collective construction of [`Inner`].
///
/// Everything that can be checked locally is checked in [`Builder::new`]
/// before the first rendezvous, so a bad argument on one rank fails that rank
/// alone instead of leaving its peers blocked.
pub(super) struct Builder<G: RankGroup> {
    group: G,
    topo: Topology,
    algorithm: Algorithm,
    rank: usize,
    connections: PeerMap<Connection>,
    channels: HashMap<ChannelGroup, ChannelSet>,
    handles: HashMap<ChannelGroup, Box<[u8]>>,
    buffers: HashMap<BufferRole, DevBuf<HardwareOf<G>>>,
    scratch: Vec<Scratch<HardwareOf<G>>>,
    proxy: Option<Arc<G::Proxy>>,
}

impl<G: RankGroup> Builder<G> {
    pub fn new(group: &G, args: Args<G>, algorithm: Algorithm) -> Result<Self, CommError> {
        let Args {
            topology: topo,
            buffer,
            output,
            proxy,
            network_pool,
        } = args;

        type_name(buffer.dt)?;
        if topo.nranks() != group.group_size() {
            return Err(invalid_topology(format!(
                "topology of {} ranks over a group of {}",
                topo.nranks(),
                group.group_size()
            )));
        }
        let rank = group.rank();
        topo.check_rank(rank)?;

        let output = match (algorithm, output) {
            (Algorithm::Scratch, None) => buffer,
            (Algorithm::Scratch | Algorithm::Hierarchical, Some(output)) => {
                if output.dt != buffer.dt || output.len < buffer.len {
                    return Err(args_not_support(format!(
                        "output {output:?} cannot hold the result of {buffer:?}"
                    )));
                }
                if algorithm == Algorithm::Hierarchical && output.base == buffer.base {
                    return Err(args_not_support(format!(
                        "{algorithm:?} cannot reduce in place"
                    )));
                }
                output
            }
            (Algorithm::Hierarchical, None) => {
                return Err(args_not_support(format!("{algorithm:?} needs an output")))
            }
            (_, None) => buffer,
            (_, Some(_)) => {
                return Err(args_not_support(format!(
                    "{algorithm:?} reduces in place"
                )))
            }
        };

        if algorithm.needs_proxy() && !proxy.as_ref().is_some_and(|p| p.is_running()) {
            return Err(channel_creation_failure(format!(
                "rank {rank}: {algorithm:?} needs a running proxy service"
            )));
        }

        let plan = TransportPlanner::new(network_pool).plan(&topo, rank, algorithm.policy())?;

        group.barrier()?;
        let connections = group.connect(&plan)?;

        Ok(Self {
            group: group.clone(),
            topo,
            algorithm,
            rank,
            connections,
            channels: HashMap::new(),
            handles: HashMap::new(),
            buffers: HashMap::from([(BufferRole::Input, buffer), (BufferRole::Output, output)]),
            scratch: Vec::new(),
            proxy,
        })
    }

    #[inline]
    pub fn topology(&self) -> Topology {
        self.topo
    }

    #[inline]
    pub fn input(&self) -> DevBuf<HardwareOf<G>> {
        self.buffers[&BufferRole::Input]
    }

    /// Allocates zeroed memory of `len` elements of the input type for `role`.
    pub fn alloc(&mut self, role: BufferRole, len: usize) -> Result<(), CommError> {
        let dt = self.input().dt;
        let (scratch, buf) = Scratch::new(self.group.processor(), len, dt)?;
        self.scratch.push(scratch);
        self.buffers.insert(role, buf);
        Ok(())
    }

    /// Establishes channel group `tag` to `peers`, bound to `buffer` and
    /// optionally `scratch`.
    pub fn channels(
        &mut self,
        tag: ChannelGroup,
        peers: PeerSet,
        buffer: BufferRole,
        scratch: Option<BufferRole>,
    ) -> Result<(), CommError> {
        let connections = self
            .connections
            .iter()
            .filter(|&(&peer, _)| peers.contains(&self.topo, self.rank, peer))
            .map(|(&peer, &c)| (peer, c))
            .collect::<PeerMap<_>>();
        let buffer = self.role(buffer)?;
        let scratch = scratch.map(|role| self.role(role)).transpose()?;

        let set = ChannelRegistry::establish(
            &self.group,
            tag.kind(),
            &connections,
            buffer,
            scratch,
            self.proxy.as_deref(),
        )?;
        self.handles.insert(tag, set.device_handles());
        self.channels.insert(tag, set);
        Ok(())
    }

    fn role(&self, role: BufferRole) -> Result<DevBuf<HardwareOf<G>>, CommError> {
        self.buffers
            .get(&role)
            .copied()
            .ok_or_else(|| args_not_support(format!("no {role:?} buffer")))
    }

    pub fn finish(self) -> Result<Inner<G>, CommError> {
        let Self {
            group,
            topo,
            algorithm,
            rank,
            connections,
            channels,
            handles,
            buffers,
            scratch,
            proxy,
        } = self;

        let dt = buffers[&BufferRole::Input].dt;
        let key = KernelKey {
            file: "allreduce.cu",
            entry: algorithm.entry(),
            macros: vec![
                ("TYPE", type_name(dt)?.into()),
                ("NRANKS", topo.nranks().to_string()),
                ("NRANKS_PER_NODE", topo.nranks_per_node().to_string()),
            ],
        };
        let kernel = group.processor().load_kernel(&key)?;
        let widths = HandleWidths {
            sm: group.handle_size(ChannelKind::Sm),
            proxy: group.handle_size(ChannelKind::Proxy),
        };

        let config = algorithm.default_config();
        let mut ans = Inner {
            group,
            topo,
            algorithm,
            widths,
            kernel,
            connections,
            channels,
            handles,
            buffers,
            _scratch: scratch,
            _proxy: proxy,
            config,
            blob: ParamBlob::default(),
        };
        ans.blob = ans.pack(config.knob)?;

        info!(
            "rank {rank} built {algorithm:?} over {} connections, {} channel groups, {}-byte params",
            ans.connections.len(),
            ans.channels.len(),
            ans.blob.len(),
        );
        Ok(ans)
    }
}

impl<G: RankGroup> Inner<G> {
    #[inline]
    pub fn builder(group: &G, args: Args<G>, algorithm: Algorithm) -> Result<Builder<G>, CommError> {
        Builder::new(group, args, algorithm)
    }

    fn pack(&self, knob: Knob) -> Result<ParamBlob, CommError> {
        let buffers = self
            .buffers
            .iter()
            .map(|(&role, buf)| (role, buf.addr()))
            .collect();
        ParamBlob::pack(
            self.algorithm.schema(),
            self.widths,
            &Values {
                topo: self.topo,
                rank: self.group.rank(),
                handles: &self.handles,
                buffers: &buffers,
                nelems: self.buffers[&BufferRole::Input].len,
                knob,
            },
        )
    }

    #[inline]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    #[inline]
    pub fn topology(&self) -> Topology {
        self.topo
    }

    #[inline]
    pub fn config(&self) -> TuningConfig {
        self.config
    }

    #[inline]
    pub fn params(&self) -> &ParamBlob {
        &self.blob
    }

    #[inline]
    pub fn connections(&self) -> &PeerMap<Connection> {
        &self.connections
    }

    #[inline]
    pub fn channels(&self, tag: ChannelGroup) -> Option<&ChannelSet> {
        self.channels.get(&tag)
    }

    #[inline]
    pub fn buffer(&self, role: BufferRole) -> Option<DevBuf<HardwareOf<G>>> {
        self.buffers.get(&role).copied()
    }

    pub fn configure(&mut self, config: TuningConfig) -> Result<(), CommError> {
        let TuningConfig {
            nblocks,
            block_size,
            knob,
        } = config;
        if nblocks == 0 || block_size == 0 {
            return Err(args_not_support(format!(
                "launch of {nblocks} x {block_size}"
            )));
        }
        if !self.algorithm.tune_space().accepts(&knob) {
            return Err(args_not_support(format!(
                "{knob:?} does not apply to {:?}",
                self.algorithm
            )));
        }
        if knob != self.config.knob {
            self.blob = self.pack(knob)?;
        }
        self.config = config;
        debug!(
            "rank {} {:?} configured {config:?}",
            self.group.rank(),
            self.algorithm
        );
        Ok(())
    }

    pub fn execute(
        &self,
        nelems: usize,
        queue: &QueueOf<HardwareOf<G>>,
    ) -> Result<&DevBuf<HardwareOf<G>>, CommError> {
        let input = &self.buffers[&BufferRole::Input];
        if nelems > input.len {
            return Err(args_not_support(format!(
                "{nelems} elements exceed the {} of {input:?}",
                input.len
            )));
        }
        let TuningConfig {
            nblocks,
            block_size,
            ..
        } = self.config;
        let params = self.blob.with_nelems(nelems);
        self.kernel
            .launch(&params, nblocks, block_size, 0, queue)
            .map_err(|e| match e.kind {
                CommErrorKind::KernelLaunchFailure => e,
                _ => kernel_launch_failure(e.to_string()),
            })
            .inspect_err(|e| {
                warn!(
                    "rank {} {:?} launch failed: {e}",
                    self.group.rank(),
                    self.algorithm
                )
            })?;
        Ok(&self.buffers[&BufferRole::Output])
    }
}
