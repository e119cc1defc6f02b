use super::{Cpu, PeerHandle, ThisThread, HANDLE_SIZE};
use crate::{
    args_not_support, from_type_name, kernel_launch_failure,
    params::{BufferRole, ChannelGroup, Field, HandleWidths, ParamView},
    strategy::hierarchical::staging_len,
    unsupported_data_type, Algorithm, CommError, Kernel, KernelKey, PeerSet, Topology,
};
use digit_layout::DigitLayout;
use half::{bf16, f16};
use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, IntoParallelRefMutIterator, ParallelIterator};
use std::{
    ops::AddAssign,
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::{Arc, Barrier},
};

const MAX_BLOCK_SIZE: u32 = 1024;

/// Host rendition of the `allreduceN` entry points.
///
/// Whatever the strategy, a launch reads the peers' buffers through the
/// handles in the blob, sums them with its own input and writes the result
/// after every rank has finished reading.
pub struct CpuKernel {
    algorithm: Algorithm,
    dt: DigitLayout,
    topo: Topology,
    rank: usize,
    fabric: Arc<Barrier>,
}

impl CpuKernel {
    pub(super) fn new(key: &KernelKey, rank: usize, fabric: Arc<Barrier>) -> Result<Self, CommError> {
        let algorithm = key.entry.parse::<Algorithm>()?;
        let dt = from_type_name(macro_value(key, "TYPE")?)?;
        let topo = Topology::new(
            macro_usize(key, "NRANKS")?,
            macro_usize(key, "NRANKS_PER_NODE")?,
        )?;
        topo.check_rank(rank)?;
        Ok(Self {
            algorithm,
            dt,
            topo,
            rank,
            fabric,
        })
    }

    /// Peer addresses this rank sums, in blob order.
    fn sources(&self, view: &ParamView) -> Result<Vec<usize>, CommError> {
        let groups: &[(ChannelGroup, PeerSet)] = match self.algorithm {
            Algorithm::Direct | Algorithm::Scratch => &[(ChannelGroup::Sm, PeerSet::All)],
            Algorithm::TwoRound => &[(ChannelGroup::Round1, PeerSet::All)],
            Algorithm::Pipelined => &[(ChannelGroup::ReduceScatter, PeerSet::All)],
            // 跨节点的对端从其暂存区读取
            Algorithm::Hierarchical => &[
                (ChannelGroup::Sm, PeerSet::SameNode),
                (ChannelGroup::Proxy, PeerSet::CrossNode),
            ],
        };

        let mut ans = Vec::with_capacity(self.topo.nranks() - 1);
        for &(group, peers) in groups {
            let Some(handles) = view.handles(group) else {
                return Err(kernel_launch_failure(format!("no {group:?} handles")));
            };
            for (slot, peer) in peers.members(self.topo, self.rank).enumerate() {
                let handle = handles
                    .get(slot * HANDLE_SIZE..(slot + 1) * HANDLE_SIZE)
                    .and_then(PeerHandle::decode)
                    .ok_or_else(|| kernel_launch_failure(format!("{group:?} slot {slot} is corrupt")))?;
                if handle.peer != peer || handle.kind != group.kind() {
                    return Err(kernel_launch_failure(format!(
                        "{group:?} slot {slot} holds a {:?} handle of rank {}, rank {peer} expected",
                        handle.kind, handle.peer
                    )));
                }
                ans.push(handle.remote_buffer)
            }
        }
        Ok(ans)
    }

    fn run<T>(&self, n: usize, input: usize, staging: Option<usize>, sources: &[usize], dst: usize)
    where
        T: AddAssign + Copy + Send + Sync,
    {
        let own = unsafe { from_raw_parts(input as *const T, n) };
        if let Some(staging) = staging {
            unsafe { from_raw_parts_mut(staging as *mut T, n) }.copy_from_slice(own)
        }
        let mut acc = own.to_vec();

        self.fabric.wait();
        for &src in sources {
            let src = unsafe { from_raw_parts(src as *const T, n) };
            acc.par_iter_mut()
                .zip(src.par_iter())
                .for_each(|(a, &b)| *a += b);
        }
        self.fabric.wait();

        unsafe { from_raw_parts_mut(dst as *mut T, n) }.copy_from_slice(&acc)
    }
}

impl Kernel<Cpu> for CpuKernel {
    fn launch(
        &self,
        params: &[u8],
        grid: u32,
        block: u32,
        _shared_mem: usize,
        _queue: &ThisThread,
    ) -> Result<(), CommError> {
        if grid == 0 || block == 0 || block > MAX_BLOCK_SIZE {
            return Err(kernel_launch_failure(format!(
                "{} cannot launch {grid} x {block}",
                self.algorithm
            )));
        }

        let view = ParamView::new(
            params,
            self.algorithm.schema(),
            &self.topo,
            HandleWidths::uniform(HANDLE_SIZE),
        )
        .map_err(|e| kernel_launch_failure(e.info))?;
        if view.int(Field::Rank) != Some(self.rank as i32) {
            return Err(kernel_launch_failure(format!(
                "rank {} launched with the blob of {:?}",
                self.rank,
                view.int(Field::Rank)
            )));
        }
        let Some(n) = view.nelems() else {
            return Err(kernel_launch_failure("blob has no element count"));
        };
        let n = n as usize;

        let Some(input) = view.pointer(BufferRole::Input) else {
            return Err(kernel_launch_failure("blob has no input"));
        };
        let dst = view.pointer(BufferRole::Output).unwrap_or(input);
        let staging = view.pointer(BufferRole::Staging);
        if staging.is_some() && staging_len(n, self.topo.nranks_per_node()) < n {
            return Err(kernel_launch_failure(format!(
                "staging of {} elements cannot carry {n}",
                staging_len(n, self.topo.nranks_per_node())
            )));
        }
        let sources = self.sources(&view)?;

        macro_rules! run {
            ($( $dt:ident => $ty:ty )+) => {
                match self.dt {
                    $( digit_layout::types::$dt => self.run::<$ty>(n, input, staging, &sources, dst), )+
                    dt => return Err(unsupported_data_type(format!("{dt:?}"))),
                }
            };
        }
        run! {
            F16  => f16
            BF16 => bf16
            F32  => f32
            F64  => f64
            I32  => i32
            U32  => u32
        }
        Ok(())
    }
}

fn macro_value<'a>(key: &'a KernelKey, name: &str) -> Result<&'a str, CommError> {
    key.macro_value(name)
        .ok_or_else(|| args_not_support(format!("{} built without {name}", key.entry)))
}

fn macro_usize(key: &KernelKey, name: &str) -> Result<usize, CommError> {
    macro_value(key, name)?
        .parse()
        .map_err(|e| args_not_support(format!("{name} of {}: {e}", key.entry)))
}
