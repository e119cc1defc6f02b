// #![deny(warnings)]

mod common;
mod handle;

pub mod channel;
pub mod config;
pub mod params;
pub mod strategy;
pub mod topology;
pub mod transport;
pub mod tune;

pub use common::*;
pub use config::Config;
pub use strategy::{Algorithm, AllReduce, CollectiveOperation};
pub use topology::{PeerSet, Topology};
pub use tune::{AutoTune, Knob, TuneSpace, TuningConfig};

#[cfg(any(use_cpu, test))]
pub use handle::common_cpu;

use channel::{ChannelKind, ChannelRequest, DeviceHandle};
use digit_layout::DigitLayout;
use std::{collections::BTreeMap, fmt, ops::DerefMut, sync::Arc};
use transport::{Connection, Transport};

/// 算力硬件抽象。
///
/// 约定硬件如何存储和运行。
pub trait Hardware {
    /// 硬件的存储单元类型。
    type Byte;
    /// 硬件的任务队列类型。
    type Queue<'ctx>;
}

pub type ByteOf<H> = <H as Hardware>::Byte;
pub type QueueOf<'ctx, H> = <H as Hardware>::Queue<'ctx>;
pub(crate) type MutPtr<H> = *mut <H as Hardware>::Byte;

/// Per-peer values in ascending rank order.
pub type PeerMap<T> = BTreeMap<usize, T>;

pub trait Alloc<M> {
    fn alloc(&self, size: usize) -> M;
    fn free(&self, mem: M);
}

/// 一个节点上的设备：分配存储并加载计算核。
pub trait Device: Hardware + Alloc<Self::DevMem> + Clone {
    /// 分配器分配和回收的对象，表示对某块存储区域的所有权。
    type DevMem: DerefMut<Target = [ByteOf<Self>]>;
    /// 已编译的计算核。
    type Kernel: Kernel<Self>;

    fn load_kernel(&self, key: &KernelKey) -> Result<Arc<Self::Kernel>, CommError>;
}

/// A compiled entry point taking its arguments as one packed byte blob.
pub trait Kernel<H: Hardware> {
    fn launch(
        &self,
        params: &[u8],
        grid: u32,
        block: u32,
        shared_mem: usize,
        queue: &QueueOf<H>,
    ) -> Result<(), CommError>;
}

/// Identifies a kernel: source unit, entry point and the macros it is compiled with.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct KernelKey {
    pub file: &'static str,
    pub entry: &'static str,
    pub macros: Vec<(&'static str, String)>,
}

impl KernelKey {
    pub fn macro_value(&self, name: &str) -> Option<&str> {
        self.macros
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Background mediator shared by every proxy channel of a rank.
pub trait ProxyService {
    fn is_running(&self) -> bool;
}

/// 通信组中的一个节点。
///
/// 建立连接和交换通道都是集合操作，组内所有节点必须以一致的参数到达同一调用。
pub trait RankGroup: Clone {
    type Hardware: Device;
    type Proxy: ProxyService;

    fn processor(&self) -> &Self::Hardware;
    fn rank(&self) -> usize;
    fn group_size(&self) -> usize;

    fn barrier(&self) -> Result<(), CommError>;
    /// Opens one connection per planned peer.
    fn connect(&self, transports: &PeerMap<Transport>) -> Result<PeerMap<Connection>, CommError>;
    /// Registers the request's buffers with every connected peer and returns each peer's handle.
    fn exchange(
        &self,
        request: &ChannelRequest<Self::Hardware, Self::Proxy>,
    ) -> Result<PeerMap<DeviceHandle>, CommError>;
    /// Width in bytes of a device handle of `kind`.
    fn handle_size(&self, kind: ChannelKind) -> usize;
}

pub type HardwareOf<G> = <G as RankGroup>::Hardware;

/// A contiguous, homogeneously typed device buffer owned by someone else.
pub struct DevBuf<H: Hardware> {
    pub base: MutPtr<H>,
    pub len: usize,
    pub dt: DigitLayout,
}

impl<H: Hardware> DevBuf<H> {
    #[inline]
    pub fn new(base: MutPtr<H>, len: usize, dt: DigitLayout) -> Self {
        Self { base, len, dt }
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.base as usize
    }
}

impl<H: Hardware> Clone for DevBuf<H> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: Hardware> Copy for DevBuf<H> {}

impl<H: Hardware> PartialEq for DevBuf<H> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base && self.len == other.len && self.dt == other.dt
    }
}

impl<H: Hardware> fmt::Debug for DevBuf<H> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DevBuf({:#x}, {} x {:?})", self.addr(), self.len, self.dt)
    }
}
