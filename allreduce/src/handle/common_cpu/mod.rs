//! In-process reference backend: every rank is a thread, device memory is host
//! memory and a "kernel" is a host function over the packed parameter blob.

mod inproc_group;
mod kernel;

pub use inproc_group::{InprocGroup, InprocProxy};
pub use kernel::CpuKernel;

use crate::{
    channel::{ChannelKind, DeviceHandle},
    transport::Transport,
    Alloc, Blob, CommError, Device, Hardware, KernelKey,
};
use lru::LruCache;
use std::{
    num::NonZeroUsize,
    sync::{Arc, Barrier, Mutex},
};

#[derive(Clone)]
pub struct Cpu {
    rank: usize,
    /// Synchronizes kernels of all ranks, like the device fabric would.
    fabric: Arc<Barrier>,
    kernels: Arc<Mutex<LruCache<KernelKey, Arc<CpuKernel>>>>,
}

#[derive(Clone, Copy, Debug)]
pub struct ThisThread;

impl Cpu {
    fn new(rank: usize, fabric: Arc<Barrier>, cache: usize) -> Self {
        let cache = NonZeroUsize::new(cache).unwrap_or(NonZeroUsize::MIN);
        Self {
            rank,
            fabric,
            kernels: Arc::new(Mutex::new(LruCache::new(cache))),
        }
    }
}

impl Hardware for Cpu {
    type Byte = u8;
    type Queue<'ctx> = ThisThread;
}

impl Alloc<Blob> for Cpu {
    #[inline]
    fn alloc(&self, size: usize) -> Blob {
        Blob::new(size)
    }

    #[inline]
    fn free(&self, _mem: Blob) {}
}

impl Device for Cpu {
    type DevMem = Blob;
    type Kernel = CpuKernel;

    fn load_kernel(&self, key: &KernelKey) -> Result<Arc<Self::Kernel>, CommError> {
        self.kernels
            .lock()
            .unwrap()
            .try_get_or_insert(key.clone(), || {
                CpuKernel::new(key, self.rank, self.fabric.clone()).map(Arc::new)
            })
            .cloned()
    }
}

/// Width of every device handle the reference backend produces.
pub const HANDLE_SIZE: usize = 48;

/// What a device handle of the reference backend carries.
///
/// | offset | field |
/// |:------:|:------|
/// | 0      | peer rank, `u32` |
/// | 4      | transport: 0 for IPC, `1 + i` for network `i` |
/// | 8      | kind: 0 for sm, 1 for proxy |
/// | 16     | peer's buffer |
/// | 24     | peer's scratch, 0 if none |
/// | 32     | own buffer |
/// | 40     | own scratch, 0 if none |
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PeerHandle {
    pub peer: usize,
    pub transport: Transport,
    pub kind: ChannelKind,
    pub remote_buffer: usize,
    pub remote_scratch: usize,
    pub local_buffer: usize,
    pub local_scratch: usize,
}

impl PeerHandle {
    pub fn encode(&self) -> DeviceHandle {
        let transport = match self.transport {
            Transport::CudaIpc => 0,
            Transport::Ib(i) => 1 + i as u32,
        };
        let kind = match self.kind {
            ChannelKind::Sm => 0u32,
            ChannelKind::Proxy => 1,
        };

        let mut ans = vec![0u8; HANDLE_SIZE];
        ans[0..4].copy_from_slice(&(self.peer as u32).to_ne_bytes());
        ans[4..8].copy_from_slice(&transport.to_ne_bytes());
        ans[8..12].copy_from_slice(&kind.to_ne_bytes());
        for (i, addr) in [
            self.remote_buffer,
            self.remote_scratch,
            self.local_buffer,
            self.local_scratch,
        ]
        .into_iter()
        .enumerate()
        {
            ans[16 + i * 8..][..8].copy_from_slice(&(addr as u64).to_ne_bytes())
        }
        ans.into()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HANDLE_SIZE {
            return None;
        }
        let u32_at = |at: usize| {
            let mut buf = [0; 4];
            buf.copy_from_slice(&bytes[at..][..4]);
            u32::from_ne_bytes(buf)
        };
        let addr_at = |at: usize| {
            let mut buf = [0; 8];
            buf.copy_from_slice(&bytes[at..][..8]);
            u64::from_ne_bytes(buf) as usize
        };

        let transport = match u32_at(4) {
            0 => Transport::CudaIpc,
            i => Transport::Ib(u8::try_from(i - 1).ok()?),
        };
        let kind = match u32_at(8) {
            0 => ChannelKind::Sm,
            1 => ChannelKind::Proxy,
            _ => return None,
        };
        Some(Self {
            peer: u32_at(0) as _,
            transport,
            kind,
            remote_buffer: addr_at(16),
            remote_scratch: addr_at(24),
            local_buffer: addr_at(32),
            local_scratch: addr_at(40),
        })
    }
}

#[test]
fn test_peer_handle() {
    let handle = PeerHandle {
        peer: 6,
        transport: Transport::Ib(2),
        kind: ChannelKind::Proxy,
        remote_buffer: 0x1000,
        remote_scratch: 0,
        local_buffer: 0x2000,
        local_scratch: 0x3000,
    };
    let bytes = handle.encode();
    assert_eq!(bytes.len(), HANDLE_SIZE);
    assert_eq!(&bytes[4..8], &3u32.to_ne_bytes());
    assert_eq!(&bytes[12..16], &[0; 4]);
    assert_eq!(PeerHandle::decode(&bytes), Some(handle));
    assert_eq!(PeerHandle::decode(&bytes[1..]), None);
}
