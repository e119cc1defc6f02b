use crate::{
    channel_creation_failure, transport::Connection, CommError, DevBuf, Hardware, PeerMap,
    ProxyService, RankGroup,
};
use log::debug;

/// Raw bytes of a channel as device code sees it.
pub type DeviceHandle = Box<[u8]>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ChannelKind {
    /// Direct peer memory access over IPC.
    Sm,
    /// Mediated by the rank's proxy service. Required for network transports.
    Proxy,
}

/// What a rank offers to its peers in one rendezvous.
pub struct ChannelRequest<'a, H: Hardware, P> {
    pub kind: ChannelKind,
    pub connections: &'a PeerMap<Connection>,
    pub buffer: DevBuf<H>,
    pub scratch: Option<DevBuf<H>>,
    pub proxy: Option<&'a P>,
}

#[derive(Clone, Debug)]
pub struct Channel {
    pub connection: Connection,
    pub kind: ChannelKind,
    pub handle: DeviceHandle,
}

/// Channels of one kind, bound to the same buffers, keyed by peer rank.
#[derive(Clone, Debug)]
pub struct ChannelSet {
    kind: ChannelKind,
    channels: PeerMap<Channel>,
}

impl ChannelSet {
    #[inline]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    #[inline]
    pub fn get(&self, peer: usize) -> Option<&Channel> {
        self.channels.get(&peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = usize> + '_ {
        self.channels.keys().copied()
    }

    /// Handles of every channel concatenated in ascending peer order.
    pub fn device_handles(&self) -> Box<[u8]> {
        self.channels
            .values()
            .flat_map(|c| c.handle.iter().copied())
            .collect()
    }

    /// Slot of each peer inside [`Self::device_handles`].
    pub fn index(&self) -> PeerIndex {
        PeerIndex::new(self.peers())
    }
}

/// Explicit rank to slot renumbering of a handle array.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PeerIndex(Box<[usize]>);

impl PeerIndex {
    pub fn new(peers: impl IntoIterator<Item = usize>) -> Self {
        let mut peers = peers.into_iter().collect::<Vec<_>>();
        peers.sort_unstable();
        peers.dedup();
        Self(peers.into())
    }

    /// Every rank of the group except `me`.
    pub fn skip_self(nranks: usize, me: usize) -> Self {
        Self((0..nranks).filter(|&r| r != me).collect())
    }

    #[inline]
    pub fn slot(&self, peer: usize) -> Option<usize> {
        self.0.binary_search(&peer).ok()
    }

    #[inline]
    pub fn peer(&self, slot: usize) -> Option<usize> {
        self.0.get(slot).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub struct ChannelRegistry;

impl ChannelRegistry {
    /// Collectively builds one channel per connection.
    ///
    /// Every rank of the group must reach this call with a matching connection set,
    /// otherwise the rendezvous inside [`RankGroup::exchange`] never completes.
    pub fn establish<G: RankGroup>(
        group: &G,
        kind: ChannelKind,
        connections: &PeerMap<Connection>,
        buffer: DevBuf<G::Hardware>,
        scratch: Option<DevBuf<G::Hardware>>,
        proxy: Option<&G::Proxy>,
    ) -> Result<ChannelSet, CommError> {
        let me = group.rank();
        match kind {
            ChannelKind::Sm => {
                if let Some(c) = connections.values().find(|c| c.transport.is_network()) {
                    return Err(channel_creation_failure(format!(
                        "rank {me} -> rank {}: sm channel over {} requires a proxy channel",
                        c.peer, c.transport
                    )));
                }
            }
            ChannelKind::Proxy => match proxy {
                Some(proxy) if proxy.is_running() => {}
                Some(_) => {
                    return Err(channel_creation_failure(format!(
                        "rank {me}: proxy service is not running"
                    )))
                }
                None => {
                    return Err(channel_creation_failure(format!(
                        "rank {me}: proxy channels need a proxy service"
                    )))
                }
            },
        }

        let mut handles = group.exchange(&ChannelRequest {
            kind,
            connections,
            buffer,
            scratch,
            proxy,
        })?;

        let width = group.handle_size(kind);
        let mut channels = PeerMap::new();
        for (&peer, &connection) in connections {
            let Some(handle) = handles.remove(&peer) else {
                return Err(channel_creation_failure(format!(
                    "rank {me}: no {kind:?} handle from rank {peer}"
                )));
            };
            if handle.len() != width {
                return Err(channel_creation_failure(format!(
                    "rank {me}: {kind:?} handle from rank {peer} is {} bytes, {width} expected",
                    handle.len()
                )));
            }
            channels.insert(
                peer,
                Channel {
                    connection,
                    kind,
                    handle,
                },
            );
        }
        if let Some(&peer) = handles.keys().next() {
            return Err(channel_creation_failure(format!(
                "rank {me}: unexpected {kind:?} handle from rank {peer}"
            )));
        }

        debug!(
            "rank {me} established {} {kind:?} channels to {:?}",
            channels.len(),
            channels.keys().collect::<Vec<_>>()
        );
        Ok(ChannelSet { kind, channels })
    }
}

#[cfg(test)]
mod test {
    use super::{ChannelKind, ChannelRegistry, PeerIndex};
    use crate::{
        common_cpu::{InprocGroup, InprocProxy},
        transport::{Policy, TransportPlanner},
        CommErrorKind, Config, DevBuf, RankGroup, Topology,
    };
    use digit_layout::types::F32;

    #[test]
    fn test_peer_index() {
        let index = PeerIndex::skip_self(4, 2);
        assert_eq!(index.len(), 3);
        assert_eq!(index.slot(0), Some(0));
        assert_eq!(index.slot(1), Some(1));
        assert_eq!(index.slot(2), None);
        assert_eq!(index.slot(3), Some(2));
        assert_eq!(index.peer(2), Some(3));
        for me in 0..8 {
            let index = PeerIndex::skip_self(8, me);
            for r in (0..8).filter(|&r| r != me) {
                let expected = if r < me { r } else { r - 1 };
                assert_eq!(index.slot(r), Some(expected));
            }
        }
        assert_eq!(PeerIndex::new([7, 5, 6, 5]), PeerIndex::new([5, 6, 7]));
    }

    #[test]
    fn test_establish() {
        let topo = Topology::single_node(4).unwrap();
        InprocGroup::new(4, Config::default())
            .into_iter()
            .map(|group| {
                std::thread::spawn(move || {
                    let me = group.rank();
                    let mut buf = vec![0f32; 16];
                    let buffer = DevBuf::new(buf.as_mut_ptr().cast(), buf.len(), F32);

                    let plan = TransportPlanner::new(Config::default().network_pool)
                        .plan(&topo, me, Policy::IpcOnly)
                        .unwrap();
                    let connections = group.connect(&plan).unwrap();
                    let set = ChannelRegistry::establish(
                        &group,
                        ChannelKind::Sm,
                        &connections,
                        buffer,
                        None,
                        None,
                    )
                    .unwrap();
                    assert_eq!(set.len(), 3);
                    assert_eq!(set.kind(), ChannelKind::Sm);
                    assert!(set.get(me).is_none());
                    let width = group.handle_size(ChannelKind::Sm);
                    let handles = set.device_handles();
                    assert_eq!(handles.len(), 3 * width);
                    let index = set.index();
                    for peer in set.peers() {
                        let slot = index.slot(peer).unwrap();
                        assert_eq!(
                            &handles[slot * width..][..width],
                            &*set.get(peer).unwrap().handle
                        );
                    }
                    group.barrier().unwrap();
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .for_each(|h| h.join().unwrap());
    }

    #[test]
    fn test_proxy_required() {
        let topo = Topology::new(2, 1).unwrap();
        InprocGroup::new(2, Config::default())
            .into_iter()
            .map(|group| {
                std::thread::spawn(move || {
                    let me = group.rank();
                    let mut buf = vec![0f32; 4];
                    let buffer = DevBuf::new(buf.as_mut_ptr().cast(), buf.len(), F32);
                    let plan = TransportPlanner::new(Config::default().network_pool)
                        .plan(&topo, me, Policy::Mixed)
                        .unwrap();
                    let connections = group.connect(&plan).unwrap();

                    let e = ChannelRegistry::establish(
                        &group,
                        ChannelKind::Proxy,
                        &connections,
                        buffer,
                        None,
                        None,
                    )
                    .unwrap_err();
                    assert_eq!(e.kind, CommErrorKind::ChannelCreationFailure);

                    let e = ChannelRegistry::establish(
                        &group,
                        ChannelKind::Sm,
                        &connections,
                        buffer,
                        None,
                        None,
                    )
                    .unwrap_err();
                    assert_eq!(e.kind, CommErrorKind::ChannelCreationFailure);

                    let stopped = InprocProxy::new();
                    stopped.stop();
                    let e = ChannelRegistry::establish(
                        &group,
                        ChannelKind::Proxy,
                        &connections,
                        buffer,
                        None,
                        Some(&stopped),
                    )
                    .unwrap_err();
                    assert_eq!(e.kind, CommErrorKind::ChannelCreationFailure);

                    let proxy = InprocProxy::new();
                    let set = ChannelRegistry::establish(
                        &group,
                        ChannelKind::Proxy,
                        &connections,
                        buffer,
                        None,
                        Some(&proxy),
                    )
                    .unwrap();
                    assert_eq!(set.len(), 1);
                    group.barrier().unwrap();
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .for_each(|h| h.join().unwrap());
    }
}
