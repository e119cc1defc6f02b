use super::{Cpu, PeerHandle, HANDLE_SIZE};
use crate::{
    channel::{ChannelKind, ChannelRequest, DeviceHandle},
    channel_creation_failure, rendezvous_timeout,
    transport::{Connection, Transport},
    CommError, Config, PeerMap, ProxyService, RankGroup,
};
use log::warn;
use std::{
    cmp::Ordering,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::Relaxed},
        mpsc::{channel, Receiver, RecvTimeoutError, Sender},
        Arc, Barrier, Mutex,
    },
    time::{Duration, Instant},
};

#[derive(Clone, Copy, Debug)]
enum Body {
    Barrier,
    Connect {
        network: bool,
    },
    Register {
        kind: ChannelKind,
        buffer: usize,
        scratch: usize,
    },
}

struct Message {
    seq: u64,
    from: usize,
    body: Body,
}

struct Mailbox {
    receiver: Receiver<Message>,
    /// Messages of rendezvous this rank has not reached yet.
    early: Vec<Message>,
}

/// 进程内的通信组，每个线程作为一个节点。
///
/// Every collective call is one numbered rendezvous, so clones of a rank share
/// the sequence counter and must not run collectives concurrently.
#[derive(Clone)]
pub struct InprocGroup {
    device: Cpu,
    senders: Box<[Sender<Message>]>,
    mailbox: Arc<Mutex<Mailbox>>,
    seq: Arc<AtomicU64>,
    timeout: Option<Duration>,
}

impl InprocGroup {
    pub fn new(n: usize, config: Config) -> Vec<Self> {
        let mut senders = Vec::with_capacity(n);
        let mut receivers = Vec::with_capacity(n);
        for _ in 0..n {
            let (sender, receiver) = channel();
            senders.push(sender);
            receivers.push(receiver);
        }
        let senders: Box<[Sender<Message>]> = senders.into();
        let fabric = Arc::new(Barrier::new(n));

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| Self {
                device: Cpu::new(rank, fabric.clone(), config.kernel_cache),
                senders: senders.clone(),
                mailbox: Arc::new(Mutex::new(Mailbox {
                    receiver,
                    early: Vec::new(),
                })),
                seq: Arc::new(AtomicU64::new(0)),
                timeout: config.rendezvous_timeout,
            })
            .collect()
    }

    /// Sends `outgoing` and collects one message from each of its peers.
    fn rendezvous(&self, outgoing: PeerMap<Body>) -> Result<PeerMap<Body>, CommError> {
        let me = self.device.rank;
        let seq = self.seq.fetch_add(1, Relaxed);
        for (&peer, &body) in &outgoing {
            self.senders[peer]
                .send(Message {
                    seq,
                    from: me,
                    body,
                })
                .map_err(|_| channel_creation_failure(format!("rank {me}: rank {peer} is gone")))?
        }

        let mut mailbox = self.mailbox.lock().unwrap();
        let mut ans = PeerMap::new();
        mailbox.early.retain(|msg| {
            if msg.seq == seq {
                ans.insert(msg.from, msg.body);
                false
            } else {
                true
            }
        });

        let deadline = self.timeout.map(|t| Instant::now() + t);
        while ans.len() < outgoing.len() {
            let msg = match deadline {
                Some(deadline) => mailbox
                    .receiver
                    .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                    .map_err(|e| match e {
                        RecvTimeoutError::Timeout => rendezvous_timeout(format!(
                            "rank {me}: {} of {} peers reached rendezvous {seq}",
                            ans.len(),
                            outgoing.len()
                        )),
                        RecvTimeoutError::Disconnected => {
                            channel_creation_failure(format!("rank {me}: group is gone"))
                        }
                    })?,
                None => mailbox
                    .receiver
                    .recv()
                    .map_err(|_| channel_creation_failure(format!("rank {me}: group is gone")))?,
            };
            match msg.seq.cmp(&seq) {
                Ordering::Equal if outgoing.contains_key(&msg.from) => {
                    ans.insert(msg.from, msg.body);
                }
                Ordering::Equal => {
                    return Err(channel_creation_failure(format!(
                        "rank {me}: rank {} joined rendezvous {seq} uninvited",
                        msg.from
                    )))
                }
                Ordering::Greater => mailbox.early.push(msg),
                Ordering::Less => warn!(
                    "rank {me} drops message {} from rank {}, already at {seq}",
                    msg.seq, msg.from
                ),
            }
        }
        Ok(ans)
    }
}

impl RankGroup for InprocGroup {
    type Hardware = Cpu;
    type Proxy = InprocProxy;

    #[inline]
    fn processor(&self) -> &Cpu {
        &self.device
    }
    #[inline]
    fn rank(&self) -> usize {
        self.device.rank
    }
    #[inline]
    fn group_size(&self) -> usize {
        self.senders.len()
    }

    fn barrier(&self) -> Result<(), CommError> {
        let me = self.rank();
        let answers = self.rendezvous(
            (0..self.group_size())
                .filter(|&r| r != me)
                .map(|r| (r, Body::Barrier))
                .collect(),
        )?;
        match answers.iter().find(|(_, body)| !matches!(body, Body::Barrier)) {
            Some((peer, body)) => Err(channel_creation_failure(format!(
                "rank {me}: rank {peer} sent {body:?} at a barrier"
            ))),
            None => Ok(()),
        }
    }

    fn connect(&self, transports: &PeerMap<Transport>) -> Result<PeerMap<Connection>, CommError> {
        let me = self.rank();
        let answers = self.rendezvous(
            transports
                .iter()
                .map(|(&peer, t)| {
                    let network = t.is_network();
                    (peer, Body::Connect { network })
                })
                .collect(),
        )?;
        transports
            .iter()
            .map(|(&peer, &transport)| match answers.get(&peer) {
                Some(&Body::Connect { network }) if network == transport.is_network() => {
                    Ok((peer, Connection { peer, transport }))
                }
                Some(&Body::Connect { .. }) => Err(channel_creation_failure(format!(
                    "rank {me} and rank {peer} disagree on the transport class of {transport}"
                ))),
                other => Err(channel_creation_failure(format!(
                    "rank {me}: rank {peer} answered {other:?} to a connection"
                ))),
            })
            .collect()
    }

    fn exchange(
        &self,
        request: &ChannelRequest<Cpu, InprocProxy>,
    ) -> Result<PeerMap<DeviceHandle>, CommError> {
        let me = self.rank();
        let &ChannelRequest {
            kind,
            connections,
            buffer,
            scratch,
            ..
        } = request;
        let local_buffer = buffer.addr();
        let local_scratch = scratch.map_or(0, |s| s.addr());

        let answers = self.rendezvous(
            connections
                .keys()
                .map(|&peer| {
                    let body = Body::Register {
                        kind,
                        buffer: local_buffer,
                        scratch: local_scratch,
                    };
                    (peer, body)
                })
                .collect(),
        )?;
        connections
            .values()
            .map(|&Connection { peer, transport }| match answers.get(&peer) {
                Some(&Body::Register {
                    kind: theirs,
                    buffer,
                    scratch,
                }) if theirs == kind => {
                    let handle = PeerHandle {
                        peer,
                        transport,
                        kind,
                        remote_buffer: buffer,
                        remote_scratch: scratch,
                        local_buffer,
                        local_scratch,
                    };
                    Ok((peer, handle.encode()))
                }
                other => Err(channel_creation_failure(format!(
                    "rank {me}: rank {peer} answered {other:?} to a {kind:?} registration"
                ))),
            })
            .collect()
    }

    #[inline]
    fn handle_size(&self, _kind: ChannelKind) -> usize {
        HANDLE_SIZE
    }
}

/// Stands in for the host thread that would move proxy channel traffic.
#[derive(Debug)]
pub struct InprocProxy {
    running: AtomicBool,
}

impl InprocProxy {
    #[inline]
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn start(&self) {
        self.running.store(true, Relaxed)
    }

    #[inline]
    pub fn stop(&self) {
        self.running.store(false, Relaxed)
    }
}

impl Default for InprocProxy {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyService for InprocProxy {
    #[inline]
    fn is_running(&self) -> bool {
        self.running.load(Relaxed)
    }
}
