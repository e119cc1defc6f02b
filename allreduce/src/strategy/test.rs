use super::{hierarchical::staging_len, Algorithm, AllReduce, Args, CollectiveOperation};
use crate::{
    common_cpu::{Cpu, InprocGroup, InprocProxy, ThisThread, HANDLE_SIZE},
    params::{BufferRole, ChannelGroup, HandleWidths},
    transport::Transport,
    tune::{Knob, TuningConfig},
    CommErrorKind, Config, DevBuf, RankGroup, Topology,
};
use digit_layout::{
    types::{F16, F32, I32, I8},
    DigitLayout,
};
use half::f16;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{slice::from_raw_parts, sync::Arc, time::Duration};

fn on_every_rank<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(InprocGroup) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    InprocGroup::new(n, Config::default())
        .into_iter()
        .map(|group| {
            let f = f.clone();
            std::thread::spawn(move || f(group))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect()
}

/// A group where only rank 0 shows up; any rendezvous times out.
fn lonely_rank(n: usize) -> (InprocGroup, Vec<InprocGroup>) {
    let config = Config {
        rendezvous_timeout: Some(Duration::from_millis(100)),
        ..Config::default()
    };
    let mut groups = InprocGroup::new(n, config);
    let first = groups.remove(0);
    (first, groups)
}

fn dev_buf<T>(buf: &mut [T], dt: DigitLayout) -> DevBuf<Cpu> {
    DevBuf::new(buf.as_mut_ptr().cast(), buf.len(), dt)
}

fn read<T: Copy>(buf: &DevBuf<Cpu>) -> Vec<T> {
    unsafe { from_raw_parts(buf.base.cast::<T>(), buf.len) }.to_vec()
}

fn topology_for(algorithm: Algorithm) -> Topology {
    match algorithm {
        Algorithm::Direct | Algorithm::Scratch | Algorithm::TwoRound => {
            Topology::single_node(4).unwrap()
        }
        Algorithm::Pipelined | Algorithm::Hierarchical => Topology::new(8, 4).unwrap(),
    }
}

#[test]
fn test_blob_sizes() {
    let widths = HandleWidths::uniform(HANDLE_SIZE);
    let expected = [
        (Algorithm::Direct, 3 * 48 + 8 + 4 + 4 + 8 + 4),
        (Algorithm::Scratch, 3 * 48 + 3 * 8 + 4 + 4 + 8),
        (Algorithm::TwoRound, 2 * 3 * 48 + 2 * 8 + 4 + 4 + 8),
        (Algorithm::Pipelined, (3 + 7 + 7) * 48 + 2 * 8 + 4 * 4 + 8 + 4),
        (Algorithm::Hierarchical, (3 + 4) * 48 + 4 * 8 + 4 * 4 + 8),
    ];
    for (algorithm, size) in expected {
        let topo = topology_for(algorithm);
        assert_eq!(algorithm.schema().size(&topo, widths), size, "{algorithm}");
    }
    // 每种拓扑下对齐都成立
    for algorithm in Algorithm::ALL {
        for (nranks, npn) in [(1, 1), (2, 2), (3, 3), (8, 8), (2, 1), (6, 3), (16, 8)] {
            let topo = Topology::new(nranks, npn).unwrap();
            algorithm.schema().layout(&topo, widths);
            algorithm.schema().layout(&topo, HandleWidths { sm: 8, proxy: 24 });
        }
    }
}

#[test]
fn test_algorithm_names() {
    for algorithm in Algorithm::ALL {
        assert_eq!(algorithm.entry().parse::<Algorithm>().unwrap(), algorithm);
        assert_eq!(algorithm.to_string(), algorithm.entry());
    }
    assert_eq!(
        "allreduce6".parse::<Algorithm>().unwrap_err().kind,
        CommErrorKind::ArgsNotSupport
    );
    let lens = Algorithm::ALL.map(|a| a.tune_space().len());
    assert_eq!(lens, [60, 15, 30, 120, 9]);
    for algorithm in Algorithm::ALL {
        let default = algorithm.default_config();
        assert!(algorithm.tune_space().accepts(&default.knob));
    }
}

#[test]
fn test_sum_every_strategy() {
    for algorithm in Algorithm::ALL {
        let topo = topology_for(algorithm);
        let n = topo.nranks();
        on_every_rank(n, move |group| {
            let rank = group.rank();
            let mut buf = vec![(rank + 1) as f32; 1000];
            let mut out = vec![0f32; 1000];
            let mut args = Args::new(topo, dev_buf(&mut buf, F32))
                .with_proxy(Arc::new(InprocProxy::new()));
            if algorithm == Algorithm::Hierarchical {
                args = args.with_output(dev_buf(&mut out, F32));
            }
            let op = AllReduce::new(algorithm, &group, args).unwrap();
            assert_eq!(op.algorithm(), algorithm);
            assert_eq!(op.config(), algorithm.default_config());

            let result = *op.execute(&ThisThread).unwrap();
            let expected = (n * (n + 1) / 2) as f32;
            assert!(read::<f32>(&result).iter().all(|&x| x == expected), "{algorithm}");
            if algorithm == Algorithm::Hierarchical {
                assert_eq!(result.base, out.as_mut_ptr().cast());
                assert!(buf.iter().all(|&x| x == (rank + 1) as f32));
            } else {
                assert_eq!(result.base, buf.as_mut_ptr().cast());
            }
        });
    }
}

#[test]
fn test_random_sum() {
    const LEN: usize = 4096;
    let data = |rank: usize| {
        let mut rng = StdRng::seed_from_u64(rank as _);
        (0..LEN).map(|_| rng.gen_range(-1000..1000)).collect::<Vec<i32>>()
    };
    let topo = Topology::new(8, 4).unwrap();
    on_every_rank(8, move |group| {
        let mut buf = data(group.rank());
        let args = Args::new(topo, dev_buf(&mut buf, I32)).with_proxy(Arc::new(InprocProxy::new()));
        let op = AllReduce::new(Algorithm::Pipelined, &group, args).unwrap();
        op.execute(&ThisThread).unwrap();

        let mut expected = vec![0; LEN];
        for r in 0..8 {
            for (e, x) in expected.iter_mut().zip(data(r)) {
                *e += x
            }
        }
        assert_eq!(buf, expected);
    });
}

#[test]
fn test_half() {
    on_every_rank(2, |group| {
        let mut buf = vec![f16::from_f32(1.5); 64];
        let args = Args::new(Topology::single_node(2).unwrap(), dev_buf(&mut buf, F16));
        let op = AllReduce::new(Algorithm::Direct, &group, args).unwrap();
        op.execute(&ThisThread).unwrap();
        assert!(buf.iter().all(|&x| x == f16::from_f32(3.)));
    });
}

#[test]
fn test_direct_channels() {
    on_every_rank(4, |group| {
        let me = group.rank();
        let mut buf = vec![1f32; 256];
        let topo = Topology::single_node(4).unwrap();
        let mut op = AllReduce::new(Algorithm::Direct, &group, Args::new(topo, dev_buf(&mut buf, F32)))
            .unwrap();

        let connections = op.connections();
        assert_eq!(connections.len(), 3);
        assert!(!connections.contains_key(&me));
        assert!(connections.values().all(|c| c.transport == Transport::CudaIpc));

        let channels = op.channels(ChannelGroup::Sm).unwrap();
        assert_eq!(channels.len(), 3);
        let handles = channels.device_handles();
        let blob = op.params().as_bytes().to_vec();
        assert_eq!(blob.len(), 172);
        assert_eq!(&blob[..3 * HANDLE_SIZE], &*handles);
        assert_eq!(&blob[144..152], &(buf.as_ptr() as usize).to_ne_bytes());
        assert_eq!(&blob[152..156], &(me as i32).to_ne_bytes());
        assert_eq!(&blob[156..160], &4i32.to_ne_bytes());
        assert_eq!(&blob[160..168], &256u64.to_ne_bytes());
        assert_eq!(&blob[168..], &1i32.to_ne_bytes());

        op.configure(TuningConfig {
            nblocks: 8,
            block_size: 256,
            knob: Knob::ReadOnly(false),
        })
        .unwrap();
        let repacked = op.params().as_bytes();
        assert_eq!(repacked.len(), blob.len());
        assert_eq!(&repacked[..168], &blob[..168]);
        assert_eq!(&repacked[168..], &0i32.to_ne_bytes());
    });
}

#[test]
fn test_pipelined_channels() {
    on_every_rank(8, |group| {
        let me = group.rank();
        let mut buf = vec![0f32; 1 << 10];
        let topo = Topology::new(8, 4).unwrap();
        let args = Args::new(topo, dev_buf(&mut buf, F32)).with_proxy(Arc::new(InprocProxy::new()));
        let op = AllReduce::new(Algorithm::Pipelined, &group, args).unwrap();

        let connections = op.connections();
        assert_eq!(connections.len(), 7);
        for (&peer, c) in connections {
            if topo.same_node(me, peer) {
                assert_eq!(c.transport, Transport::CudaIpc)
            } else {
                assert_eq!(c.transport, Transport::Ib((peer % 4) as _))
            }
        }
        assert_eq!(op.channels(ChannelGroup::Sm).unwrap().len(), 3);
        assert_eq!(op.channels(ChannelGroup::ReduceScatter).unwrap().len(), 7);
        assert_eq!(op.channels(ChannelGroup::AllGather).unwrap().len(), 7);
        assert_eq!(op.buffer(BufferRole::Scratch).unwrap().len, 1 << 10);

        let blob = op.params().as_bytes();
        assert_eq!(blob.len(), 860);
        assert_eq!(&blob[832..836], &(me as i32).to_ne_bytes());
        assert_eq!(&blob[836..840], &4i32.to_ne_bytes());
        assert_eq!(&blob[840..844], &8i32.to_ne_bytes());
        assert_eq!(&blob[844..848], &[0; 4]);
        assert_eq!(&blob[848..856], &1024u64.to_ne_bytes());
        assert_eq!(&blob[856..], &3i32.to_ne_bytes());
    });
}

#[test]
fn test_scratch_out_of_place() {
    on_every_rank(2, |group| {
        let mut buf = vec![2f32; 100];
        let mut out = vec![0f32; 100];
        let args = Args::new(Topology::single_node(2).unwrap(), dev_buf(&mut buf, F32))
            .with_output(dev_buf(&mut out, F32));
        let op = AllReduce::new(Algorithm::Scratch, &group, args).unwrap();
        assert_eq!(op.buffer(BufferRole::Scratch).unwrap().len, 800);
        op.execute(&ThisThread).unwrap();
        assert!(out.iter().all(|&x| x == 4.));
        assert!(buf.iter().all(|&x| x == 2.));
    });
}

#[test]
fn test_hierarchical_truncated_staging() {
    on_every_rank(6, |group| {
        let mut buf = vec![1i32; 5];
        let mut out = vec![0i32; 5];
        let args = Args::new(Topology::new(6, 3).unwrap(), dev_buf(&mut buf, I32))
            .with_output(dev_buf(&mut out, I32))
            .with_proxy(Arc::new(InprocProxy::new()));
        let op = AllReduce::new(Algorithm::Hierarchical, &group, args).unwrap();
        assert_eq!(op.buffer(BufferRole::Staging).unwrap().len, staging_len(5, 3));
        assert_eq!(op.buffer(BufferRole::Staging).unwrap().len, 13);
        assert_eq!(op.buffer(BufferRole::Scratch).unwrap().len, 40);
        assert_eq!(op.channels(ChannelGroup::Sm).unwrap().len(), 2);
        assert_eq!(op.channels(ChannelGroup::Proxy).unwrap().len(), 3);
        op.execute(&ThisThread).unwrap();
        assert_eq!(out, [6; 5]);
    });
}

#[test]
fn test_execute_n() {
    on_every_rank(2, |group| {
        let mut buf = vec![1u32; 8];
        let args = Args::new(
            Topology::single_node(2).unwrap(),
            dev_buf(&mut buf, digit_layout::types::U32),
        );
        let op = AllReduce::new(Algorithm::Direct, &group, args).unwrap();
        let e = op.execute_n(9, &ThisThread).unwrap_err();
        assert_eq!(e.kind, CommErrorKind::ArgsNotSupport);

        op.execute_n(4, &ThisThread).unwrap();
        assert_eq!(buf, [2, 2, 2, 2, 1, 1, 1, 1]);
        // 元素数只在这次调用中被替换
        assert_eq!(&op.params().as_bytes()[64..72], &8u64.to_ne_bytes());
    });
}

#[test]
fn test_launch_failure_keeps_channels() {
    let group = InprocGroup::new(1, Config::default()).pop().unwrap();
    let mut buf = vec![3f32; 16];
    let args = Args::new(Topology::single_node(1).unwrap(), dev_buf(&mut buf, F32));
    let mut op = AllReduce::new(Algorithm::Direct, &group, args).unwrap();

    op.configure(TuningConfig {
        nblocks: 24,
        block_size: 2048,
        knob: Knob::ReadOnly(true),
    })
    .unwrap();
    let e = op.execute(&ThisThread).unwrap_err();
    assert_eq!(e.kind, CommErrorKind::KernelLaunchFailure);

    op.configure(Algorithm::Direct.default_config()).unwrap();
    op.execute(&ThisThread).unwrap();
    assert!(buf.iter().all(|&x| x == 3.));
}

#[test]
fn test_configure() {
    let group = InprocGroup::new(1, Config::default()).pop().unwrap();
    let mut buf = vec![0f32; 16];
    let args = Args::new(Topology::single_node(1).unwrap(), dev_buf(&mut buf, F32));
    let mut op = AllReduce::new(Algorithm::Direct, &group, args).unwrap();
    let before = op.params().clone();

    let e = op
        .configure(TuningConfig {
            nblocks: 24,
            block_size: 1024,
            knob: Knob::PipelineDepth(2),
        })
        .unwrap_err();
    assert_eq!(e.kind, CommErrorKind::ArgsNotSupport);
    let e = op
        .configure(TuningConfig {
            nblocks: 0,
            block_size: 1024,
            knob: Knob::ReadOnly(true),
        })
        .unwrap_err();
    assert_eq!(e.kind, CommErrorKind::ArgsNotSupport);
    assert_eq!(op.config(), Algorithm::Direct.default_config());
    assert_eq!(op.params(), &before);

    let config = TuningConfig {
        nblocks: 64,
        block_size: 512,
        knob: Knob::ReadOnly(true),
    };
    op.configure(config).unwrap();
    op.configure(config).unwrap();
    assert_eq!(op.config(), config);
    assert_eq!(op.params(), &before);
}

#[test]
fn test_auto_tune() {
    let group = InprocGroup::new(1, Config::default()).pop().unwrap();
    let mut buf = vec![0f32; 16];
    let args = Args::new(Topology::single_node(1).unwrap(), dev_buf(&mut buf, F32));
    let mut op = AllReduce::new(Algorithm::Direct, &group, args).unwrap();
    let len = op.params().len();

    let mut tune = op.auto_tune();
    assert_eq!(tune.size_hint(), (60, Some(60)));
    let first = tune.next().unwrap().unwrap();
    assert_eq!(
        first,
        TuningConfig {
            nblocks: 8,
            block_size: 256,
            knob: Knob::ReadOnly(false),
        }
    );
    assert_eq!(tune.op().config(), first);
    let rest = tune.by_ref().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(rest.len(), 59);
    assert_eq!(
        rest[0],
        TuningConfig {
            nblocks: 8,
            block_size: 256,
            knob: Knob::ReadOnly(true),
        }
    );
    let last = *rest.last().unwrap();
    assert_eq!(
        last,
        TuningConfig {
            nblocks: 108,
            block_size: 1024,
            knob: Knob::ReadOnly(true),
        }
    );
    assert!(tune.next().is_none());
    assert_eq!(tune.position(), 60);

    tune.restart();
    assert_eq!(tune.next().unwrap().unwrap(), first);
    drop(tune);
    assert_eq!(op.config(), first);
    assert_eq!(op.params().len(), len);

    let again = op.auto_tune().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(again[0], first);
    assert_eq!(&again[1..], &rest[..]);
}

#[test]
fn test_select_fastest() {
    let group = InprocGroup::new(1, Config::default()).pop().unwrap();
    let mut buf = vec![1f32; 16];
    let args = Args::new(Topology::single_node(1).unwrap(), dev_buf(&mut buf, F32));
    let mut op = AllReduce::new(Algorithm::Scratch, &group, args).unwrap();

    let target = TuningConfig {
        nblocks: 63,
        block_size: 512,
        knob: Knob::None,
    };
    let mut count = 0;
    let (best, time) = op
        .auto_tune()
        .select_fastest(|op, config| {
            count += 1;
            op.execute(&ThisThread)?;
            Ok(Duration::from_micros(if config == target { 5 } else { 10 }))
        })
        .unwrap();
    assert_eq!(count, 15);
    assert_eq!(best, target);
    assert_eq!(time, Duration::from_micros(5));
    assert_eq!(op.config(), target);
}

#[test]
fn test_reject_before_rendezvous() {
    let (group, _rest) = lonely_rank(4);
    let topo = Topology::single_node(4).unwrap();

    let mut buf = vec![0i8; 16];
    let e = AllReduce::new(Algorithm::Direct, &group, Args::new(topo, dev_buf(&mut buf, I8)))
        .err()
        .unwrap();
    assert_eq!(e.kind, CommErrorKind::UnsupportedDataType);

    let mut buf = vec![0f32; 16];
    let e = AllReduce::new(Algorithm::TwoRound, &group, Args::new(topo, dev_buf(&mut buf, F32)))
        .err()
        .unwrap();
    assert_eq!(e.kind, CommErrorKind::ChannelCreationFailure);

    let stopped = Arc::new(InprocProxy::new());
    stopped.stop();
    let args = Args::new(topo, dev_buf(&mut buf, F32)).with_proxy(stopped);
    let e = AllReduce::new(Algorithm::TwoRound, &group, args).err().unwrap();
    assert_eq!(e.kind, CommErrorKind::ChannelCreationFailure);

    let e = AllReduce::new(
        Algorithm::Direct,
        &group,
        Args::new(Topology::new(4, 2).unwrap(), dev_buf(&mut buf, F32)),
    )
    .err()
    .unwrap();
    assert_eq!(e.kind, CommErrorKind::TransportUnavailable);

    let e = AllReduce::new(
        Algorithm::Direct,
        &group,
        Args::new(Topology::single_node(2).unwrap(), dev_buf(&mut buf, F32)),
    )
    .err()
    .unwrap();
    assert_eq!(e.kind, CommErrorKind::InvalidTopology);

    let args = Args::new(Topology::new(4, 2).unwrap(), dev_buf(&mut buf, F32))
        .with_proxy(Arc::new(InprocProxy::new()));
    let e = AllReduce::new(Algorithm::Hierarchical, &group, args).err().unwrap();
    assert_eq!(e.kind, CommErrorKind::ArgsNotSupport);

    let mut small = vec![0f32; 8];
    let args = Args::new(topo, dev_buf(&mut buf, F32)).with_output(dev_buf(&mut small, F32));
    let e = AllReduce::new(Algorithm::Scratch, &group, args).err().unwrap();
    assert_eq!(e.kind, CommErrorKind::ArgsNotSupport);

    let pool = Config {
        network_pool: vec![Transport::Ib(0)],
        ..Config::default()
    };
    let args = Args::new(Topology::new(4, 2).unwrap(), dev_buf(&mut buf, F32))
        .with_proxy(Arc::new(InprocProxy::new()))
        .with_config(&pool);
    let e = AllReduce::new(Algorithm::Pipelined, &group, args).err().unwrap();
    assert_eq!(e.kind, CommErrorKind::TransportUnavailable);
}

#[test]
fn test_absent_peer_times_out() {
    let (group, _rest) = lonely_rank(2);
    let mut buf = vec![0f32; 16];
    let args = Args::new(Topology::single_node(2).unwrap(), dev_buf(&mut buf, F32));
    let e = AllReduce::new(Algorithm::Direct, &group, args).err().unwrap();
    assert_eq!(e.kind, CommErrorKind::RendezvousTimeout);
}
