//! Direct channels reduce inside the node while proxy channels carry the
//! reduce-scatter and all-gather phases, overlapped `depth` chunks deep.

use super::{inner::Inner, Algorithm, Args};
use crate::{
    params::{BufferRole, ChannelGroup, Field, Schema},
    tune::{Knob, TuneSpace, TuningConfig},
    CommError, PeerSet, RankGroup,
};

pub(super) const SCHEMA: Schema = Schema::new(&[
    Field::Handles(ChannelGroup::Sm, PeerSet::SameNode),
    Field::Handles(ChannelGroup::ReduceScatter, PeerSet::All),
    Field::Handles(ChannelGroup::AllGather, PeerSet::All),
    Field::Ptr(BufferRole::Input),
    Field::Ptr(BufferRole::Scratch),
    Field::Rank,
    Field::NRanksPerNode,
    Field::NRanks,
    Field::Pad(4),
    Field::NElems,
    Field::PipelineDepth,
]);

pub(super) const SPACE: TuneSpace = TuneSpace {
    nblocks: &[24, 32, 40, 45, 48, 64, 72, 90, 96, 108],
    block_size: &[256, 512, 1024],
    knobs: &[
        Knob::PipelineDepth(1),
        Knob::PipelineDepth(2),
        Knob::PipelineDepth(3),
        Knob::PipelineDepth(4),
    ],
};

pub(super) const DEFAULT: TuningConfig = TuningConfig {
    nblocks: 45,
    block_size: 512,
    knob: Knob::PipelineDepth(3),
};

pub struct Pipelined<G: RankGroup>(Inner<G>);

impl<G: RankGroup> Pipelined<G> {
    pub fn new(group: &G, args: Args<G>) -> Result<Self, CommError> {
        let mut builder = Inner::builder(group, args, Algorithm::Pipelined)?;
        let len = builder.input().len;
        builder.alloc(BufferRole::Scratch, len)?;
        builder.channels(ChannelGroup::Sm, PeerSet::SameNode, BufferRole::Input, None)?;
        builder.channels(
            ChannelGroup::ReduceScatter,
            PeerSet::All,
            BufferRole::Input,
            Some(BufferRole::Scratch),
        )?;
        builder.channels(ChannelGroup::AllGather, PeerSet::All, BufferRole::Input, None)?;
        builder.finish().map(Self)
    }
}

super::collective!(Pipelined);
