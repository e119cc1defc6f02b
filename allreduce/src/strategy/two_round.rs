//! Reduce into a scratch in the first proxy round, spread the result in the second.

use super::{inner::Inner, Algorithm, Args};
use crate::{
    params::{BufferRole, ChannelGroup, Field, Schema},
    tune::{Knob, TuneSpace, TuningConfig},
    CommError, PeerSet, RankGroup,
};

pub(super) const SCHEMA: Schema = Schema::new(&[
    Field::Handles(ChannelGroup::Round1, PeerSet::All),
    Field::Handles(ChannelGroup::Round2, PeerSet::All),
    Field::Ptr(BufferRole::Input),
    Field::Ptr(BufferRole::Scratch),
    Field::Rank,
    Field::NRanks,
    Field::NElems,
]);

pub(super) const SPACE: TuneSpace = TuneSpace {
    nblocks: &[8, 12, 16, 24, 32, 48, 64, 72, 96, 108],
    block_size: &[256, 512, 1024],
    knobs: &[Knob::None],
};

pub(super) const DEFAULT: TuningConfig = TuningConfig {
    nblocks: 24,
    block_size: 1024,
    knob: Knob::None,
};

pub struct TwoRound<G: RankGroup>(Inner<G>);

impl<G: RankGroup> TwoRound<G> {
    pub fn new(group: &G, args: Args<G>) -> Result<Self, CommError> {
        let mut builder = Inner::builder(group, args, Algorithm::TwoRound)?;
        let len = builder.input().len;
        builder.alloc(BufferRole::Scratch, len)?;
        builder.channels(
            ChannelGroup::Round1,
            PeerSet::All,
            BufferRole::Input,
            Some(BufferRole::Scratch),
        )?;
        builder.channels(ChannelGroup::Round2, PeerSet::All, BufferRole::Input, None)?;
        builder.finish().map(Self)
    }
}

super::collective!(TwoRound);
