//! Every rank reads every peer's input directly and reduces in place.

use super::{inner::Inner, Algorithm, Args};
use crate::{
    params::{BufferRole, ChannelGroup, Field, Schema},
    tune::{Knob, TuneSpace, TuningConfig},
    CommError, PeerSet, RankGroup,
};

pub(super) const SCHEMA: Schema = Schema::new(&[
    Field::Handles(ChannelGroup::Sm, PeerSet::All),
    Field::Ptr(BufferRole::Input),
    Field::Rank,
    Field::NRanks,
    Field::NElems,
    Field::ReadOnly,
]);

pub(super) const SPACE: TuneSpace = TuneSpace {
    nblocks: &[8, 12, 16, 24, 32, 48, 64, 72, 96, 108],
    block_size: &[256, 512, 1024],
    knobs: &[Knob::ReadOnly(false), Knob::ReadOnly(true)],
};

pub(super) const DEFAULT: TuningConfig = TuningConfig {
    nblocks: 24,
    block_size: 1024,
    knob: Knob::ReadOnly(true),
};

pub struct Direct<G: RankGroup>(Inner<G>);

impl<G: RankGroup> Direct<G> {
    pub fn new(group: &G, args: Args<G>) -> Result<Self, CommError> {
        let mut builder = Inner::builder(group, args, Algorithm::Direct)?;
        builder.channels(ChannelGroup::Sm, PeerSet::All, BufferRole::Input, None)?;
        builder.finish().map(Self)
    }
}

super::collective!(Direct);
