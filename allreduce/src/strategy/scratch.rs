//! Peers push into an 8x scratch before the reduction, so the result may land
//! in a separate output buffer.

use super::{inner::Inner, Algorithm, Args};
use crate::{
    params::{BufferRole, ChannelGroup, Field, Schema},
    tune::{Knob, TuneSpace, TuningConfig},
    CommError, PeerSet, RankGroup,
};

/// Scratch length in multiples of the input.
pub const SCRATCH_FACTOR: usize = 8;

pub(super) const SCHEMA: Schema = Schema::new(&[
    Field::Handles(ChannelGroup::Sm, PeerSet::All),
    Field::Ptr(BufferRole::Input),
    Field::Ptr(BufferRole::Scratch),
    Field::Ptr(BufferRole::Output),
    Field::Rank,
    Field::NRanks,
    Field::NElems,
]);

pub(super) const SPACE: TuneSpace = TuneSpace {
    nblocks: &[21, 42, 63, 84, 105],
    block_size: &[256, 512, 1024],
    knobs: &[Knob::None],
};

pub(super) const DEFAULT: TuningConfig = TuningConfig {
    nblocks: 21,
    block_size: 512,
    knob: Knob::None,
};

pub struct Scratch<G: RankGroup>(Inner<G>);

impl<G: RankGroup> Scratch<G> {
    /// Without [`Args::output`] the result overwrites the input.
    pub fn new(group: &G, args: Args<G>) -> Result<Self, CommError> {
        let mut builder = Inner::builder(group, args, Algorithm::Scratch)?;
        let len = builder.input().len;
        builder.alloc(BufferRole::Scratch, len * SCRATCH_FACTOR)?;
        builder.channels(
            ChannelGroup::Sm,
            PeerSet::All,
            BufferRole::Input,
            Some(BufferRole::Scratch),
        )?;
        builder.finish().map(Self)
    }
}

super::collective!(Scratch);
