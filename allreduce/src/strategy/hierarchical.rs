//! Reduce inside the node over direct channels, exchange node partials through
//! a staging buffer over proxy channels, and write the sum to a distinct output.

use super::{inner::Inner, Algorithm, Args};
use crate::{
    params::{BufferRole, ChannelGroup, Field, Schema},
    tune::{Knob, TuneSpace, TuningConfig},
    CommError, PeerSet, RankGroup,
};
use log::warn;

/// Scratch length in multiples of the input.
pub const SCRATCH_FACTOR: usize = 8;

pub(super) const SCHEMA: Schema = Schema::new(&[
    Field::Handles(ChannelGroup::Sm, PeerSet::SameNode),
    Field::Handles(ChannelGroup::Proxy, PeerSet::CrossNode),
    Field::Ptr(BufferRole::Input),
    Field::Ptr(BufferRole::Scratch),
    Field::Ptr(BufferRole::Staging),
    Field::Ptr(BufferRole::Output),
    Field::Rank,
    Field::NRanksPerNode,
    Field::NRanks,
    Field::Pad(4),
    Field::NElems,
]);

pub(super) const SPACE: TuneSpace = TuneSpace {
    nblocks: &[21, 42, 84],
    block_size: &[256, 512, 1024],
    knobs: &[Knob::None],
};

pub(super) const DEFAULT: TuningConfig = TuningConfig {
    nblocks: 21,
    block_size: 512,
    knob: Knob::None,
};

/// Staging length for an input of `len` elements on nodes of `nranks_per_node`.
///
/// The division truncates.
#[inline]
pub const fn staging_len(len: usize, nranks_per_node: usize) -> usize {
    len * SCRATCH_FACTOR / nranks_per_node
}

pub struct Hierarchical<G: RankGroup>(Inner<G>);

impl<G: RankGroup> Hierarchical<G> {
    /// [`Args::output`] is required and must not alias the input.
    pub fn new(group: &G, args: Args<G>) -> Result<Self, CommError> {
        let mut builder = Inner::builder(group, args, Algorithm::Hierarchical)?;
        let len = builder.input().len;
        let npn = builder.topology().nranks_per_node();
        if (len * SCRATCH_FACTOR) % npn != 0 {
            warn!(
                "staging of {len} x {SCRATCH_FACTOR} elements truncated to {} over {npn} ranks per node",
                staging_len(len, npn)
            )
        }
        builder.alloc(BufferRole::Scratch, len * SCRATCH_FACTOR)?;
        builder.alloc(BufferRole::Staging, staging_len(len, npn))?;
        builder.channels(
            ChannelGroup::Sm,
            PeerSet::SameNode,
            BufferRole::Input,
            Some(BufferRole::Scratch),
        )?;
        builder.channels(
            ChannelGroup::Proxy,
            PeerSet::CrossNode,
            BufferRole::Staging,
            Some(BufferRole::Scratch),
        )?;
        builder.finish().map(Self)
    }
}

super::collective!(Hierarchical);

#[test]
fn test_staging_len() {
    assert_eq!(staging_len(1 << 20, 4), 2 << 20);
    assert_eq!(staging_len(1000, 8), 1000);
    // 5 * 8 / 3 = 13.33
    assert_eq!(staging_len(5, 3), 13);
    assert_eq!(staging_len(0, 3), 0);
}
