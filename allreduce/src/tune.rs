use crate::{args_not_support, CollectiveOperation, CommError};
use log::debug;
use std::{iter::FusedIterator, time::Duration};

/// Strategy-specific launch knob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Knob {
    None,
    ReadOnly(bool),
    PipelineDepth(u32),
}

impl Knob {
    #[inline]
    fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TuningConfig {
    pub nblocks: u32,
    pub block_size: u32,
    pub knob: Knob,
}

/// Cartesian product of candidate values, enumerated with `nblocks` outermost
/// and the knob innermost.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TuneSpace {
    pub nblocks: &'static [u32],
    pub block_size: &'static [u32],
    pub knobs: &'static [Knob],
}

impl TuneSpace {
    #[inline]
    pub const fn len(&self) -> usize {
        self.nblocks.len() * self.block_size.len() * self.knobs.len()
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Option<TuningConfig> {
        if i >= self.len() {
            return None;
        }
        let nk = self.knobs.len();
        let nb = self.block_size.len();
        Some(TuningConfig {
            nblocks: self.nblocks[i / (nk * nb)],
            block_size: self.block_size[i / nk % nb],
            knob: self.knobs[i % nk],
        })
    }

    /// Whether `knob` is the kind of knob this space varies.
    pub fn accepts(&self, knob: &Knob) -> bool {
        self.knobs.first().is_some_and(|k| k.same_kind(knob))
    }

    #[inline]
    pub fn iter(&self) -> Candidates {
        Candidates {
            space: *self,
            next: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Candidates {
    space: TuneSpace,
    next: usize,
}

impl Iterator for Candidates {
    type Item = TuningConfig;

    fn next(&mut self) -> Option<Self::Item> {
        let ans = self.space.get(self.next)?;
        self.next += 1;
        Some(ans)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.space.len().saturating_sub(self.next);
        (rest, Some(rest))
    }
}

impl ExactSizeIterator for Candidates {}
impl FusedIterator for Candidates {}

/// Walks a strategy through its tune space.
///
/// Each yielded config is already applied, so the caller can execute and
/// time the strategy (through [`AutoTune::op`]) before advancing.
pub struct AutoTune<'a, Op> {
    op: &'a mut Op,
    space: TuneSpace,
    next: usize,
}

impl<'a, Op: CollectiveOperation> AutoTune<'a, Op> {
    pub fn new(op: &'a mut Op) -> Self {
        let space = op.tune_space();
        Self { op, space, next: 0 }
    }

    #[inline]
    pub fn op(&mut self) -> &mut Op {
        &mut *self.op
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.next
    }

    #[inline]
    pub fn restart(&mut self) {
        self.next = 0
    }

    /// Times every candidate with `measure` and leaves the strategy configured
    /// with the fastest one. Ties keep the earlier candidate.
    pub fn select_fastest<F>(mut self, mut measure: F) -> Result<(TuningConfig, Duration), CommError>
    where
        F: FnMut(&mut Op, TuningConfig) -> Result<Duration, CommError>,
    {
        let mut best: Option<(TuningConfig, Duration)> = None;
        while let Some(config) = self.next() {
            let config = config?;
            let time = measure(&mut *self.op, config)?;
            debug!("{config:?}: {time:?}");
            match best {
                Some((_, t)) if t <= time => {}
                _ => best = Some((config, time)),
            }
        }
        let Some((config, time)) = best else {
            return Err(args_not_support("empty tune space"));
        };
        self.op.configure(config)?;
        Ok((config, time))
    }
}

impl<Op: CollectiveOperation> Iterator for AutoTune<'_, Op> {
    type Item = Result<TuningConfig, CommError>;

    fn next(&mut self) -> Option<Self::Item> {
        let config = self.space.get(self.next)?;
        self.next += 1;
        Some(self.op.configure(config).map(|()| config))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.space.len().saturating_sub(self.next);
        (rest, Some(rest))
    }
}
