//! Byte-exact packing of kernel parameters.
//!
//! A kernel dereferences its parameter blob as a C struct, so a [`Schema`] lists
//! the fields in declaration order with their device widths, and every offset
//! must be naturally aligned. Padding is never implied: a schema that needs it
//! spells it out with [`Field::Pad`].

use crate::{args_not_support, channel::ChannelKind, tune::Knob, CommError, PeerSet, Topology};
use std::{
    borrow::Cow,
    collections::HashMap,
    mem::{align_of, size_of},
};

/// Channel groups a strategy may hand to its kernel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ChannelGroup {
    Sm,
    Proxy,
    Round1,
    Round2,
    ReduceScatter,
    AllGather,
}

impl ChannelGroup {
    pub const fn kind(self) -> ChannelKind {
        match self {
            Self::Sm => ChannelKind::Sm,
            Self::Proxy | Self::Round1 | Self::Round2 | Self::ReduceScatter | Self::AllGather => {
                ChannelKind::Proxy
            }
        }
    }
}

/// Device handle width of each channel kind.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HandleWidths {
    pub sm: usize,
    pub proxy: usize,
}

impl HandleWidths {
    #[inline]
    pub const fn uniform(width: usize) -> Self {
        Self {
            sm: width,
            proxy: width,
        }
    }

    #[inline]
    pub const fn of(&self, kind: ChannelKind) -> usize {
        match kind {
            ChannelKind::Sm => self.sm,
            ChannelKind::Proxy => self.proxy,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BufferRole {
    Input,
    Scratch,
    Staging,
    Output,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Field {
    /// Concatenated device handles of one channel group.
    Handles(ChannelGroup, PeerSet),
    /// Device address of a buffer.
    Ptr(BufferRole),
    Rank,
    NRanks,
    NRanksPerNode,
    /// Explicit padding bytes, always zero.
    Pad(usize),
    /// Element count, `size_t` on the device.
    NElems,
    ReadOnly,
    PipelineDepth,
}

const PTR: usize = size_of::<*const u8>();
const INT: usize = size_of::<i32>();
const SIZE: usize = size_of::<u64>();

impl Field {
    pub fn size(self, topo: &Topology, widths: HandleWidths) -> usize {
        match self {
            Self::Handles(group, peers) => peers.count(topo) * widths.of(group.kind()),
            Self::Ptr(_) => PTR,
            Self::Rank | Self::NRanks | Self::NRanksPerNode => INT,
            Self::ReadOnly | Self::PipelineDepth => INT,
            Self::Pad(n) => n,
            Self::NElems => SIZE,
        }
    }

    pub const fn align(self) -> usize {
        match self {
            Self::Handles(..) => align_of::<u64>(),
            Self::Ptr(_) => align_of::<*const u8>(),
            Self::Rank | Self::NRanks | Self::NRanksPerNode => align_of::<i32>(),
            Self::ReadOnly | Self::PipelineDepth => align_of::<i32>(),
            Self::Pad(_) => 1,
            Self::NElems => align_of::<u64>(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Slot {
    pub field: Field,
    pub offset: usize,
    pub size: usize,
}

/// Ordered field list of one kernel's parameter struct.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Schema(&'static [Field]);

impl Schema {
    #[inline]
    pub const fn new(fields: &'static [Field]) -> Self {
        Self(fields)
    }

    #[inline]
    pub const fn fields(&self) -> &'static [Field] {
        self.0
    }

    /// Offsets of every field.
    ///
    /// # Panics
    ///
    /// If a field would land off its natural alignment. Such a schema does not
    /// describe any struct the kernel can declare.
    pub fn layout(&self, topo: &Topology, widths: HandleWidths) -> Vec<Slot> {
        let mut offset = 0;
        self.0
            .iter()
            .map(|&field| {
                assert!(
                    offset % field.align() == 0,
                    "{field:?} at offset {offset} breaks {}-byte alignment",
                    field.align()
                );
                let size = field.size(topo, widths);
                let slot = Slot {
                    field,
                    offset,
                    size,
                };
                offset += size;
                slot
            })
            .collect()
    }

    pub fn size(&self, topo: &Topology, widths: HandleWidths) -> usize {
        self.layout(topo, widths)
            .last()
            .map_or(0, |s| s.offset + s.size)
    }
}

/// Everything a schema may ask for.
pub struct Values<'a> {
    pub topo: Topology,
    pub rank: usize,
    pub handles: &'a HashMap<ChannelGroup, Box<[u8]>>,
    pub buffers: &'a HashMap<BufferRole, usize>,
    pub nelems: usize,
    pub knob: Knob,
}

/// The packed parameters of one kernel launch.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct ParamBlob {
    bytes: Vec<u8>,
    nelems_at: Option<usize>,
}

impl ParamBlob {
    pub fn pack(schema: Schema, widths: HandleWidths, values: &Values) -> Result<Self, CommError> {
        let Values {
            topo,
            rank,
            handles,
            buffers,
            nelems,
            knob,
        } = values;

        let layout = schema.layout(topo, widths);
        let mut bytes = Vec::with_capacity(layout.last().map_or(0, |s| s.offset + s.size));
        let mut nelems_at = None;
        for Slot { field, offset, size } in layout {
            debug_assert_eq!(bytes.len(), offset);
            match field {
                Field::Handles(group, _) => {
                    let Some(array) = handles.get(&group) else {
                        return Err(args_not_support(format!("no {group:?} handles to pack")));
                    };
                    if array.len() != size {
                        return Err(args_not_support(format!(
                            "{group:?} handles are {} bytes, {size} expected",
                            array.len()
                        )));
                    }
                    bytes.extend_from_slice(array)
                }
                Field::Ptr(role) => {
                    let Some(&addr) = buffers.get(&role) else {
                        return Err(args_not_support(format!("no {role:?} buffer to pack")));
                    };
                    bytes.extend_from_slice(&addr.to_ne_bytes())
                }
                Field::Rank => bytes.extend_from_slice(&int(*rank)?),
                Field::NRanks => bytes.extend_from_slice(&int(topo.nranks())?),
                Field::NRanksPerNode => bytes.extend_from_slice(&int(topo.nranks_per_node())?),
                Field::Pad(n) => bytes.resize(bytes.len() + n, 0),
                Field::NElems => {
                    nelems_at = Some(offset);
                    bytes.extend_from_slice(&(*nelems as u64).to_ne_bytes())
                }
                Field::ReadOnly => match knob {
                    &Knob::ReadOnly(read_only) => {
                        bytes.extend_from_slice(&(read_only as i32).to_ne_bytes())
                    }
                    _ => return Err(args_not_support(format!("{knob:?} is not a read-only flag"))),
                },
                Field::PipelineDepth => match knob {
                    &Knob::PipelineDepth(depth) => bytes.extend_from_slice(&int(depth as _)?),
                    _ => return Err(args_not_support(format!("{knob:?} is not a pipeline depth"))),
                },
            }
        }
        Ok(Self { bytes, nelems_at })
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The blob with its element count replaced, leaving every other byte untouched.
    pub fn with_nelems(&self, nelems: usize) -> Cow<[u8]> {
        match self.nelems_at {
            Some(at) if read_u64(&self.bytes, at) != nelems as u64 => {
                let mut bytes = self.bytes.clone();
                bytes[at..][..SIZE].copy_from_slice(&(nelems as u64).to_ne_bytes());
                Cow::Owned(bytes)
            }
            _ => Cow::Borrowed(&self.bytes),
        }
    }
}

#[inline]
fn int(val: usize) -> Result<[u8; INT], CommError> {
    i32::try_from(val)
        .map(i32::to_ne_bytes)
        .map_err(|_| args_not_support(format!("{val} overflows a 32-bit field")))
}

#[inline]
fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0; SIZE];
    buf.copy_from_slice(&bytes[at..][..SIZE]);
    u64::from_ne_bytes(buf)
}

/// Field-addressed read access to a packed blob, the way a kernel sees it.
pub struct ParamView<'a> {
    bytes: &'a [u8],
    layout: Vec<Slot>,
}

impl<'a> ParamView<'a> {
    pub fn new(
        bytes: &'a [u8],
        schema: Schema,
        topo: &Topology,
        widths: HandleWidths,
    ) -> Result<Self, CommError> {
        let layout = schema.layout(topo, widths);
        let expected = layout.last().map_or(0, |s| s.offset + s.size);
        if bytes.len() != expected {
            return Err(args_not_support(format!(
                "blob is {} bytes, schema describes {expected}",
                bytes.len()
            )));
        }
        Ok(Self { bytes, layout })
    }

    fn slot(&self, field: Field) -> Option<&Slot> {
        self.layout.iter().find(|s| s.field == field)
    }

    fn get(&self, field: Field) -> Option<&'a [u8]> {
        self.slot(field)
            .map(|s| &self.bytes[s.offset..][..s.size])
    }

    pub fn handles(&self, group: ChannelGroup) -> Option<&'a [u8]> {
        self.layout
            .iter()
            .find(|s| matches!(s.field, Field::Handles(g, _) if g == group))
            .map(|s| &self.bytes[s.offset..][..s.size])
    }

    pub fn pointer(&self, role: BufferRole) -> Option<usize> {
        self.get(Field::Ptr(role)).map(|b| {
            let mut buf = [0; PTR];
            buf.copy_from_slice(b);
            usize::from_ne_bytes(buf)
        })
    }

    pub fn int(&self, field: Field) -> Option<i32> {
        self.get(field).filter(|b| b.len() == INT).map(|b| {
            let mut buf = [0; INT];
            buf.copy_from_slice(b);
            i32::from_ne_bytes(buf)
        })
    }

    pub fn nelems(&self) -> Option<u64> {
        self.slot(Field::NElems)
            .map(|s| read_u64(self.bytes, s.offset))
    }
}
