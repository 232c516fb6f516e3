//! Byte layout of a file map, derived from its capacity alone.
//!
//! ```text
//! [definition][data bitmap][chain bitmap][primary table][overflow region][data slots]
//! |<- 10KiB ->|<---------------------- index segment ---------------------->|<- N * 10KiB ->|
//! ```
//!
//! The layout itself is never written to the file, only the capacity is.
//! Changing any size here is a format break.

use std::mem::size_of;

use crate::record::{DataMap, Definition};

/// Version tag stored at the start of every file map.
pub const VERSION: &str = "FILEMAP V1.0";

/// Size of the definition segment. Only the first bytes are used.
pub const DEFINITION_SIZE: u64 = 10 * 1024;

pub const KEY_SIZE: usize = 64;

pub const VALUE_SIZE: usize = 10 * 1024;

/// Size of a primary slot or overflow node on disk.
pub const RECORD_SIZE: u64 = size_of::<DataMap>() as u64;

const _: () = assert!(size_of::<Definition>() as u64 <= DEFINITION_SIZE);

/// A contiguous byte range of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    pub pos: u64,
    pub size: u64,
}

impl Segment {
    fn at(pos: u64, size: u64) -> Self {
        Self { pos, size }
    }

    /// First byte past the segment
    pub fn end(&self) -> u64 {
        self.pos + self.size
    }
}

/// Regions making up the index segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMap {
    pub seg: Segment,
    pub data_bitmap: Segment,
    pub chain_bitmap: Segment,
    pub primary: Segment,
    pub overflow: Segment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentMap {
    pub capacity: u32,
    /// The whole file once every data slot has been written
    pub seg: Segment,
    pub definition: Segment,
    pub index: IndexMap,
    pub data: Segment,
}

/// Number of primary slots for a capacity, `ceil(1.25 * n)`.
pub fn primary_slots(capacity: u32) -> u32 {
    capacity + capacity.div_ceil(4)
}

/// Bytes needed for a bitmap of `bits` bits.
pub fn bitmap_bytes(bits: u32) -> u64 {
    bits.div_ceil(8) as u64
}

impl SegmentMap {
    pub fn for_capacity(capacity: u32) -> Self {
        let definition = Segment::at(0, DEFINITION_SIZE);

        let mut pos = definition.end();
        let data_bitmap = Segment::at(pos, bitmap_bytes(capacity));
        pos = data_bitmap.end();
        let chain_bitmap = Segment::at(pos, bitmap_bytes(capacity));
        pos = chain_bitmap.end();
        let primary = Segment::at(pos, primary_slots(capacity) as u64 * RECORD_SIZE);
        pos = primary.end();
        let overflow = Segment::at(pos, capacity as u64 * RECORD_SIZE);
        pos = overflow.end();

        let index = IndexMap {
            seg: Segment::at(data_bitmap.pos, pos - data_bitmap.pos),
            data_bitmap,
            chain_bitmap,
            primary,
            overflow,
        };

        let data = Segment::at(pos, capacity as u64 * VALUE_SIZE as u64);

        Self {
            capacity,
            seg: Segment::at(0, data.end()),
            definition,
            index,
            data,
        }
    }

    /// Size a freshly initialized file is truncated to; data slots grow lazily.
    pub fn initial_size(&self) -> u64 {
        self.index.seg.end()
    }
}
