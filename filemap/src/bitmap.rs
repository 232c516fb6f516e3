use tracing::trace;

use crate::error::Result;
use crate::layout::Segment;
use crate::store::BlockStore;

/// Bytes read per step while scanning for a free bit.
const SCAN_CHUNK: usize = 64;

/// An occupancy bitmap stored in a region of the block store.
///
/// Bit `i` lives in byte `i / 8`, most significant bit first. Nothing is
/// cached: every call reads from (and writes to) the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitmap {
    region: Segment,
    /// Logical number of bits; trailing pad bits of the last byte are never handed out
    bits: u32,
}

fn mask(index: u32) -> u8 {
    0x80 >> (index % 8)
}

impl Bitmap {
    pub fn new(region: Segment, bits: u32) -> Self {
        assert!(region.size * 8 >= bits as u64, "bitmap region too small");
        Self { region, bits }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn region(&self) -> Segment {
        self.region
    }

    fn byte_pos(&self, index: u32) -> u64 {
        assert!(
            (index as u64) < self.region.size * 8,
            "bit index {index} out of range for {} bytes",
            self.region.size
        );
        self.region.pos + (index / 8) as u64
    }

    /// Returns the lowest clear bit below the logical bit count, if any.
    pub fn scan_first_free(&self, store: &impl BlockStore) -> Result<Option<u32>> {
        let mut buf = [0u8; SCAN_CHUNK];
        let mut scanned = 0u64;
        while scanned < self.region.size {
            let len = (self.region.size - scanned).min(SCAN_CHUNK as u64) as usize;
            let chunk = &mut buf[..len];
            store.read(self.region.pos + scanned, chunk)?;

            if let Some((i, byte)) = chunk.iter().enumerate().find(|(_, b)| **b != 0xFF) {
                let index = (scanned + i as u64) as u32 * 8 + byte.leading_ones();
                trace!(index, limit = self.bits, "first clear bit");
                return Ok((index < self.bits).then_some(index));
            }
            scanned += len as u64;
        }
        Ok(None)
    }

    pub fn get_bit(&self, store: &impl BlockStore, index: u32) -> Result<bool> {
        let mut byte = [0u8];
        store.read(self.byte_pos(index), &mut byte)?;
        Ok(byte[0] & mask(index) != 0)
    }

    /// Sets or clears bit `index`.
    ///
    /// # Panics
    ///
    /// If `index` is outside the bitmap region.
    pub fn set_bit(&self, store: &mut impl BlockStore, index: u32, value: bool) -> Result<()> {
        let pos = self.byte_pos(index);
        let mut byte = [0u8];
        store.read(pos, &mut byte)?;
        if value {
            byte[0] |= mask(index);
        } else {
            byte[0] &= !mask(index);
        }
        store.write(pos, &byte)
    }

    /// Number of set bits below the logical bit count
    pub fn count_ones(&self, store: &impl BlockStore) -> Result<u32> {
        let mut bytes = vec![0u8; self.region.size as usize];
        store.read(self.region.pos, &mut bytes)?;
        let full = (self.bits / 8) as usize;
        let mut count: u32 = bytes[..full].iter().map(|b| b.count_ones()).sum();
        let rem = self.bits % 8;
        if rem != 0 {
            let keep = !(0xFFu8 >> rem);
            count += (bytes[full] & keep).count_ones();
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VecStore;
    use proptest::prelude::*;

    fn bitmap_in(store: &mut VecStore, pos: u64, bits: u32) -> Bitmap {
        let size = bits.div_ceil(8) as u64;
        store.resize(pos + size + 4).unwrap();
        Bitmap::new(Segment { pos, size }, bits)
    }

    #[test]
    fn test_msb_first_layout() {
        let mut store = VecStore::new();
        let bm = bitmap_in(&mut store, 2, 16);

        bm.set_bit(&mut store, 0, true).unwrap();
        bm.set_bit(&mut store, 9, true).unwrap();
        assert_eq!(&store.as_slice()[2..4], &[0b1000_0000, 0b0100_0000]);

        bm.set_bit(&mut store, 0, false).unwrap();
        assert_eq!(&store.as_slice()[2..4], &[0, 0b0100_0000]);
        assert!(bm.get_bit(&store, 9).unwrap());
        assert!(!bm.get_bit(&store, 8).unwrap());
    }

    #[test]
    fn test_scan_skips_full_bytes() {
        let mut store = VecStore::new();
        let bm = bitmap_in(&mut store, 0, 20);
        for i in 0..11 {
            bm.set_bit(&mut store, i, true).unwrap();
        }
        assert_eq!(bm.scan_first_free(&store).unwrap(), Some(11));

        bm.set_bit(&mut store, 3, false).unwrap();
        assert_eq!(bm.scan_first_free(&store).unwrap(), Some(3));
    }

    #[test]
    fn test_scan_ignores_pad_bits() {
        let mut store = VecStore::new();
        let bm = bitmap_in(&mut store, 0, 10);
        for i in 0..10 {
            bm.set_bit(&mut store, i, true).unwrap();
        }
        // bits 10..16 exist in the last byte but are beyond the capacity
        assert_eq!(bm.scan_first_free(&store).unwrap(), None);
        assert_eq!(bm.count_ones(&store).unwrap(), 10);
    }

    #[test]
    fn test_scan_across_chunks() {
        let mut store = VecStore::new();
        let bits = (SCAN_CHUNK as u32 * 8) * 3 + 5;
        let bm = bitmap_in(&mut store, 7, bits);
        let target = SCAN_CHUNK as u32 * 8 * 2 + 17;
        let size = bm.region().size as usize;
        store.write(7, &vec![0xFF; size]).unwrap();
        bm.set_bit(&mut store, target, false).unwrap();
        assert_eq!(bm.scan_first_free(&store).unwrap(), Some(target));
    }

    #[test]
    #[should_panic]
    fn test_set_bit_out_of_range_panics() {
        let mut store = VecStore::new();
        let bm = bitmap_in(&mut store, 0, 8);
        let _ = bm.set_bit(&mut store, 8, true);
    }

    proptest! {
        #[test]
        fn prop_scan_finds_lowest_clear(bits in 1u32..300, set in proptest::collection::vec(any::<bool>(), 300)) {
            let mut store = VecStore::new();
            let bm = bitmap_in(&mut store, 3, bits);
            for i in 0..bits {
                bm.set_bit(&mut store, i, set[i as usize]).unwrap();
            }
            let expected = (0..bits).find(|&i| !set[i as usize]);
            prop_assert_eq!(bm.scan_first_free(&store).unwrap(), expected);
            let ones = (0..bits).filter(|&i| set[i as usize]).count() as u32;
            prop_assert_eq!(bm.count_ones(&store).unwrap(), ones);
        }
    }
}
