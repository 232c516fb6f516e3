//! Two-level hash index.
//!
//! The primary table holds one [`DataMap`] per bucket. Keys that collide on a
//! bucket are chained through the overflow region, where every link is the
//! integer position of the next node. A position read from the file is only
//! followed after it is checked against the chain bitmap.
//!
//! Writes are ordered so that a bitmap bit is set before anything that
//! references its slot becomes reachable, and cleared only after the
//! reference is gone. An interrupted update can leak a slot but never leaves
//! a reachable slot unmarked.

use tracing::{debug, warn};

use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use crate::hash::KeyHash;
use crate::layout::{RECORD_SIZE, Segment, SegmentMap, primary_slots};
use crate::record::{DataMap, Key};
use crate::store::BlockStore;

/// Position of a record in the index segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Primary(u32),
    Overflow(u32),
}

/// Where a key was found, or where it would go.
#[derive(Debug, Clone, Copy)]
pub enum Probe {
    /// The key's bucket is unused
    Vacant { bucket: u32 },
    Found {
        prev: Option<(Slot, DataMap)>,
        slot: Slot,
        record: DataMap,
    },
    /// The bucket is used but the key is not in its chain
    Missing { tail: Slot, tail_record: DataMap },
}

/// A validated insert, computed before anything is written.
#[derive(Debug, Clone, Copy)]
pub enum InsertPlan {
    Primary { bucket: u32 },
    Replace { slot: Slot, existing: DataMap },
    Append {
        tail: Slot,
        tail_record: DataMap,
        node: u32,
    },
}

#[derive(Debug)]
pub struct HashIndex<H> {
    hasher: H,
    capacity: u32,
    primary_slots: u32,
    primary: Segment,
    overflow: Segment,
    data_bitmap: Bitmap,
    chain_bitmap: Bitmap,
}

impl<H: KeyHash> HashIndex<H> {
    pub fn new(map: &SegmentMap, hasher: H) -> Self {
        let capacity = map.capacity;
        Self {
            hasher,
            capacity,
            primary_slots: primary_slots(capacity),
            primary: map.index.primary,
            overflow: map.index.overflow,
            data_bitmap: Bitmap::new(map.index.data_bitmap, capacity),
            chain_bitmap: Bitmap::new(map.index.chain_bitmap, capacity),
        }
    }

    pub fn data_bitmap(&self) -> &Bitmap {
        &self.data_bitmap
    }

    pub fn chain_bitmap(&self) -> &Bitmap {
        &self.chain_bitmap
    }

    pub fn primary_slots(&self) -> u32 {
        self.primary_slots
    }

    pub fn bucket_of(&self, key: &[u8]) -> u32 {
        self.hasher.hash_key(key) % self.primary_slots
    }

    fn slot_pos(&self, slot: Slot) -> u64 {
        match slot {
            Slot::Primary(i) => {
                assert!(i < self.primary_slots, "primary slot {i} out of range");
                self.primary.pos + i as u64 * RECORD_SIZE
            }
            Slot::Overflow(i) => {
                assert!(i < self.capacity, "overflow node {i} out of range");
                self.overflow.pos + i as u64 * RECORD_SIZE
            }
        }
    }

    /// Reads a record without any validation.
    pub fn read_slot(&self, store: &impl BlockStore, slot: Slot) -> Result<DataMap> {
        store.read_pod(self.slot_pos(slot))
    }

    fn write_slot(&self, store: &mut impl BlockStore, slot: Slot, record: &DataMap) -> Result<()> {
        store.write_pod(self.slot_pos(slot), record)
    }

    /// Follows a next-index read from the file.
    fn read_node(&self, store: &impl BlockStore, node: u32) -> Result<DataMap> {
        if node >= self.capacity {
            warn!(node, capacity = self.capacity, "chain link out of range");
            return Err(Error::Corrupted(format!(
                "overflow node {node} beyond capacity {}",
                self.capacity
            )));
        }
        if !self.chain_bitmap.get_bit(store, node)? {
            warn!(node, "chain link to unmarked node");
            return Err(Error::Corrupted(format!("overflow node {node} is not marked live")));
        }
        let record = self.read_slot(store, Slot::Overflow(node))?;
        if !record.is_used() {
            warn!(node, "chain link to unused node");
            return Err(Error::Corrupted(format!("overflow node {node} is not in use")));
        }
        Ok(record)
    }

    /// Checks that a record's data index names a live data slot.
    fn check_data(&self, store: &impl BlockStore, record: &DataMap) -> Result<()> {
        let raw = record.raw_data_index();
        if raw < 0 || raw as u32 >= self.capacity {
            warn!(data_index = raw, capacity = self.capacity, "data index out of range");
            return Err(Error::Corrupted(format!(
                "data index {raw} beyond capacity {}",
                self.capacity
            )));
        }
        if !self.data_bitmap.get_bit(store, raw as u32)? {
            warn!(data_index = raw, "record points at unmarked data slot");
            return Err(Error::Corrupted(format!("data slot {raw} is not marked live")));
        }
        Ok(())
    }

    /// Walks the key's bucket and chain.
    ///
    /// A matching record is only returned once its data index is checked.
    pub fn locate(&self, store: &impl BlockStore, key: &Key) -> Result<Probe> {
        let bucket = self.bucket_of(key.as_bytes());
        let head = self.read_slot(store, Slot::Primary(bucket))?;
        if !head.is_used() {
            return Ok(Probe::Vacant { bucket });
        }
        if head.key.as_bytes() == key.as_bytes() {
            self.check_data(store, &head)?;
            return Ok(Probe::Found {
                prev: None,
                slot: Slot::Primary(bucket),
                record: head,
            });
        }

        let mut prev = (Slot::Primary(bucket), head);
        // a chain can never be longer than the overflow region
        for _ in 0..=self.capacity {
            let Some(next) = prev.1.next() else {
                return Ok(Probe::Missing {
                    tail: prev.0,
                    tail_record: prev.1,
                });
            };
            let node = self.read_node(store, next)?;
            if node.key.as_bytes() == key.as_bytes() {
                self.check_data(store, &node)?;
                return Ok(Probe::Found {
                    prev: Some(prev),
                    slot: Slot::Overflow(next),
                    record: node,
                });
            }
            prev = (Slot::Overflow(next), node);
        }

        warn!(bucket, "chain does not terminate");
        Err(Error::Corrupted(format!("chain of bucket {bucket} is cyclic")))
    }

    pub fn find(&self, store: &impl BlockStore, key: &Key) -> Result<Option<DataMap>> {
        match self.locate(store, key)? {
            Probe::Found { record, .. } => Ok(Some(record)),
            Probe::Vacant { .. } | Probe::Missing { .. } => Ok(None),
        }
    }

    /// Decides where `key` goes, reserving nothing.
    ///
    /// Fails with [`Error::CapacityExceeded`] if a new overflow node is needed
    /// and none is free.
    pub fn plan_insert(&self, store: &impl BlockStore, key: &Key) -> Result<InsertPlan> {
        match self.locate(store, key)? {
            Probe::Vacant { bucket } => Ok(InsertPlan::Primary { bucket }),
            Probe::Found { slot, record, .. } => Ok(InsertPlan::Replace {
                slot,
                existing: record,
            }),
            Probe::Missing { tail, tail_record } => {
                let node = self
                    .chain_bitmap
                    .scan_first_free(store)?
                    .ok_or(Error::CapacityExceeded)?;
                Ok(InsertPlan::Append {
                    tail,
                    tail_record,
                    node,
                })
            }
        }
    }

    /// Writes `record` according to a plan from [`HashIndex::plan_insert`].
    ///
    /// Returns the record that was replaced, if any.
    pub fn apply_insert(
        &self,
        store: &mut impl BlockStore,
        plan: InsertPlan,
        record: DataMap,
    ) -> Result<Option<DataMap>> {
        let mut record = record;
        record.set_used(true);
        match plan {
            InsertPlan::Primary { bucket } => {
                record.set_next(None);
                self.write_slot(store, Slot::Primary(bucket), &record)?;
                Ok(None)
            }
            InsertPlan::Replace { slot, existing } => {
                record.set_next(existing.next());
                self.write_slot(store, slot, &record)?;
                Ok(Some(existing))
            }
            InsertPlan::Append {
                tail,
                mut tail_record,
                node,
            } => {
                debug!(node, ?tail, "appending overflow node");
                self.chain_bitmap.set_bit(store, node, true)?;
                record.set_next(None);
                self.write_slot(store, Slot::Overflow(node), &record)?;
                tail_record.set_next(Some(node));
                self.write_slot(store, tail, &tail_record)?;
                Ok(None)
            }
        }
    }

    /// Inserts `record`, or replaces the record with the same key in place.
    ///
    /// Only the index is touched; releasing the data slot of a replaced record
    /// is up to the caller.
    pub fn add_or_replace(
        &self,
        store: &mut impl BlockStore,
        record: DataMap,
    ) -> Result<Option<DataMap>> {
        let plan = self.plan_insert(store, &record.key)?;
        self.apply_insert(store, plan, record)
    }

    /// Unlinks `key` and frees its data slot and overflow node.
    ///
    /// Returns the removed record, or `None` if the key is not present.
    pub fn remove(&self, store: &mut impl BlockStore, key: &Key) -> Result<Option<DataMap>> {
        let (prev, slot, record) = match self.locate(store, key)? {
            Probe::Found { prev, slot, record } => (prev, slot, record),
            Probe::Vacant { .. } | Probe::Missing { .. } => return Ok(None),
        };

        match (prev, slot) {
            (None, Slot::Primary(bucket)) => match record.next() {
                None => {
                    let mut cleared = record;
                    cleared.set_used(false);
                    self.write_slot(store, slot, &cleared)?;
                    self.data_bitmap.set_bit(store, record.data_index(), false)?;
                }
                Some(first) => {
                    // promote the first overflow node into the bucket
                    let promoted = self.read_node(store, first)?;
                    debug!(bucket, node = first, "promoting overflow node");
                    self.write_slot(store, slot, &promoted)?;
                    self.data_bitmap.set_bit(store, record.data_index(), false)?;
                    self.chain_bitmap.set_bit(store, first, false)?;
                }
            },
            (Some((prev_slot, mut prev_record)), Slot::Overflow(node)) => {
                prev_record.set_next(record.next());
                self.write_slot(store, prev_slot, &prev_record)?;
                self.data_bitmap.set_bit(store, record.data_index(), false)?;
                self.chain_bitmap.set_bit(store, node, false)?;
            }
            (prev, slot) => unreachable!("probe returned {slot:?} with predecessor {prev:?}"),
        }

        Ok(Some(record))
    }

    /// Every live record, bucket by bucket, each chain in link order.
    pub fn records(&self, store: &impl BlockStore) -> Result<Vec<DataMap>> {
        let mut out = Vec::new();
        for bucket in 0..self.primary_slots {
            let head = self.read_slot(store, Slot::Primary(bucket))?;
            if !head.is_used() {
                continue;
            }
            let mut next = head.next();
            out.push(head);
            let mut hops = 0;
            while let Some(n) = next {
                hops += 1;
                if hops > self.capacity {
                    return Err(Error::Corrupted(format!("chain of bucket {bucket} is cyclic")));
                }
                let node = self.read_node(store, n)?;
                next = node.next();
                out.push(node);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Bkdr;
    use crate::store::VecStore;

    /// Sends every key to bucket 0.
    #[derive(Default)]
    struct Collide;

    impl KeyHash for Collide {
        fn hash_key(&self, _key: &[u8]) -> u32 {
            0
        }
    }

    fn setup<H: KeyHash>(capacity: u32, hasher: H) -> (VecStore, HashIndex<H>) {
        let map = SegmentMap::for_capacity(capacity);
        let mut store = VecStore::new();
        store.resize(map.initial_size()).unwrap();
        (store, HashIndex::new(&map, hasher))
    }

    fn key(s: &str) -> Key {
        Key::new(s).unwrap()
    }

    fn insert<H: KeyHash>(store: &mut VecStore, index: &HashIndex<H>, k: &str, data: u32) {
        index.data_bitmap().set_bit(store, data, true).unwrap();
        index
            .add_or_replace(store, DataMap::occupied(key(k), data))
            .unwrap();
    }

    #[test]
    fn test_find_in_empty_index() {
        let (store, index) = setup(10, Bkdr);
        assert_eq!(index.find(&store, &key("nope")).unwrap(), None);
    }

    #[test]
    fn test_insert_into_primary() {
        let (mut store, index) = setup(10, Bkdr);
        insert(&mut store, &index, "a", 0);

        let found = index.find(&store, &key("a")).unwrap().unwrap();
        assert_eq!(found.data_index(), 0);
        assert_eq!(found.next(), None);
        let bucket = index.bucket_of(b"a");
        assert_eq!(index.read_slot(&store, Slot::Primary(bucket)).unwrap(), found);
        assert_eq!(index.chain_bitmap().count_ones(&store).unwrap(), 0);
    }

    #[test]
    fn test_collisions_chain_in_order() {
        let (mut store, index) = setup(10, Collide);
        insert(&mut store, &index, "a", 0);
        insert(&mut store, &index, "b", 1);
        insert(&mut store, &index, "c", 2);

        let head = index.read_slot(&store, Slot::Primary(0)).unwrap();
        assert_eq!(head.key, key("a"));
        assert_eq!(head.next(), Some(0));
        let n0 = index.read_slot(&store, Slot::Overflow(0)).unwrap();
        assert_eq!(n0.key, key("b"));
        assert_eq!(n0.next(), Some(1));
        let n1 = index.read_slot(&store, Slot::Overflow(1)).unwrap();
        assert_eq!(n1.key, key("c"));
        assert_eq!(n1.next(), None);

        for (k, d) in [("a", 0), ("b", 1), ("c", 2)] {
            assert_eq!(index.find(&store, &key(k)).unwrap().unwrap().data_index(), d);
        }
        assert_eq!(index.chain_bitmap().count_ones(&store).unwrap(), 2);
    }

    #[test]
    fn test_replace_keeps_link() {
        let (mut store, index) = setup(10, Collide);
        insert(&mut store, &index, "a", 0);
        insert(&mut store, &index, "b", 1);
        for data in [7, 8] {
            index.data_bitmap().set_bit(&mut store, data, true).unwrap();
        }

        let old = index
            .add_or_replace(&mut store, DataMap::occupied(key("a"), 7))
            .unwrap()
            .unwrap();
        assert_eq!(old.data_index(), 0);
        let head = index.read_slot(&store, Slot::Primary(0)).unwrap();
        assert_eq!(head.data_index(), 7);
        assert_eq!(head.next(), Some(0));

        let old = index
            .add_or_replace(&mut store, DataMap::occupied(key("b"), 8))
            .unwrap()
            .unwrap();
        assert_eq!(old.data_index(), 1);
        assert_eq!(index.find(&store, &key("b")).unwrap().unwrap().data_index(), 8);
    }

    #[test]
    fn test_remove_primary_without_chain() {
        let (mut store, index) = setup(10, Bkdr);
        insert(&mut store, &index, "a", 4);
        let removed = index.remove(&mut store, &key("a")).unwrap().unwrap();
        assert_eq!(removed.data_index(), 4);
        assert_eq!(index.find(&store, &key("a")).unwrap(), None);
        assert!(!index.data_bitmap().get_bit(&store, 4).unwrap());
        assert_eq!(index.remove(&mut store, &key("a")).unwrap(), None);
    }

    #[test]
    fn test_remove_primary_promotes_first_node() {
        let (mut store, index) = setup(10, Collide);
        insert(&mut store, &index, "a", 0);
        insert(&mut store, &index, "b", 1);
        insert(&mut store, &index, "c", 2);

        index.remove(&mut store, &key("a")).unwrap().unwrap();

        let head = index.read_slot(&store, Slot::Primary(0)).unwrap();
        assert_eq!(head.key, key("b"));
        assert_eq!(head.data_index(), 1);
        assert_eq!(head.next(), Some(1));
        assert!(!index.chain_bitmap().get_bit(&store, 0).unwrap());
        assert!(!index.data_bitmap().get_bit(&store, 0).unwrap());
        assert!(index.data_bitmap().get_bit(&store, 1).unwrap());

        assert_eq!(index.find(&store, &key("a")).unwrap(), None);
        assert_eq!(index.find(&store, &key("b")).unwrap().unwrap().data_index(), 1);
        assert_eq!(index.find(&store, &key("c")).unwrap().unwrap().data_index(), 2);
    }

    #[test]
    fn test_remove_middle_and_tail_nodes() {
        let (mut store, index) = setup(10, Collide);
        for (i, k) in ["a", "b", "c", "d"].iter().enumerate() {
            insert(&mut store, &index, k, i as u32);
        }

        index.remove(&mut store, &key("c")).unwrap().unwrap();
        let b = index.find(&store, &key("b")).unwrap().unwrap();
        assert_eq!(b.next(), Some(2));
        assert!(!index.chain_bitmap().get_bit(&store, 1).unwrap());

        index.remove(&mut store, &key("d")).unwrap().unwrap();
        let b = index.find(&store, &key("b")).unwrap().unwrap();
        assert_eq!(b.next(), None);

        index.remove(&mut store, &key("b")).unwrap().unwrap();
        let head = index.read_slot(&store, Slot::Primary(0)).unwrap();
        assert_eq!(head.key, key("a"));
        assert_eq!(head.next(), None);
        assert_eq!(index.chain_bitmap().count_ones(&store).unwrap(), 0);
        assert_eq!(index.data_bitmap().count_ones(&store).unwrap(), 1);
    }

    #[test]
    fn test_freed_node_is_reused() {
        let (mut store, index) = setup(10, Collide);
        insert(&mut store, &index, "a", 0);
        insert(&mut store, &index, "b", 1);
        insert(&mut store, &index, "c", 2);
        index.remove(&mut store, &key("b")).unwrap();

        insert(&mut store, &index, "d", 1);
        // node 0 was freed by "b" and is handed out again at the chain tail
        let c = index.find(&store, &key("c")).unwrap().unwrap();
        assert_eq!(c.next(), Some(0));
        let d = index.read_slot(&store, Slot::Overflow(0)).unwrap();
        assert_eq!(d.key, key("d"));
    }

    #[test]
    fn test_plan_fails_when_overflow_full() {
        let (mut store, index) = setup(2, Collide);
        insert(&mut store, &index, "a", 0);
        insert(&mut store, &index, "b", 1);
        // fill the remaining overflow node out of band
        index.chain_bitmap().set_bit(&mut store, 1, true).unwrap();

        let before = store.as_slice().to_vec();
        assert!(matches!(
            index.plan_insert(&store, &key("c")),
            Err(Error::CapacityExceeded)
        ));
        assert_eq!(store.as_slice(), &before[..]);
    }

    #[test]
    fn test_unmarked_link_is_corruption() {
        let (mut store, index) = setup(10, Collide);
        insert(&mut store, &index, "a", 0);
        insert(&mut store, &index, "b", 1);
        index.chain_bitmap().set_bit(&mut store, 0, false).unwrap();

        assert!(matches!(
            index.find(&store, &key("b")),
            Err(Error::Corrupted(_))
        ));
        // the head is still reachable without following the link
        assert!(index.find(&store, &key("a")).unwrap().is_some());
    }

    #[test]
    fn test_out_of_range_link_is_corruption() {
        let (mut store, index) = setup(4, Collide);
        insert(&mut store, &index, "a", 0);
        let mut head = index.read_slot(&store, Slot::Primary(0)).unwrap();
        head.set_next(Some(99));
        index.write_slot(&mut store, Slot::Primary(0), &head).unwrap();
        assert!(matches!(
            index.find(&store, &key("zz")),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn test_out_of_range_data_index_is_corruption() {
        let (mut store, index) = setup(4, Collide);
        insert(&mut store, &index, "a", 0);
        insert(&mut store, &index, "b", 1);

        let mut head = index.read_slot(&store, Slot::Primary(0)).unwrap();
        let link = head.next();
        head = DataMap::occupied(head.key, 99);
        head.set_next(link);
        index.write_slot(&mut store, Slot::Primary(0), &head).unwrap();

        let before = store.as_slice().to_vec();
        assert!(matches!(index.find(&store, &key("a")), Err(Error::Corrupted(_))));
        assert!(matches!(
            index.remove(&mut store, &key("a")),
            Err(Error::Corrupted(_))
        ));
        assert!(matches!(
            index.plan_insert(&store, &key("a")),
            Err(Error::Corrupted(_))
        ));
        assert_eq!(store.as_slice(), &before[..]);
        // the chain behind the bad head is still usable
        assert_eq!(index.find(&store, &key("b")).unwrap().unwrap().data_index(), 1);
    }

    #[test]
    fn test_unmarked_data_slot_is_corruption() {
        let (mut store, index) = setup(4, Collide);
        insert(&mut store, &index, "a", 0);
        insert(&mut store, &index, "b", 1);
        index.data_bitmap().set_bit(&mut store, 1, false).unwrap();

        assert!(matches!(index.find(&store, &key("b")), Err(Error::Corrupted(_))));
        assert!(matches!(
            index.remove(&mut store, &key("b")),
            Err(Error::Corrupted(_))
        ));
        assert!(index.chain_bitmap().get_bit(&store, 0).unwrap());
        assert!(index.find(&store, &key("a")).unwrap().is_some());
    }

    #[test]
    fn test_records_lists_chains() {
        let (mut store, index) = setup(10, Collide);
        insert(&mut store, &index, "a", 0);
        insert(&mut store, &index, "b", 1);
        insert(&mut store, &index, "c", 2);
        let keys: Vec<_> = index
            .records(&store)
            .unwrap()
            .iter()
            .map(|r| r.key.to_string_lossy())
            .collect();
        assert_eq!(keys, ["a", "b", "c"]);
    }
}
