use tracing::debug;

use crate::error::Result;
use crate::layout::{Segment, VALUE_SIZE};
use crate::record::Value;
use crate::store::BlockStore;

/// Fixed array of value slots addressed by data index.
///
/// The file only grows to cover a slot when that slot is first written, so a
/// new map does not have to zero-fill its whole data segment.
#[derive(Debug, Clone, Copy)]
pub struct DataStore {
    segment: Segment,
    capacity: u32,
}

impl DataStore {
    pub fn new(segment: Segment, capacity: u32) -> Self {
        Self { segment, capacity }
    }

    fn slot_pos(&self, index: u32) -> u64 {
        assert!(
            index < self.capacity,
            "data index {index} out of range for capacity {}",
            self.capacity
        );
        self.segment.pos + index as u64 * VALUE_SIZE as u64
    }

    pub fn get(&self, store: &impl BlockStore, index: u32) -> Result<Value> {
        let mut value = Value::zeroed();
        store.read(self.slot_pos(index), value.as_bytes_mut())?;
        Ok(value)
    }

    pub fn set(&self, store: &mut impl BlockStore, index: u32, value: &Value) -> Result<()> {
        let pos = self.slot_pos(index);
        let end = pos + VALUE_SIZE as u64;
        let size = store.size()?;
        if end > size && end <= self.segment.end() {
            debug!(index, from = size, to = end, "growing data segment");
            store.resize(end)?;
        }
        store.write(pos, value.as_bytes())
    }
}
