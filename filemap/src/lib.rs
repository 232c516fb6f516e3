//! A fixed-capacity key-value store kept in one memory-mapped file.
//!
//! Keys are short strings, values are fixed-size byte blocks. The file holds
//! a definition header, an index (two occupancy bitmaps, a primary hash table
//! and an overflow node pool) and the data slots.

pub mod bitmap;
pub mod config;
pub mod data;
pub mod error;
pub mod file_map;
pub mod hash;
pub mod index;
pub mod layout;
pub mod record;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use file_map::FileMap;
pub use hash::{Bkdr, FxKeyHash, KeyHash};
pub use layout::{KEY_SIZE, SegmentMap, VALUE_SIZE};
pub use record::{Key, Value};
pub use store::{BlockStore, MMapFile, VecStore};
