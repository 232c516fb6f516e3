use std::io;
use thiserror::Error;

/// Errors that can occur when working with a file map
#[derive(Error, Debug)]
pub enum Error {
    /// IO errors when reading/writing the backing file
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A block-store access past the current end of the store
    #[error("range out of bounds: offset={offset} len={len} size={size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    /// No free data slot or overflow node is left for a new key
    #[error("Map capacity exceeded")]
    CapacityExceeded,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Value input longer than a data slot
    #[error("Invalid value: {0} bytes exceeds the slot size")]
    InvalidValue(usize),

    #[error("Invalid capacity: {0}")]
    InvalidCapacity(u32),

    /// The file does not hold a usable definition record
    #[error("Incompatible file: {0}")]
    Incompatible(String),

    /// The index references a slot that is not live
    #[error("Corrupted index: {0}")]
    Corrupted(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error is the "table full" outcome of an insert
    pub fn is_full(&self) -> bool {
        matches!(self, Error::CapacityExceeded)
    }
}
