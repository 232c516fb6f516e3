use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};
use crate::layout::{KEY_SIZE, VALUE_SIZE, VERSION};

/// Next-index value meaning "end of chain".
pub const INDEX_NULL: i32 = -1;

/// A key stored as a NUL-terminated string in a fixed 64-byte buffer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Zeroable, Pod)]
#[repr(transparent)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    /// Longest key content; the last byte is reserved for the terminator.
    pub const MAX_LEN: usize = KEY_SIZE - 1;

    /// Validates and stores `key`.
    ///
    /// Keys must be 1 to 63 bytes of printable ASCII (`0x20..=0x7E`). Empty
    /// keys are rejected, as are control bytes and anything above `0x7E`, so
    /// every stored byte hashes the same whether it is read signed or unsigned.
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self> {
        let bytes = key.as_ref();
        if bytes.is_empty() {
            return Err(Error::InvalidKey("key is empty".to_string()));
        }
        if bytes.len() > Self::MAX_LEN {
            return Err(Error::InvalidKey(format!(
                "{} bytes, at most {} allowed",
                bytes.len(),
                Self::MAX_LEN
            )));
        }
        if let Some(&b) = bytes.iter().find(|&&b| !(0x20..=0x7E).contains(&b)) {
            return Err(Error::InvalidKey(format!(
                "byte {b:#04x} is not printable ASCII"
            )));
        }
        let mut buf = [0u8; KEY_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(buf))
    }

    /// The key content up to the terminator
    pub fn as_bytes(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(Self::MAX_LEN);
        &self.0[..end]
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", self.to_string_lossy())
    }
}

impl TryFrom<&str> for Key {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Key::new(value)
    }
}

/// One fixed-size value block, always exactly [`Value::SIZE`] bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Value(Box<[u8]>);

impl Value {
    pub const SIZE: usize = VALUE_SIZE;

    /// A value of all zero bytes
    pub fn zeroed() -> Self {
        Self(vec![0u8; VALUE_SIZE].into_boxed_slice())
    }

    /// Builds a value from `bytes`, zero-padding up to the slot size.
    pub fn new(bytes: impl AsRef<[u8]>) -> Result<Self> {
        let bytes = bytes.as_ref();
        if bytes.len() > VALUE_SIZE {
            return Err(Error::InvalidValue(bytes.len()));
        }
        let mut value = Self::zeroed();
        value.0[..bytes.len()].copy_from_slice(bytes);
        Ok(value)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0[..]
    }

    /// Content with trailing zero padding removed
    pub fn trimmed(&self) -> &[u8] {
        let end = self.0.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        &self.0[..end]
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = &self.trimmed()[..self.trimmed().len().min(32)];
        write!(f, "Value({:?}..)", String::from_utf8_lossy(head))
    }
}

/// A primary slot or overflow node.
///
/// `next` is the position of the following overflow node, or [`INDEX_NULL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct DataMap {
    used: i32,
    pub key: Key,
    data_index: i32,
    next: i32,
}

impl DataMap {
    pub fn occupied(key: Key, data_index: u32) -> Self {
        Self {
            used: 1,
            key,
            data_index: data_index as i32,
            next: INDEX_NULL,
        }
    }

    pub fn is_used(&self) -> bool {
        self.used != 0
    }

    pub fn set_used(&mut self, used: bool) {
        self.used = used as i32;
    }

    pub fn data_index(&self) -> u32 {
        self.data_index as u32
    }

    /// Raw next-index as stored, for diagnostics.
    pub fn raw_next(&self) -> i32 {
        self.next
    }

    /// Raw data index as stored, for diagnostics.
    pub fn raw_data_index(&self) -> i32 {
        self.data_index
    }

    pub fn next(&self) -> Option<u32> {
        (self.next != INDEX_NULL).then_some(self.next as u32)
    }

    pub fn set_next(&mut self, next: Option<u32>) {
        self.next = next.map_or(INDEX_NULL, |n| n as i32);
    }
}

/// Header held in the definition segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct Definition {
    version: [u8; 16],
    capacity: i32,
}

impl Definition {
    pub fn new(capacity: u32) -> Self {
        let mut version = [0u8; 16];
        version[..VERSION.len()].copy_from_slice(VERSION.as_bytes());
        Self {
            version,
            capacity: capacity as i32,
        }
    }

    pub fn version(&self) -> String {
        let end = self.version.iter().position(|&b| b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.version[..end]).into_owned()
    }

    pub fn is_current_version(&self) -> bool {
        self.version() == VERSION
    }

    /// Stored capacity, `None` if it is not a usable positive value.
    pub fn capacity(&self) -> Option<u32> {
        (self.capacity > 0).then_some(self.capacity as u32)
    }
}
