use std::fs::{File, OpenOptions};
use std::path::Path;

use bytemuck::Pod;
use memmap2::MmapMut;

use crate::error::{Error, Result};

/// Byte-range access to the storage behind a file map.
///
/// Reads and writes never transfer partially: a range that ends past
/// [`BlockStore::size`] fails with [`Error::OutOfBounds`].
pub trait BlockStore {
    fn size(&self) -> Result<u64>;

    /// Sets the store length; bytes added at the end read as zero.
    fn resize(&mut self, len: u64) -> Result<()>;

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    fn sync(&mut self) -> Result<()>;

    fn read_pod<T: Pod>(&self, offset: u64) -> Result<T>
    where
        Self: Sized,
    {
        let mut value = T::zeroed();
        self.read(offset, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    fn write_pod<T: Pod>(&mut self, offset: u64, value: &T) -> Result<()>
    where
        Self: Sized,
    {
        self.write(offset, bytemuck::bytes_of(value))
    }
}

fn check_range(offset: u64, len: usize, size: u64) -> Result<std::ops::Range<usize>> {
    let len = len as u64;
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset as usize..end as usize),
        _ => Err(Error::OutOfBounds { offset, len, size }),
    }
}

/// In-memory store, used for tests and scratch maps.
#[derive(Debug, Default, Clone)]
pub struct VecStore {
    bytes: Vec<u8>,
}

impl VecStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for VecStore {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl BlockStore for VecStore {
    fn size(&self) -> Result<u64> {
        Ok(self.bytes.len() as u64)
    }

    fn resize(&mut self, len: u64) -> Result<()> {
        self.bytes.resize(len as usize, 0);
        Ok(())
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let range = check_range(offset, buf.len(), self.size()?)?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let range = check_range(offset, data.len(), self.size()?)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A file accessed through a writable memory map.
///
/// The map is rebuilt after every resize. An empty file has no map.
pub struct MMapFile {
    mmap: Option<MmapMut>,
    file: File,
}

impl MMapFile {
    /// Opens `path`, creating an empty file if it does not exist.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::from_file(file)
    }

    /// Opens an existing file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(file)
    }

    pub fn from_file(file: File) -> Result<Self> {
        let mmap = Self::map(&file)?;
        Ok(Self { mmap, file })
    }

    fn map(file: &File) -> Result<Option<MmapMut>> {
        if file.metadata()?.len() == 0 {
            return Ok(None);
        }
        // SAFETY: a file map is the single writer of its file.
        let mmap = unsafe { MmapMut::map_mut(file)? };
        Ok(Some(mmap))
    }

    fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

impl BlockStore for MMapFile {
    fn size(&self) -> Result<u64> {
        Ok(self.bytes().len() as u64)
    }

    fn resize(&mut self, len: u64) -> Result<()> {
        if let Some(mmap) = self.mmap.take() {
            mmap.flush()?;
        }
        self.file.set_len(len)?;
        self.mmap = Self::map(&self.file)?;
        Ok(())
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes();
        let range = check_range(offset, buf.len(), bytes.len() as u64)?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let size = self.size()?;
        let range = check_range(offset, data.len(), size)?;
        match self.mmap.as_mut() {
            Some(mmap) => mmap[range].copy_from_slice(data),
            // only an empty write can land on an empty file
            None => debug_assert!(data.is_empty()),
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(mmap) = self.mmap.as_ref() {
            mmap.flush()?;
        }
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(store: &mut impl BlockStore) {
        assert_eq!(store.size().unwrap(), 0);
        assert!(matches!(
            store.write(0, b"x"),
            Err(Error::OutOfBounds { offset: 0, len: 1, size: 0 })
        ));

        store.resize(16).unwrap();
        assert_eq!(store.size().unwrap(), 16);

        let mut buf = [0xFFu8; 16];
        store.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);

        store.write(4, b"abcd").unwrap();
        let mut buf = [0u8; 4];
        store.read(4, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");

        assert!(store.read(14, &mut buf).is_err());
        assert!(store.write(13, b"abcd").is_err());

        store.write_pod(8, &42u32).unwrap();
        assert_eq!(store.read_pod::<u32>(8).unwrap(), 42);

        store.resize(32).unwrap();
        let mut tail = [0xFFu8; 16];
        store.read(16, &mut tail).unwrap();
        assert_eq!(tail, [0u8; 16]);
        store.read(4, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");

        store.resize(0).unwrap();
        assert_eq!(store.size().unwrap(), 0);
        store.sync().unwrap();
    }

    #[test]
    fn test_vec_store() {
        exercise(&mut VecStore::new());
    }

    #[test]
    fn test_mmap_file() {
        let dir = tempdir().unwrap();
        exercise(&mut MMapFile::open_or_create(dir.path().join("store")).unwrap());
    }

    #[test]
    fn test_mmap_file_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        {
            let mut store = MMapFile::open_or_create(&path).unwrap();
            store.resize(8).unwrap();
            store.write(0, b"persist!").unwrap();
            store.sync().unwrap();
        }
        let store = MMapFile::open(&path).unwrap();
        let mut buf = [0u8; 8];
        store.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"persist!");
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            MMapFile::open(dir.path().join("missing")),
            Err(Error::Io(_))
        ));
    }
}
