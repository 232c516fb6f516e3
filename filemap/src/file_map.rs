use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bitmap::Bitmap;
use crate::config::Config;
use crate::data::DataStore;
use crate::error::{Error, Result};
use crate::hash::{Bkdr, KeyHash};
use crate::index::{HashIndex, InsertPlan, Slot};
use crate::layout::{DEFINITION_SIZE, SegmentMap};
use crate::record::{DataMap, Definition, Key, Value};
use crate::store::{BlockStore, MMapFile};

/// Why an existing file cannot be reused as is.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Unusable {
    Empty,
    Version(String),
    BadCapacity,
    Truncated { size: u64, needed: u64 },
    Capacity { found: u32, wanted: u32 },
}

impl fmt::Display for Unusable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unusable::Empty => write!(f, "file is empty"),
            Unusable::Version(v) => write!(f, "unknown version {v:?}"),
            Unusable::BadCapacity => write!(f, "stored capacity is not positive"),
            Unusable::Truncated { size, needed } => {
                write!(f, "file is {size} bytes, header and index need {needed}")
            }
            Unusable::Capacity { found, wanted } => {
                write!(f, "capacity {found} does not match requested {wanted}")
            }
        }
    }
}

struct Inner<S, H> {
    store: S,
    map: SegmentMap,
    index: HashIndex<H>,
    data: DataStore,
    sync_writes: bool,
}

impl<S: BlockStore, H: KeyHash> Inner<S, H> {
    fn after_write(&mut self) -> Result<()> {
        if self.sync_writes {
            self.store.sync()?;
        }
        Ok(())
    }
}

/// A fixed-capacity key-value map persisted in a single file.
///
/// Every operation takes the instance lock for its whole duration, so calls
/// from several threads on one handle are applied one at a time. Only one
/// handle per file is supported.
pub struct FileMap<S = MMapFile, H = Bkdr> {
    capacity: u32,
    inner: Mutex<Inner<S, H>>,
}

impl FileMap<MMapFile, Bkdr> {
    /// Opens `path` with the given capacity, creating or reinitializing it as needed.
    pub fn create(path: impl AsRef<Path>, capacity: u32) -> Result<Self> {
        Self::open(path, Config::create(capacity))
    }

    /// Opens an existing file map, taking the capacity from its header.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path, Config::load())
    }

    pub fn open(path: impl AsRef<Path>, cfg: Config) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), ?cfg, "opening file map");
        let store = match cfg.capacity {
            Some(_) => MMapFile::open_or_create(path)?,
            None => MMapFile::open(path)?,
        };
        Self::with_store(store, cfg, Bkdr)
    }
}

impl<S: BlockStore, H: KeyHash> FileMap<S, H> {
    /// Builds a map over any block store.
    ///
    /// With `cfg.capacity` set, an empty or incompatible store is
    /// reinitialized (discarding its contents). Without it, such a store is
    /// rejected with [`Error::Incompatible`] and left untouched.
    pub fn with_store(mut store: S, cfg: Config, hasher: H) -> Result<Self> {
        if let Some(capacity) = cfg.capacity {
            if capacity == 0 || capacity > i32::MAX as u32 {
                return Err(Error::InvalidCapacity(capacity));
            }
        }

        let capacity = match (cfg.capacity, Self::inspect(&store)?) {
            (Some(wanted), Ok(found)) if wanted == found => found,
            (Some(wanted), Ok(found)) => {
                let reason = Unusable::Capacity { found, wanted };
                Self::reinitialize(&mut store, wanted, &reason)?;
                wanted
            }
            (Some(wanted), Err(reason)) => {
                Self::reinitialize(&mut store, wanted, &reason)?;
                wanted
            }
            (None, Ok(found)) => found,
            (None, Err(reason)) => return Err(Error::Incompatible(reason.to_string())),
        };

        let map = SegmentMap::for_capacity(capacity);
        info!(capacity, size = store.size()?, "file map open");
        Ok(Self {
            capacity,
            inner: Mutex::new(Inner {
                store,
                map,
                index: HashIndex::new(&map, hasher),
                data: DataStore::new(map.data, capacity),
                sync_writes: cfg.sync_writes,
            }),
        })
    }

    /// Reads the definition record and the capacity it declares.
    fn inspect(store: &S) -> Result<std::result::Result<u32, Unusable>> {
        let size = store.size()?;
        if size == 0 {
            return Ok(Err(Unusable::Empty));
        }
        if size < DEFINITION_SIZE {
            return Ok(Err(Unusable::Truncated {
                size,
                needed: DEFINITION_SIZE,
            }));
        }

        let def: Definition = store.read_pod(0)?;
        if !def.is_current_version() {
            return Ok(Err(Unusable::Version(def.version())));
        }
        let Some(capacity) = def.capacity() else {
            return Ok(Err(Unusable::BadCapacity));
        };
        let needed = SegmentMap::for_capacity(capacity).initial_size();
        if size < needed {
            return Ok(Err(Unusable::Truncated { size, needed }));
        }
        Ok(Ok(capacity))
    }

    fn reinitialize(store: &mut S, capacity: u32, reason: &Unusable) -> Result<()> {
        if *reason == Unusable::Empty {
            info!(capacity, "initializing empty file");
        } else {
            warn!(capacity, %reason, "discarding incompatible file");
        }
        let map = SegmentMap::for_capacity(capacity);
        store.resize(0)?;
        store.resize(map.initial_size())?;
        store.write_pod(0, &Definition::new(capacity))?;
        store.sync()?;
        info!(capacity, size = map.initial_size(), "reinitialized");
        Ok(())
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn segment_map(&self) -> SegmentMap {
        self.inner.lock().map
    }

    pub fn exists(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        let key = Key::new(key)?;
        let inner = self.inner.lock();
        Ok(inner.index.find(&inner.store, &key)?.is_some())
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Value>> {
        let key = Key::new(key)?;
        let inner = self.inner.lock();
        match inner.index.find(&inner.store, &key)? {
            Some(record) => Ok(Some(inner.data.get(&inner.store, record.data_index())?)),
            None => Ok(None),
        }
    }

    /// Inserts or replaces the value of `key`.
    ///
    /// Fails with [`Error::CapacityExceeded`] when `key` is new and the map
    /// is full; nothing is written in that case.
    pub fn set(&self, key: impl AsRef<[u8]>, value: &Value) -> Result<()> {
        let key = Key::new(key)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match inner.index.plan_insert(&inner.store, &key)? {
            InsertPlan::Replace { existing, .. } => {
                inner.data.set(&mut inner.store, existing.data_index(), value)?;
            }
            plan => {
                let slot = inner
                    .index
                    .data_bitmap()
                    .scan_first_free(&inner.store)?
                    .ok_or(Error::CapacityExceeded)?;
                debug!(?key, slot, "allocating data slot");
                inner.data.set(&mut inner.store, slot, value)?;
                inner.index.data_bitmap().set_bit(&mut inner.store, slot, true)?;
                inner
                    .index
                    .apply_insert(&mut inner.store, plan, DataMap::occupied(key, slot))?;
            }
        }
        inner.after_write()
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        let key = Key::new(key)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let removed = inner.index.remove(&mut inner.store, &key)?;
        if removed.is_some() {
            inner.after_write()?;
        }
        Ok(removed.is_some())
    }

    /// Number of live records
    pub fn len(&self) -> Result<usize> {
        let inner = self.inner.lock();
        Ok(inner.index.data_bitmap().count_ones(&inner.store)? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// All keys, in primary table order with each chain in link order.
    pub fn keys(&self) -> Result<Vec<Key>> {
        let inner = self.inner.lock();
        Ok(inner
            .index
            .records(&inner.store)?
            .into_iter()
            .map(|r| r.key)
            .collect())
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.lock().store.sync()
    }

    /// Flushes the file and releases the handle.
    pub fn close(self) -> Result<()> {
        let mut inner = self.inner.into_inner();
        inner.store.sync()?;
        debug!(capacity = self.capacity, "file map closed");
        Ok(())
    }

    /// Writes a human-readable description of the whole file to `path`.
    ///
    /// For debugging only; the format is not stable.
    pub fn dump_debug_info(&self, path: impl AsRef<Path>) -> Result<()> {
        let inner = self.inner.lock();
        let mut out = BufWriter::new(File::create(path.as_ref())?);
        write_report(&mut out, &*inner)?;
        out.flush()?;
        Ok(())
    }
}

fn write_report<S: BlockStore, H: KeyHash>(out: &mut impl Write, inner: &Inner<S, H>) -> Result<()> {
    let store = &inner.store;
    let map = &inner.map;
    let index = &inner.index;

    let def: Definition = store.read_pod(0)?;
    writeln!(out, "fileinfo:\n{{")?;
    writeln!(out, "  size={}", store.size()?)?;
    writeln!(
        out,
        "  version=<{}>,capacity={}",
        def.version(),
        def.capacity().unwrap_or(0)
    )?;
    writeln!(out, "  primary_slots={}", index.primary_slots())?;
    writeln!(out, "  live={}", index.data_bitmap().count_ones(store)?)?;
    writeln!(out, "}}\n")?;

    let idx = &map.index;
    writeln!(out, "segments:\n{{")?;
    for (name, seg) in [
        ("file", map.seg),
        ("definition", map.definition),
        ("index", idx.seg),
        ("data_bitmap", idx.data_bitmap),
        ("chain_bitmap", idx.chain_bitmap),
        ("primary", idx.primary),
        ("overflow", idx.overflow),
        ("data", map.data),
    ] {
        writeln!(out, "  {name:<12} [pos={},size={}]", seg.pos, seg.size)?;
    }
    writeln!(out, "}}\n")?;

    write_bitmap(out, store, "bitmap_data", index.data_bitmap())?;
    write_bitmap(out, store, "bitmap_chain", index.chain_bitmap())?;

    writeln!(out, "primary:\n{{")?;
    for i in 0..index.primary_slots() {
        write_record(out, index, i, &index.read_slot(store, Slot::Primary(i))?)?;
    }
    writeln!(out, "}}\n")?;

    writeln!(out, "overflow:\n{{")?;
    for i in 0..map.capacity {
        write_record(out, index, i, &index.read_slot(store, Slot::Overflow(i))?)?;
    }
    writeln!(out, "}}\n")?;

    writeln!(out, "data:\n{{")?;
    for i in 0..map.capacity {
        if !index.data_bitmap().get_bit(store, i)? {
            continue;
        }
        match inner.data.get(store, i) {
            Ok(value) => {
                let head = &value.trimmed()[..value.trimmed().len().min(32)];
                writeln!(out, "  [{i}] value={}...", String::from_utf8_lossy(head))?;
            }
            Err(e) => writeln!(out, "  [{i}] unreadable: {e}")?,
        }
    }
    writeln!(out, "}}")?;
    Ok(())
}

fn write_bitmap(
    out: &mut impl Write,
    store: &impl BlockStore,
    name: &str,
    bitmap: &Bitmap,
) -> Result<()> {
    let region = bitmap.region();
    let mut bytes = vec![0u8; region.size as usize];
    store.read(region.pos, &mut bytes)?;

    writeln!(out, "{name}:\n{{")?;
    for (line, chunk) in bytes.chunks(10).enumerate() {
        let start = line * 10;
        write!(out, "  [{}-{}]", start, start + chunk.len())?;
        for b in chunk {
            write!(out, " {b:02X}")?;
        }
        writeln!(out)?;
    }
    writeln!(out, "}}\n")?;
    Ok(())
}

fn write_record<H: KeyHash>(
    out: &mut impl Write,
    index: &HashIndex<H>,
    i: u32,
    record: &DataMap,
) -> Result<()> {
    writeln!(
        out,
        "  [{i}] used={},key={},hash={},index={},next={}",
        record.is_used() as u8,
        record.key.to_string_lossy(),
        index.bucket_of(record.key.as_bytes()),
        record.raw_data_index(),
        record.raw_next()
    )?;
    Ok(())
}
