/// Options for opening a [`FileMap`](crate::FileMap).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Config {
    /// Capacity to create the map with.
    ///
    /// `Some(n)` reuses a compatible file of capacity `n` and reinitializes
    /// anything else. `None` loads the capacity recorded in an existing file.
    pub capacity: Option<u32>,

    /// Flush and fsync the file after every successful `set` and `delete`.
    pub sync_writes: bool,
}

impl Config {
    pub fn create(capacity: u32) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn load() -> Self {
        Self::default()
    }

    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }
}
