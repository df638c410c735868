/*!
In-process storage backend, registered as `memory://` when enabled.
*/

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{StorageAdapter, StorageSink};
use crate::config::StorageOptions;
use crate::{PersistError, Result};

/// In-memory storage. Clones share the same archives.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    options_seen: Arc<Mutex<Vec<StorageOptions>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed archive bytes at `path`
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.data).get(path).cloned()
    }

    pub fn insert<P: Into<String>>(&self, path: P, archive: Vec<u8>) {
        lock(&self.data).insert(path.into(), archive);
    }

    pub fn len(&self) -> usize {
        lock(&self.data).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Storage options received by every open, in call order.
    pub fn options_seen(&self) -> Vec<StorageOptions> {
        lock(&self.options_seen).clone()
    }

    fn record(&self, options: &StorageOptions) {
        lock(&self.options_seen).push(options.clone());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StorageAdapter for MemoryStorage {
    fn open_write(&self, path: &str, options: &StorageOptions) -> Result<Box<dyn StorageSink>> {
        self.record(options);
        Ok(Box::new(MemorySink {
            path: path.to_string(),
            buffer: Vec::new(),
            data: Arc::clone(&self.data),
        }))
    }

    fn open_read(&self, path: &str, options: &StorageOptions) -> Result<Box<dyn Read + Send>> {
        self.record(options);
        let archive = self
            .get(path)
            .ok_or_else(|| PersistError::stream(format!("memory://{path}"), "no such archive"))?;
        Ok(Box::new(Cursor::new(archive)))
    }

    fn exists(&self, path: &str) -> bool {
        lock(&self.data).contains_key(path)
    }

    fn delete(&self, path: &str) -> Result<()> {
        lock(&self.data).remove(path);
        Ok(())
    }

    fn accepts_storage_options(&self) -> bool {
        true
    }
}

struct MemorySink {
    path: String,
    buffer: Vec<u8>,
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StorageSink for MemorySink {
    fn commit(self: Box<Self>) -> Result<()> {
        let MemorySink { path, buffer, data } = *self;
        lock(&data).insert(path, buffer);
        Ok(())
    }
}
