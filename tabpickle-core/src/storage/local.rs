/*!
Local filesystem storage adapter implementation.
*/

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{StorageAdapter, StorageSink};
use crate::config::StorageOptions;
use crate::{PersistError, Result};

/// Local filesystem storage adapter
///
/// Archives are written to a temporary file next to the destination and
/// renamed into place on commit, so a failed write never leaves a partial
/// archive behind. Missing parent directories are created.
///
/// # Example
/// ```rust
/// use tabpickle_core::storage::{LocalFileStorage, StorageAdapter};
/// use std::io::Write;
///
/// let dir = tempfile::tempdir()?;
/// let storage = LocalFileStorage::with_base_dir(dir.path());
/// let mut sink = storage.open_write("frames/a.pkl", &Default::default())?;
/// sink.write_all(b"archive bytes")?;
/// sink.commit()?;
/// assert!(storage.exists("frames/a.pkl"));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    /// Optional base directory that relative paths resolve against
    base_dir: Option<PathBuf>,
}

impl LocalFileStorage {
    /// Paths are used as given.
    pub fn new() -> Self {
        Self { base_dir: None }
    }

    /// Relative paths resolve against `base_dir`; absolute paths are used as given.
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: Some(base_dir.as_ref().to_path_buf()),
        }
    }

    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        match &self.base_dir {
            Some(base) => base.join(path),
            None => PathBuf::from(path),
        }
    }

    /// Ensure the parent directory exists and return it
    fn ensure_parent_dir(&self, path: &Path) -> Result<PathBuf> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !parent.exists() {
            fs::create_dir_all(&parent).map_err(|e| {
                PersistError::stream(
                    path.display().to_string(),
                    format!("Failed to create directory {}: {e}", parent.display()),
                )
            })?;
        }
        Ok(parent)
    }
}

impl Default for LocalFileStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageAdapter for LocalFileStorage {
    fn open_write(&self, path: &str, _options: &StorageOptions) -> Result<Box<dyn StorageSink>> {
        let full_path = self.resolve_path(path);
        let parent = self.ensure_parent_dir(&full_path)?;
        let file = NamedTempFile::new_in(&parent).map_err(|e| {
            PersistError::stream(full_path.display().to_string(), e.to_string())
        })?;
        Ok(Box::new(LocalSink {
            file,
            target: full_path,
        }))
    }

    fn open_read(&self, path: &str, _options: &StorageOptions) -> Result<Box<dyn Read + Send>> {
        let full_path = self.resolve_path(path);
        let file = File::open(&full_path).map_err(|e| {
            PersistError::stream(full_path.display().to_string(), e.to_string())
        })?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve_path(path).is_file()
    }

    fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path);
        if full_path.exists() {
            fs::remove_file(&full_path).map_err(|e| {
                PersistError::stream(
                    full_path.display().to_string(),
                    format!("Failed to delete: {e}"),
                )
            })?;
        }
        Ok(())
    }
}

/// Uncommitted local archive; the temporary file is removed on drop.
struct LocalSink {
    file: NamedTempFile,
    target: PathBuf,
}

impl Write for LocalSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl StorageSink for LocalSink {
    fn commit(self: Box<Self>) -> Result<()> {
        let LocalSink { mut file, target } = *self;
        file.flush()?;
        file.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(file.path(), fs::Permissions::from_mode(0o644))?;
        }
        file.persist(&target).map_err(|e| {
            PersistError::stream(target.display().to_string(), e.error.to_string())
        })?;
        Ok(())
    }
}
