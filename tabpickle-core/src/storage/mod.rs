/*!
Stream handles for archive persistence.

Storage backends are adapters behind [`StorageAdapter`]; the engine never
touches them directly. [`StreamProvider`] turns a destination or source
(a path, a `scheme://` URI, or a caller-owned stream) plus a compression
directive into a scoped stream that is released exactly once, on success
and on every error path.
*/

pub mod local;
pub mod memory;

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::compression::{self, Compression, Encoder};
use crate::config::{CompressionOptions, Location, StorageOptions};
use crate::{PersistError, Result};

pub use local::LocalFileStorage;
pub use memory::MemoryStorage;

/// Scheme that local paths are routed to.
pub const LOCAL_SCHEME: &str = "file";

/// Storage abstraction for archive bytes
///
/// Implementations hand out streams rather than whole buffers, so archives
/// are written while they are serialized.
pub trait StorageAdapter: Send + Sync {
    /// Open `path` for writing. Nothing becomes visible at `path` until the
    /// returned sink is committed.
    fn open_write(&self, path: &str, options: &StorageOptions) -> Result<Box<dyn StorageSink>>;

    /// Open `path` for reading.
    fn open_read(&self, path: &str, options: &StorageOptions) -> Result<Box<dyn Read + Send>>;

    /// Check if an archive exists at `path`
    fn exists(&self, path: &str) -> bool;

    /// Delete the archive at `path`, if any
    fn delete(&self, path: &str) -> Result<()>;

    /// Whether caller-supplied storage options mean anything to this backend.
    fn accepts_storage_options(&self) -> bool {
        false
    }
}

/// Write half of a storage backend. Dropping it without [`commit`](StorageSink::commit)
/// discards everything written.
pub trait StorageSink: Write + Send {
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Where `persist` writes.
pub enum Destination<'a> {
    Location(Location),
    /// A caller-owned stream; flushed but never closed
    Writer(&'a mut dyn Write),
}

impl<'a> Destination<'a> {
    pub fn writer<W: Write + 'a>(writer: &'a mut W) -> Self {
        Destination::Writer(writer)
    }
}

impl From<Location> for Destination<'_> {
    fn from(location: Location) -> Self {
        Destination::Location(location)
    }
}

impl From<PathBuf> for Destination<'_> {
    fn from(path: PathBuf) -> Self {
        Destination::Location(Location::Local(path))
    }
}

impl From<&Path> for Destination<'_> {
    fn from(path: &Path) -> Self {
        Destination::Location(Location::Local(path.to_path_buf()))
    }
}

impl<'a> From<&'a mut dyn Write> for Destination<'a> {
    fn from(writer: &'a mut dyn Write) -> Self {
        Destination::Writer(writer)
    }
}

/// Where `restore` reads.
pub enum Source<'a> {
    Location(Location),
    /// A caller-owned stream; never closed
    Reader(&'a mut dyn Read),
}

impl<'a> Source<'a> {
    pub fn reader<R: Read + 'a>(reader: &'a mut R) -> Self {
        Source::Reader(reader)
    }
}

impl From<Location> for Source<'_> {
    fn from(location: Location) -> Self {
        Source::Location(location)
    }
}

impl From<PathBuf> for Source<'_> {
    fn from(path: PathBuf) -> Self {
        Source::Location(Location::Local(path))
    }
}

impl From<&Path> for Source<'_> {
    fn from(path: &Path) -> Self {
        Source::Location(Location::Local(path.to_path_buf()))
    }
}

impl<'a> From<&'a mut dyn Read> for Source<'a> {
    fn from(reader: &'a mut dyn Read) -> Self {
        Source::Reader(reader)
    }
}

enum Sink<'a> {
    Storage(Box<dyn StorageSink>),
    Borrowed(&'a mut dyn Write),
}

impl Sink<'_> {
    fn commit(self) -> Result<()> {
        match self {
            Sink::Storage(sink) => sink.commit(),
            Sink::Borrowed(writer) => Ok(writer.flush()?),
        }
    }
}

impl Write for Sink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Storage(sink) => sink.write(buf),
            Sink::Borrowed(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Storage(sink) => sink.flush(),
            Sink::Borrowed(writer) => writer.flush(),
        }
    }
}

/// A write stream with its compression envelope.
///
/// [`ScopedWriter::finish`] writes trailers and commits; dropping the writer
/// unfinished releases the destination without committing.
pub struct ScopedWriter<'a> {
    encoder: Option<Encoder<Sink<'a>>>,
    target: String,
    compression: Compression,
}

impl ScopedWriter<'_> {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Finish the envelope and commit the destination.
    pub fn finish(mut self) -> Result<()> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| PersistError::stream(self.target.clone(), "stream already finished"))?;
        encoder.finish()?.commit()?;
        debug!(location = %self.target, "Committed write stream");
        Ok(())
    }
}

impl Write for ScopedWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.encoder.as_mut() {
            Some(encoder) => encoder.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream already finished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.encoder.as_mut() {
            Some(encoder) => encoder.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for ScopedWriter<'_> {
    fn drop(&mut self) {
        if self.encoder.take().is_some() {
            debug!(location = %self.target, "Released unfinished write stream");
        }
    }
}

/// A decompressing read stream. Dropping it releases the source.
pub struct ScopedReader<'a> {
    reader: Box<dyn Read + 'a>,
    target: String,
    compression: Compression,
}

impl ScopedReader<'_> {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Read the whole (decompressed) archive and release the source.
    pub fn read_archive(mut self) -> Result<Vec<u8>> {
        let mut archive = Vec::new();
        match self.reader.read_to_end(&mut archive) {
            Ok(_) => Ok(archive),
            Err(e) if self.compression != Compression::None => Err(PersistError::compression(
                format!("Failed to decompress {} as {}: {e}", self.target, self.compression),
            )),
            Err(e) => Err(PersistError::Io(e)),
        }
    }
}

impl Read for ScopedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Routes destinations and sources to storage backends by URI scheme.
#[derive(Clone)]
pub struct StreamProvider {
    adapters: BTreeMap<String, Arc<dyn StorageAdapter>>,
}

impl StreamProvider {
    /// A provider with local file storage only.
    pub fn new() -> Self {
        Self::with_local(LocalFileStorage::new())
    }

    pub fn with_local(local: LocalFileStorage) -> Self {
        let mut adapters: BTreeMap<String, Arc<dyn StorageAdapter>> = BTreeMap::new();
        adapters.insert(LOCAL_SCHEME.to_string(), Arc::new(local));
        Self { adapters }
    }

    /// Register `adapter` for `scheme://` locations, replacing any previous one.
    pub fn register<S: Into<String>>(&mut self, scheme: S, adapter: Arc<dyn StorageAdapter>) {
        self.adapters.insert(scheme.into().to_ascii_lowercase(), adapter);
    }

    pub fn with_adapter<S: Into<String>>(mut self, scheme: S, adapter: Arc<dyn StorageAdapter>) -> Self {
        self.register(scheme, adapter);
        self
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    /// Acquire a write stream for `destination`.
    pub fn open_write<'a>(
        &self,
        destination: Destination<'a>,
        compression: &CompressionOptions,
        storage_options: Option<&StorageOptions>,
    ) -> Result<ScopedWriter<'a>> {
        let no_options = StorageOptions::new();
        let (sink, path, target) = match destination {
            Destination::Location(location) => {
                let (adapter, path) = self.route(&location, storage_options)?;
                let sink = adapter.open_write(&path, storage_options.unwrap_or(&no_options))?;
                (Sink::Storage(sink), Some(path), location.to_string())
            }
            Destination::Writer(writer) => {
                reject_options_for_stream(storage_options)?;
                (Sink::Borrowed(writer), None, "<stream>".to_string())
            }
        };

        let method = compression.method.resolve(path.as_deref());
        let encoder = Encoder::new(sink, method, compression.level, path.as_deref())?;
        debug!(location = %target, compression = %method, "Opened write stream");
        Ok(ScopedWriter {
            encoder: Some(encoder),
            target,
            compression: method,
        })
    }

    /// Acquire a read stream for `source`.
    pub fn open_read<'a>(
        &self,
        source: Source<'a>,
        compression: &CompressionOptions,
        storage_options: Option<&StorageOptions>,
    ) -> Result<ScopedReader<'a>> {
        let no_options = StorageOptions::new();
        let (raw, path, target): (Box<dyn Read + 'a>, _, _) = match source {
            Source::Location(location) => {
                let (adapter, path) = self.route(&location, storage_options)?;
                let raw = adapter.open_read(&path, storage_options.unwrap_or(&no_options))?;
                (raw, Some(path), location.to_string())
            }
            Source::Reader(reader) => {
                reject_options_for_stream(storage_options)?;
                (Box::new(reader), None, "<stream>".to_string())
            }
        };

        let method = compression.method.resolve(path.as_deref());
        let reader = compression::decoder(raw, method)?;
        debug!(location = %target, compression = %method, "Opened read stream");
        Ok(ScopedReader {
            reader,
            target,
            compression: method,
        })
    }

    /// Find the backend for `location` and the path it understands.
    fn route(
        &self,
        location: &Location,
        storage_options: Option<&StorageOptions>,
    ) -> Result<(Arc<dyn StorageAdapter>, String)> {
        let (scheme, path) = match location {
            Location::Local(path) => {
                let path = path.to_str().ok_or_else(|| {
                    PersistError::stream(location.to_string(), "path is not valid UTF-8")
                })?;
                (LOCAL_SCHEME, path.to_string())
            }
            Location::Uri { scheme, path } => (scheme.as_str(), path.clone()),
        };

        let adapter = self.adapters.get(scheme).cloned().ok_or_else(|| {
            PersistError::stream(
                location.to_string(),
                format!("no storage backend registered for scheme '{scheme}'"),
            )
        })?;
        if storage_options.is_some() && !adapter.accepts_storage_options() {
            return Err(PersistError::stream(
                location.to_string(),
                "storage_options passed with a local file path; they only apply to URI backends",
            ));
        }
        Ok((adapter, path))
    }
}

impl Default for StreamProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn reject_options_for_stream(storage_options: Option<&StorageOptions>) -> Result<()> {
    match storage_options {
        Some(_) => Err(PersistError::stream(
            "<stream>",
            "storage_options passed with a file object",
        )),
        None => Ok(()),
    }
}
