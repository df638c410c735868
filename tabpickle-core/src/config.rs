//! Per-call options and engine configuration
//!
//! This module provides the option structures accepted by `persist` and
//! `restore`, the serde-loadable [`EngineConfig`] used to wire an engine, and
//! [`Location`], which splits URIs from local paths.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::codec::StringDecoding;
use crate::compression::{Compression, CompressionSpec};
use crate::{PersistError, Result};

/// Opaque key/value settings handed to URI storage backends.
pub type StorageOptions = BTreeMap<String, String>;

/// Compression directive for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompressionOptions {
    /// Method, or `infer` to choose from the destination suffix
    #[serde(default)]
    pub method: CompressionSpec,
    /// Codec-specific level; the codec default when absent
    #[serde(default)]
    pub level: Option<u32>,
}

impl CompressionOptions {
    pub fn infer() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }
}

impl From<Compression> for CompressionOptions {
    fn from(method: Compression) -> Self {
        Self {
            method: method.into(),
            level: None,
        }
    }
}

impl From<CompressionSpec> for CompressionOptions {
    fn from(method: CompressionSpec) -> Self {
        Self {
            method,
            level: None,
        }
    }
}

impl FromStr for CompressionOptions {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<CompressionSpec>().map(Self::from)
    }
}

/// Options for `persist`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistOptions {
    #[serde(default)]
    pub compression: CompressionOptions,
    /// Negative selects the highest supported protocol
    #[serde(default = "default_protocol")]
    pub protocol: i32,
    #[serde(default)]
    pub storage_options: Option<StorageOptions>,
}

fn default_protocol() -> i32 {
    -1
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            compression: CompressionOptions::default(),
            protocol: default_protocol(),
            storage_options: None,
        }
    }
}

impl PersistOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(mut self, protocol: i32) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_compression<C: Into<CompressionOptions>>(mut self, compression: C) -> Self {
        self.compression = compression.into();
        self
    }

    pub fn with_storage_options(mut self, options: StorageOptions) -> Self {
        self.storage_options = Some(options);
        self
    }
}

/// Options for `restore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOptions {
    #[serde(default)]
    pub compression: CompressionOptions,
    #[serde(default)]
    pub storage_options: Option<StorageOptions>,
    /// Legacy string decodings tried in order; empty means the engine default
    #[serde(default)]
    pub decodings: Vec<StringDecoding>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            compression: CompressionOptions::default(),
            storage_options: None,
            decodings: Vec::new(),
        }
    }
}

impl RestoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compression<C: Into<CompressionOptions>>(mut self, compression: C) -> Self {
        self.compression = compression.into();
        self
    }

    pub fn with_storage_options(mut self, options: StorageOptions) -> Self {
        self.storage_options = Some(options);
        self
    }

    pub fn with_decodings<I: IntoIterator<Item = StringDecoding>>(mut self, decodings: I) -> Self {
        self.decodings = decodings.into_iter().collect();
        self
    }
}

/// Engine wiring, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base directory that relative local paths resolve against
    #[serde(default)]
    pub local_base_path: Option<PathBuf>,
    /// Register the in-process `memory://` backend
    #[serde(default)]
    pub enable_memory: bool,
    /// Default legacy string decoding ladder
    #[serde(default = "default_decodings")]
    pub decodings: Vec<StringDecoding>,
}

fn default_decodings() -> Vec<StringDecoding> {
    StringDecoding::DEFAULT_LADDER.to_vec()
}

impl EngineConfig {
    /// Local storage relative to the working directory, default ladder.
    pub fn default_local() -> Self {
        EngineConfig {
            local_base_path: None,
            enable_memory: false,
            decodings: default_decodings(),
        }
    }

    pub fn with_base_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.local_base_path = Some(path.into());
        self
    }

    pub fn with_memory(mut self) -> Self {
        self.enable_memory = true;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_ladder(&self.decodings)?;
        if let Some(base) = &self.local_base_path {
            if base.as_os_str().is_empty() {
                return Err(PersistError::validation(
                    "local_base_path must not be empty when set",
                ));
            }
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_local()
    }
}

/// A decoding ladder must be non-empty and try each decoding once.
pub(crate) fn validate_ladder(decodings: &[StringDecoding]) -> Result<()> {
    if decodings.is_empty() {
        return Err(PersistError::validation("decoding ladder must not be empty"));
    }
    for (i, decoding) in decodings.iter().enumerate() {
        if decodings[..i].contains(decoding) {
            return Err(PersistError::validation(format!(
                "decoding '{decoding}' appears more than once in the ladder"
            )));
        }
    }
    Ok(())
}

/// Where an archive lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    /// A filesystem path
    Local(PathBuf),
    /// `scheme://path` handled by a registered storage backend
    Uri { scheme: String, path: String },
}

impl Location {
    /// Parse a destination string.
    ///
    /// Supports formats:
    /// - `scheme://path` for registered backends (`file://` maps to a local path)
    /// - `/local/path` or `relative/path` for local storage
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(PersistError::validation("empty destination"));
        }
        match s.split_once("://") {
            Some((scheme, path)) if is_scheme(scheme) => {
                let scheme = scheme.to_ascii_lowercase();
                if scheme == "file" {
                    return Ok(Location::Local(PathBuf::from(path)));
                }
                if path.is_empty() {
                    return Err(PersistError::validation(format!(
                        "Invalid URI '{s}': missing path"
                    )));
                }
                Ok(Location::Uri {
                    scheme,
                    path: path.to_string(),
                })
            }
            _ => Ok(Location::Local(PathBuf::from(s))),
        }
    }

    /// The path component used for suffix-based inference.
    pub fn path_str(&self) -> Option<&str> {
        match self {
            Location::Local(path) => path.to_str(),
            Location::Uri { path, .. } => Some(path),
        }
    }
}

/// RFC 3986 scheme, at least two characters so drive letters stay local.
fn is_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    s.len() > 1
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::Uri { scheme, path } => write!(f, "{scheme}://{path}"),
        }
    }
}

impl FromStr for Location {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
