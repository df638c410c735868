/*!
Error types for the tabpickle core engine.
*/

use crate::symbol::LegacyReference;
use thiserror::Error;

/// Result type used throughout the tabpickle core.
pub type Result<T> = std::result::Result<T, PersistError>;

/// Coarse classification of a [`PersistError`].
///
/// Callers use this to tell "written by an unsupported version" apart from
/// "this file is corrupt" without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The destination or source could not be opened.
    StreamAcquisition,
    /// The value graph cannot be represented in the requested protocol.
    Serialization,
    /// The archive was written by a newer release than this one reads.
    UnsupportedVersion,
    /// A legacy symbol has no resolution anywhere in the registry.
    UnresolvableSymbol,
    /// Legacy 8-bit string data could not be decoded under the active assumption.
    Encoding,
    /// The byte stream is not a valid archive.
    CorruptArchive,
    /// Invalid registry or option configuration.
    Configuration,
    /// Underlying I/O failure outside stream acquisition.
    Io,
}

/// Errors that can occur while persisting or restoring archives.
#[derive(Error, Debug)]
pub enum PersistError {
    /// I/O errors while streaming archive bytes
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON conversion errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Destination or source could not be opened
    #[error("Failed to open {target}: {reason}")]
    StreamAcquisition { target: String, reason: String },

    /// Compression envelope could not be read or written
    #[error("Compression error: {0}")]
    Compression(String),

    /// The value graph contains something the codec cannot represent
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Requested protocol is outside the supported range
    #[error("Unsupported protocol {requested} (supported: {lowest}..={highest})")]
    UnsupportedProtocol {
        requested: i32,
        lowest: u8,
        highest: u8,
    },

    /// The archive header names a protocol newer than the codec reads
    #[error("Archive uses protocol {found}, newer than the highest supported ({highest})")]
    UnsupportedArchive { found: u8, highest: u8 },

    /// A legacy reference could not be mapped to a current symbol
    #[error("Unresolvable symbol {reference}{}", describe_attempts(.attempts))]
    UnresolvableSymbol {
        reference: LegacyReference,
        attempts: Vec<String>,
    },

    /// Legacy 8-bit string data failed to decode
    #[error("Cannot decode legacy string at offset {offset} as {encoding}")]
    StringDecode { encoding: String, offset: u64 },

    /// The stream is not a valid archive
    #[error("Corrupt archive at offset {offset}: {reason}")]
    CorruptArchive { offset: u64, reason: String },

    /// A reconstruct adapter rejected the legacy state it was given
    #[error("Failed to reconstruct {reference}: {reason}")]
    Reconstruct {
        reference: LegacyReference,
        reason: String,
    },

    /// Legacy registry configuration errors
    #[error("Registry error: {0}")]
    Registry(String),

    /// Option validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

fn describe_attempts(attempts: &[String]) -> String {
    if attempts.is_empty() {
        String::new()
    } else {
        format!(" (tried decodings: {})", attempts.join(", "))
    }
}

impl PersistError {
    /// Create a new stream acquisition error
    pub fn stream<T: Into<String>, R: Into<String>>(target: T, reason: R) -> Self {
        Self::StreamAcquisition {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new serialization error
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a new corrupt archive error
    pub fn corrupt<S: Into<String>>(offset: u64, reason: S) -> Self {
        Self::CorruptArchive {
            offset,
            reason: reason.into(),
        }
    }

    /// Create an unresolvable symbol error for a single attempt
    pub fn unresolvable(reference: LegacyReference) -> Self {
        Self::UnresolvableSymbol {
            reference,
            attempts: Vec::new(),
        }
    }

    /// Create a new registry error
    pub fn registry<S: Into<String>>(msg: S) -> Self {
        Self::Registry(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StreamAcquisition { .. } => ErrorKind::StreamAcquisition,
            Self::Serialization(_) | Self::UnsupportedProtocol { .. } => ErrorKind::Serialization,
            Self::UnsupportedArchive { .. } => ErrorKind::UnsupportedVersion,
            Self::UnresolvableSymbol { .. } => ErrorKind::UnresolvableSymbol,
            Self::StringDecode { .. } => ErrorKind::Encoding,
            Self::CorruptArchive { .. } | Self::Compression(_) | Self::Reconstruct { .. } => {
                ErrorKind::CorruptArchive
            }
            Self::Registry(_) | Self::Validation(_) => ErrorKind::Configuration,
            Self::Io(_) | Self::Json(_) => ErrorKind::Io,
        }
    }

    /// Whether `restore` may retry this failure under the next decoding assumption.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UnresolvableSymbol | ErrorKind::Encoding
        )
    }

    /// The legacy reference this error is about, if any.
    pub fn legacy_reference(&self) -> Option<&LegacyReference> {
        match self {
            Self::UnresolvableSymbol { reference, .. } | Self::Reconstruct { reference, .. } => {
                Some(reference)
            }
            _ => None,
        }
    }
}
