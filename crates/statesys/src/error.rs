//! Error and Result types for state system operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for state system operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// The error type for state system operations.
///
/// `AttributeNotFound`, `TimeRange` and `StateValueType` are expected,
/// per-call conditions: providers and queries handle them and move on.
/// The remaining variants are reported by [`StateError::is_fatal`].
#[derive(Debug, Error)]
pub enum StateError {
    /// A non-creating path or quark lookup failed.
    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    /// A time argument violates ordering or range constraints.
    #[error("Time range error: {0}")]
    TimeRange(String),

    /// A value's kind conflicts with the kind the attribute currently holds.
    #[error("State value type error: {0}")]
    StateValueType(String),

    /// Invalid magic number in a persisted section.
    #[error("Invalid magic number: {0:#010x}")]
    InvalidMagic(u32),

    /// Unsupported history file format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Stored checksum does not match the data read back.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Persisted data is malformed (truncated, bad length accounting, ...).
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// An attribute path is too long to be persisted.
    #[error("Attribute path too long to persist ({len} bytes): {path}")]
    AttributeNameTooLong {
        /// The offending full path.
        path: String,
        /// Encoded length in bytes.
        len: usize,
    },

    /// The state system has been disposed.
    #[error("State system has been disposed")]
    Disposed,

    /// A state provider panicked while handling an event.
    #[error("State provider panicked: {0}")]
    ProviderPanicked(String),

    /// The history is closed and no longer accepts modifications.
    #[error("History is closed, modifications are no longer accepted")]
    BuildFinished,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl StateError {
    /// Returns true for conditions that invalidate the whole operation or
    /// instance rather than a single call.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::AttributeNotFound(_) | Self::TimeRange(_) | Self::StateValueType(_)
        )
    }
}
