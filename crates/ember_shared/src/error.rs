//! # Stream Error Types
//!
//! All errors that can occur while reading or writing a serialization stream.

use thiserror::Error;

/// Errors that can occur in the serialization stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The reader ran out of bytes.
    #[error("unexpected end of stream: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the stream.
        remaining: usize,
    },

    /// A string payload was not valid UTF-8.
    #[error("invalid utf-8 in string payload")]
    InvalidUtf8,

    /// A boolean byte held something other than 0 or 1.
    #[error("invalid boolean byte: {0}")]
    InvalidBool(u8),

    /// The stream does not start with the expected magic bytes.
    #[error("bad magic: expected {expected:?}, found {found:?}")]
    BadMagic {
        /// The magic this reader understands.
        expected: [u8; 4],
        /// What was actually in the stream.
        found: [u8; 4],
    },

    /// The stream was written by a newer format than this reader supports.
    #[error("unsupported format version {found} (max supported {supported})")]
    UnsupportedVersion {
        /// Version found in the stream.
        found: u32,
        /// Highest version this reader understands.
        supported: u32,
    },

    /// A payload was structurally invalid.
    #[error("malformed data: {0}")]
    Malformed(String),
}

/// Result type for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;
