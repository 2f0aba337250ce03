//! Wire protocol errors
//!
//! All errors are recoverable and provide diagnostic context.

use std::io::ErrorKind as IoErrorKind;

/// Wire protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Frame body exceeds the size limit.
    ///
    /// Caused by:
    /// - Encoding a batch whose body would exceed the limit
    /// - A single field longer than a u32 length prefix can express
    MessageTooLarge {
        /// Actual size in bytes
        actual_size: usize,
        /// Maximum allowed size
        max_size: usize,
    },

    /// End of stream reached before a complete frame or status.
    ///
    /// Caused by:
    /// - Peer closed the connection
    /// - Truncated frame
    UnexpectedEof {
        /// Bytes successfully read before EOF
        bytes_read: usize,
        /// Expected bytes
        expected_bytes: usize,
    },

    /// Length prefix indicates an invalid size.
    InvalidLength {
        /// Invalid length value
        length: u32,
        /// Reason why the length is invalid
        reason: String,
    },

    /// Body does not decode as a batch.
    ///
    /// Caused by:
    /// - A field running past the end of the body
    /// - Invalid UTF-8 or an invalid queue name
    /// - Trailing bytes after the last message
    Malformed {
        /// Field being decoded
        field: &'static str,
        /// What was wrong
        reason: String,
    },

    /// Peer speaks a protocol version we do not.
    UnsupportedVersion {
        /// Version byte received
        version: u8,
    },

    /// Status byte is not a known token.
    UnknownStatus {
        /// Byte received
        byte: u8,
    },

    /// Write operation failed.
    WriteFailed {
        /// OS error code
        error_code: Option<i32>,
        /// Error kind
        kind: IoErrorKind,
    },

    /// Read operation failed.
    ReadFailed {
        /// OS error code
        error_code: Option<i32>,
        /// Error kind
        kind: IoErrorKind,
    },
}

impl WireError {
    /// Create a MessageTooLarge error
    pub const fn message_too_large(actual_size: usize, max_size: usize) -> Self {
        Self::MessageTooLarge {
            actual_size,
            max_size,
        }
    }

    /// Create an UnexpectedEof error
    pub const fn unexpected_eof(bytes_read: usize, expected_bytes: usize) -> Self {
        Self::UnexpectedEof {
            bytes_read,
            expected_bytes,
        }
    }

    /// Create an InvalidLength error
    pub fn invalid_length(length: u32, reason: impl Into<String>) -> Self {
        Self::InvalidLength {
            length,
            reason: reason.into(),
        }
    }

    /// Create a Malformed error
    pub fn malformed(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            field,
            reason: reason.into(),
        }
    }

    /// Create a WriteFailed error from std::io::Error
    pub fn write_failed(err: &std::io::Error) -> Self {
        Self::WriteFailed {
            error_code: err.raw_os_error(),
            kind: err.kind(),
        }
    }

    /// Create a ReadFailed error from std::io::Error, mapping EOF to UnexpectedEof
    pub fn read_failed(err: &std::io::Error, bytes_read: usize, expected_bytes: usize) -> Self {
        if err.kind() == IoErrorKind::UnexpectedEof {
            return Self::unexpected_eof(bytes_read, expected_bytes);
        }
        Self::ReadFailed {
            error_code: err.raw_os_error(),
            kind: err.kind(),
        }
    }

    /// Whether the error came from the transport rather than from frame contents.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(
            self,
            Self::WriteFailed { .. } | Self::ReadFailed { .. } | Self::UnexpectedEof { .. }
        )
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageTooLarge {
                actual_size,
                max_size,
            } => {
                write!(
                    f,
                    "Message too large: {} bytes (max {} bytes)",
                    actual_size, max_size
                )
            }
            Self::UnexpectedEof {
                bytes_read,
                expected_bytes,
            } => {
                write!(
                    f,
                    "Unexpected EOF: {} bytes read, expected {}",
                    bytes_read, expected_bytes
                )
            }
            Self::InvalidLength { length, reason } => {
                write!(f, "Invalid length prefix {}: {}", length, reason)
            }
            Self::Malformed { field, reason } => {
                write!(f, "Malformed batch at {}: {}", field, reason)
            }
            Self::UnsupportedVersion { version } => {
                write!(f, "Unsupported protocol version {}", version)
            }
            Self::UnknownStatus { byte } => {
                write!(f, "Unknown status byte {:#04x}", byte)
            }
            Self::WriteFailed { error_code, kind } => {
                write!(f, "Write failed: {:?} (error code: {:?})", kind, error_code)
            }
            Self::ReadFailed { error_code, kind } => {
                write!(f, "Read failed: {:?} (error code: {:?})", kind, error_code)
            }
        }
    }
}

impl std::error::Error for WireError {}

impl From<WireError> for quay_core::Error {
    fn from(err: WireError) -> Self {
        if err.is_io() {
            Self::connection("peer", err.to_string())
        } else {
            Self::protocol_violation(err.to_string())
        }
    }
}

/// Result type for wire operations
pub type WireResult<T> = Result<T, WireError>;
