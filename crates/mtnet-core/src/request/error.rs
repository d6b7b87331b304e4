//! Wire-level error type shared by executors and segment workers.

use std::fmt;

/// Error produced by one network exchange (curl failure, HTTP status,
/// storage failure, or cancellation). Kept structured so the retry layer
/// can classify it before it is flattened into a result message.
#[derive(Debug)]
pub enum TransferError {
    /// libcurl reported an error (timeout, connection, TLS, ...).
    Curl(curl::Error),
    /// HTTP terminal status outside [200, 300).
    Http(u32),
    /// Transfer completed but fewer bytes arrived than the range length
    /// (e.g. server closed early).
    Partial { expected: u64, received: u64 },
    /// Local file or mapping write failed. Not retried.
    Storage(String),
    /// Invalid input or policy violation (bad URL, forbidden FTP method,
    /// missing configuration, rename conflict). Carries the full message.
    Validation(String),
    /// The transfer was aborted by a cancellation signal.
    Cancelled,
}

impl TransferError {
    /// Map a curl perform() failure, folding callback aborts into
    /// [`TransferError::Cancelled`] and smuggled storage errors into
    /// [`TransferError::Storage`].
    pub fn from_curl(e: curl::Error, storage_error: Option<String>) -> Self {
        if e.is_aborted_by_callback() {
            return TransferError::Cancelled;
        }
        if e.is_write_error() {
            if let Some(msg) = storage_error {
                return TransferError::Storage(msg);
            }
        }
        TransferError::Curl(e)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Curl(e) => write!(f, "Network error: {}", e),
            TransferError::Http(code) => write!(f, "HTTP error: status code {}", code),
            TransferError::Partial { expected, received } => write!(
                f,
                "Network error: partial transfer, expected {} bytes, got {}",
                expected, received
            ),
            TransferError::Storage(msg) => write!(f, "File operation failed: {}", msg),
            TransferError::Validation(msg) => write!(f, "{}", msg),
            TransferError::Cancelled => write!(f, "Operation canceled"),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Curl(e) => Some(e),
            _ => None,
        }
    }
}
