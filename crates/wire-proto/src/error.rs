use std::io;

/// Failure modes of the manager-worker wire protocol.
///
/// Callers classify a `WireError` into one of the three transfer-error
/// kinds (worker failure / app failure / manager failure) the same way
/// the engine crate downcasts a `BackendError` out of an `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o error talking to worker: {0}")]
    Io(#[from] io::Error),

    #[error("malformed protocol line: {line:?}")]
    Malformed { line: String },

    #[error("connection closed before a complete message was read")]
    UnexpectedEof,

    #[error("timed out waiting for worker")]
    Timeout,

    #[error("remote reported {what} missing: {detail}")]
    RemoteMissing { what: &'static str, detail: String },
}

impl WireError {
    /// True if this failure means the link itself is no longer usable and
    /// the worker should be dropped, rather than just the one operation.
    pub fn is_link_fatal(&self) -> bool {
        matches!(
            self,
            WireError::Io(_) | WireError::UnexpectedEof | WireError::Timeout | WireError::Malformed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
