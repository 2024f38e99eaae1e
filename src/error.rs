use thiserror::Error;

use crate::operation::OperationResult;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Server Error: [{errno}] {message}")]
    ServerError { errno: u32, message: String },

    /// An API was called in a lifecycle state that does not allow it
    #[error("Operation state error: {0}")]
    OperationStateError(String),

    /// Work could not be scheduled on the thread that owns the connection
    #[error("Failed to dispatch work onto the event loop")]
    DispatchError,

    /// The row stream was read outside the consumer window
    #[error("Row stream access error: {0}")]
    StreamAccessError(String),

    #[error("Bad config error: {0}")]
    BadConfigError(String),

    #[error("Operation {result}: [{errno}] {message}")]
    OperationFailed {
        result: OperationResult,
        errno: u32,
        message: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Library bug: {0}")]
    LibraryBug(color_eyre::eyre::Report),
}

impl Error {
    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Error::OperationStateError(msg.into())
    }

    pub(crate) fn bug(msg: &'static str) -> Self {
        Error::LibraryBug(color_eyre::eyre::eyre!(msg))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
