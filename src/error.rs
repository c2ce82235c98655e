//! Error types shared by every daemon.
//!
//! A failed promise stores one of these and re-raises it to every observer,
//! so the enum is `Clone` and each variant carries everything a consumer
//! needs: the kind, an optional numeric code, and a message.

use thiserror::Error;

/// Errors produced by the dispatch subsystem.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// A terminal promise was set a second time with the strict flag on.
    #[error("promise already set")]
    AlreadySet,

    /// Module load or symbol lookup failed; carries the loader's message.
    #[error("module load failed: {0}")]
    Load(String),

    /// Host name resolution failed.
    #[error("name resolution failed: {0}")]
    Resolve(String),

    /// The database driver reported a failure; retriable.
    #[error("driver error {code}: {message}")]
    Driver { code: u32, message: String },

    /// A load query returned zero rows.
    #[error("no rows returned")]
    NoData,

    /// A database call was made while the worker pool is disabled.
    #[error("database support is not enabled")]
    NotEnabled,

    /// An enqueue arrived after the daemon began shutting down.
    #[error("daemon is shutting down")]
    ShuttingDown,

    /// An I/O or OS call failed.
    #[error("system error: {message}")]
    System { code: Option<i32>, message: String },
}

impl Error {
    /// Numeric code carried by driver and system errors, if any.
    pub fn code(&self) -> Option<u32> {
        match self {
            Error::Driver { code, .. } => Some(*code),
            Error::System { code, .. } => code.map(|c| c as u32),
            _ => None,
        }
    }

    /// True for errors the query worker is allowed to retry.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Driver { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::System {
            code: err.raw_os_error(),
            message: err.to_string(),
        }
    }
}
