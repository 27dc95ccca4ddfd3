//! Error types shared by every layer of the server
//!
//! [`Error`] is `Clone` so a single load outcome can be handed to every
//! caller waiting on the same in-flight load.

use crate::scope::ScopeId;
use scopecrab::CellError;
use std::sync::Arc;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Input or configuration is malformed
    NotValid,
    /// Nothing was found for the requested scope or name
    NotFound,
    /// A required value is missing or blank
    Empty,
    /// An internal invariant broke
    Fatal,
    /// A backend could not be reached in time
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("not valid: {0}")]
    NotValid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("empty: {0}")]
    Empty(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("loading configuration for {scope} failed: {source}")]
    LoadFailed {
        scope: ScopeId,
        #[source]
        source: Arc<Error>,
    },

    #[error("storage backend: {0}")]
    Backend(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotValid(_) => ErrorKind::NotValid,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Empty(_) => ErrorKind::Empty,
            Error::Fatal(_) => ErrorKind::Fatal,
            Error::Unavailable(_) | Error::Backend(_) => ErrorKind::Unavailable,
            Error::LoadFailed { source, .. } => source.kind(),
        }
    }

    /// Wrap `source` as the failed load of `scope`
    pub fn load_failed(scope: ScopeId, source: Error) -> Self {
        Error::LoadFailed {
            scope,
            source: Arc::new(source),
        }
    }
}

impl From<CellError> for Error {
    fn from(err: CellError) -> Self {
        match err {
            CellError::NegativeQuantity(_)
            | CellError::InvalidRateLimit(_)
            | CellError::UnknownPeriod(_) => Error::NotValid(err.to_string()),
            CellError::Store(msg) => Error::Backend(msg),
            CellError::Internal(msg) => Error::Fatal(msg),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
