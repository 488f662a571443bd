//! Error types for fwimage-core
//!
//! Every fallible operation returns [`Error`]. Layers that wrap a lower
//! failure add a prefix with [`ResultExt::context`], and callers recover the
//! underlying category with [`Error::kind`] no matter how many prefixes were
//! added on the way up.

use thiserror::Error;

/// Abstract error category, independent of the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Requested id, index, type or checksum is absent
    NotFound,
    /// Operation is not valid in the current state
    NotSupported,
    /// Malformed field or unrecognized value
    InvalidData,
    /// Structural violation of the input
    InvalidFile,
    /// Contract violation detected at runtime
    Internal,
    /// Nothing was asked of the operation
    NothingToDo,
    /// Underlying I/O failure
    Io,
}

/// fwimage-core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Requested item was not found
    #[error("{0}")]
    NotFound(String),

    /// Operation not supported
    #[error("{0}")]
    NotSupported(String),

    /// Invalid data
    #[error("{0}")]
    InvalidData(String),

    /// Invalid file
    #[error("{0}")]
    InvalidFile(String),

    /// Internal error
    #[error("{0}")]
    Internal(String),

    /// Nothing to do
    #[error("{0}")]
    NothingToDo(String),

    /// I/O error
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Manifest XML could not be read
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Lower error with a prefixed description
    #[error("{context}: {source}")]
    Context {
        /// What was being done
        context: String,
        /// Original cause
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an error of the given kind
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match kind {
            ErrorKind::NotFound => Self::NotFound(msg),
            ErrorKind::NotSupported => Self::NotSupported(msg),
            ErrorKind::InvalidData => Self::InvalidData(msg),
            ErrorKind::InvalidFile => Self::InvalidFile(msg),
            ErrorKind::Internal => Self::Internal(msg),
            ErrorKind::NothingToDo => Self::NothingToDo(msg),
            ErrorKind::Io => Self::Io(std::io::Error::other(msg)),
        }
    }

    /// Category of this error, looking through any context prefixes
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::InvalidData(_) | Self::Xml(_) => ErrorKind::InvalidData,
            Self::InvalidFile(_) => ErrorKind::InvalidFile,
            Self::Internal(_) => ErrorKind::Internal,
            Self::NothingToDo(_) => ErrorKind::NothingToDo,
            Self::Io(_) => ErrorKind::Io,
            Self::Context { source, .. } => source.kind(),
        }
    }

    /// Prefix this error with a description of the failing operation
    pub fn prefix(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result type for fwimage-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Adds context prefixes to fallible results
pub trait ResultExt<T> {
    /// Prefix any error with `context`
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Prefix any error with a lazily built context
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().prefix(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().prefix(f()))
    }
}
