//! Contains the `Error` and `Result` types that `pgfanout` uses.

use std::{fmt, sync::Arc};

use thiserror::Error;

/// The result type for all methods that can return an error in the `pgfanout` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while fanning a call out to a cluster. The inner
/// [`ErrorKind`] is boxed to keep the type small, and the partition whose
/// connection produced the error is recorded when known.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    partition: Option<String>,
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.kind.as_ref())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.partition {
            Some(p) => write!(f, "{} (partition {})", self.kind, p),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            partition: None,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        ErrorKind::Config {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn split(message: impl Into<String>) -> Self {
        ErrorKind::Split {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn connection(message: impl Into<String>) -> Self {
        ErrorKind::Connection {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        ErrorKind::Protocol {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn canceled() -> Self {
        ErrorKind::Canceled.into()
    }

    pub(crate) fn timeout(phase: TimeoutPhase) -> Self {
        ErrorKind::Timeout(phase).into()
    }

    pub(crate) fn busy(cluster: impl Into<String>) -> Self {
        ErrorKind::Busy {
            cluster: cluster.into(),
        }
        .into()
    }

    /// Attaches the partition connect string the error originated on.
    pub(crate) fn with_partition(mut self, partition: impl Into<String>) -> Self {
        if self.partition.is_none() {
            self.partition = Some(partition.into());
        }
        self
    }

    /// The partition the error originated on, if it can be attributed to one.
    pub fn partition(&self) -> Option<&str> {
        self.partition.as_deref()
    }

    /// Whether this error was produced by a host cancellation request.
    pub fn is_canceled(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Canceled)
    }

    /// Whether this error is a connect or query timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Timeout(_))
    }

    /// Whether this error was raised by a backend rather than the engine itself.
    pub fn is_remote(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Remote(_))
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(_) | ErrorKind::Connection { .. }
        )
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io(Arc::new(err)))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The cluster metadata or a call descriptor is invalid. Raised before any
    /// network traffic happens.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A split-array or hash-routing contract was violated.
    #[error("invalid routing: {message}")]
    Split { message: String },

    /// Connecting to or logging into a partition failed.
    #[error("connection failed: {message}")]
    Connection { message: String },

    /// A backend violated the wire protocol or returned an unexpected result
    /// shape.
    #[error("protocol violation: {message}")]
    Protocol { message: String },

    /// A backend answered the query with an error.
    #[error(transparent)]
    Remote(RemoteError),

    /// A connect or query deadline expired.
    #[error("{0} timeout expired")]
    Timeout(TimeoutPhase),

    /// The host asked for the call to be aborted.
    #[error("query canceled on user request")]
    Canceled,

    /// A call was attempted on a cluster that is already executing one.
    #[error("nested call on cluster \"{cluster}\"")]
    Busy { cluster: String },

    /// Wrapper around a `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The engine reached a state it should never be in.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// An error returned by a backend, surfaced verbatim and tagged with the
/// function that was executing when it arrived.
#[derive(Clone, Debug)]
pub struct RemoteError {
    /// The fanned-out function that was executing.
    pub function: String,
    /// Severity reported by the backend, e.g. `ERROR` or `FATAL`.
    pub severity: String,
    /// SQLSTATE code.
    pub code: String,
    /// Primary error message.
    pub message: String,
    /// Optional detail field.
    pub detail: Option<String>,
    /// Optional hint field.
    pub hint: Option<String>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "remote error in {}: {} {}: {}",
            self.function, self.severity, self.code, self.message
        )
    }
}

impl std::error::Error for RemoteError {}

/// Which per-connection deadline expired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// The connect deadline, covering socket connection and login.
    Connect,
    /// The query deadline, covering submission through result drain.
    Query,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("connect"),
            Self::Query => f.write_str("query"),
        }
    }
}
