//! Contains the `Error` and `Result` types that `tassandra` uses.

use std::sync::Arc;

use thiserror::Error;

use crate::request::RequestSnapshot;

/// The result type for all methods that can return an error in the `tassandra` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `tassandra` crate. The inner [`ErrorKind`] is wrapped in an
/// `Arc` to allow the errors to be cloned, which is necessary because the same error may need to
/// be delivered to more than one pending callback when a connection closes.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Arc<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Arc::new(kind),
        }
    }

    /// The connection to a node was closed, either by a transport/protocol failure or because the
    /// pool itself was shut down.
    pub(crate) fn connection_shutdown(host: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionShutdown { host: host.into() })
    }

    /// A request's timeout schedule was exhausted before a response arrived for the current
    /// attempt.
    pub(crate) fn request_timeout() -> Self {
        Self::new(ErrorKind::RequestTimeout)
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol {
            message: message.into(),
        })
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument {
            message: message.into(),
        })
    }

    /// Whether this error represents a lost or shut-down connection, as opposed to a
    /// backend-rejected query. Used by the pool to decide whether an attempt failed in a way
    /// that's safe to retry on another connection regardless of idempotence.
    pub(crate) fn is_connection_error(&self) -> bool {
        matches!(
            *self.kind,
            ErrorKind::ConnectionShutdown { .. } | ErrorKind::RequestTimeout
        )
    }

    /// Annotates this error with the retry history of the request that ultimately failed. Called
    /// once, when a request's retry budget is exhausted; this is *not* a running string
    /// concatenation, just the final `"Request, K of M retries"` snapshot.
    pub(crate) fn with_retry_history(self, snapshot: &RequestSnapshot) -> Self {
        Self::new(ErrorKind::RetriesExhausted {
            tries: snapshot.tries,
            max_tries: snapshot.max_tries,
            retry_history: snapshot.to_string(),
            cause: self,
        })
    }
}

/// The types of errors that can occur.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The connection to `host` was closed (transport failure, protocol violation, startup
    /// rejection, or an explicit `Pool::close`/`Connection::close`). All callbacks pending on
    /// that connection at the moment it closed receive a clone of this variant.
    #[error("Connection to {host} closed")]
    ConnectionShutdown {
        /// The host the connection was to.
        host: String,
    },

    /// The current attempt's timer fired before a response arrived.
    #[error("Request Timeout Exception")]
    RequestTimeout,

    /// A malformed header/body, an unknown opcode during startup, or an unexpected message type
    /// for the connection's current state.
    #[error("protocol error: {message}")]
    Protocol {
        /// Human-readable description of the violation.
        message: String,
    },

    /// The server responded to a query with an `ERROR` frame.
    #[error("server returned an error (code {code:#06x}): {message}")]
    Backend {
        /// The CQL error code from the `ERROR` body.
        code: i32,
        /// The error message from the `ERROR` body.
        message: String,
    },

    /// Invalid arguments were supplied when constructing a `Cluster` or submitting a query.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of what was invalid.
        message: String,
    },

    /// A request's retry budget was exhausted. Wraps the error from the final attempt.
    #[error("{cause}: Request, {tries} of {max_tries} retries")]
    RetriesExhausted {
        /// Number of attempts made.
        tries: u32,
        /// Size of the retry budget (`timeouts.len()`).
        max_tries: u32,
        /// Rendered `Display` form of the request at the time it gave up, kept for operators who
        /// grep logs for the `"Request, K of M retries"` string.
        retry_history: String,
        /// The error from the attempt that exhausted the budget.
        #[source]
        cause: Error,
    },

    /// An I/O error occurred while connecting, reading, or writing.
    #[error("IO error: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Io(Arc::new(err)))
    }
}
