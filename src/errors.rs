//! Error taxonomy of the session core.
//!
//! Per-host failures (`ConnectionError`) are recovered locally by moving to
//! the next host in the query plan; only when the plan is exhausted do they
//! surface, aggregated in [NoHostAvailableError]. Failures of an already
//! dispatched request arrive as [RequestError] through the request future.

use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use thiserror::Error;

use crate::cluster::Endpoint;
use crate::frame::response::{DbError, ResponseOpcode};
use crate::network::StreamId;

/// Error at the framing layer: malformed or truncated frames, unknown
/// opcodes, transport failures while reading or writing a frame.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameError {
    #[error("unexpected end of buffer: needed {expected} bytes, {actual} remain")]
    UnexpectedEndOfBuffer { expected: usize, actual: usize },

    #[error("value too long for its length prefix: {0}")]
    ValueTooLong(usize),

    #[error("invalid UTF-8 string: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("unsupported protocol version byte: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("unknown response opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("unknown result kind: {0:#06x}")]
    UnknownResultKind(i32),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Io(Arc::new(err))
    }
}

impl From<num_enum::TryFromPrimitiveError<ResponseOpcode>> for FrameError {
    fn from(err: num_enum::TryFromPrimitiveError<ResponseOpcode>) -> Self {
        FrameError::UnknownOpcode(err.number)
    }
}

/// A fatal, connection-wide failure.
///
/// Once reported, the connection never returns to service; it may only be
/// drained and closed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BrokenConnectionError {
    #[error("failed to read a frame: {0}")]
    FrameError(#[source] FrameError),

    #[error("failed to write a frame: {0}")]
    WriteError(Arc<std::io::Error>),

    #[error("received a response with unexpected stream id {0}")]
    UnexpectedStreamId(StreamId),

    #[error("stream id {0} used for two requests at once")]
    StreamIdReused(StreamId),

    #[error("connection worker channel closed")]
    ChannelError,
}

/// Error which prevented a connection to a single endpoint from being
/// established or allocated.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("connect timeout")]
    ConnectTimeout,

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Broken(#[from] BrokenConnectionError),

    /// The per-endpoint connection cap was reached while every pooled
    /// connection was saturated.
    #[error("reached maximum number of connections ({0}) to the host")]
    TooManyConnections(usize),
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::Io(Arc::new(err))
    }
}

/// Error of a single dispatched request, delivered through its future.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RequestError {
    /// The database processed the request and reported an error. The
    /// connection stays healthy.
    #[error("database returned an error: code {:#06x}, message: {}", .0.code, .0.message)]
    DbError(DbError),

    #[error(transparent)]
    FrameError(#[from] FrameError),

    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    #[error("received unexpected response from the server: {0:?}")]
    UnexpectedResponse(ResponseOpcode),
}

/// The query plan was exhausted with zero viable hosts.
///
/// Carries every endpoint that was actually tried together with the reason
/// it was rejected. Hosts which were down and therefore skipped are not
/// listed.
#[derive(Error, Debug)]
pub struct NoHostAvailableError {
    tried: Vec<(Endpoint, ConnectionError)>,
}

impl NoHostAvailableError {
    pub(crate) fn new(tried: Vec<(Endpoint, ConnectionError)>) -> Self {
        Self { tried }
    }

    /// Endpoints that were tried, with the per-endpoint failure reason.
    pub fn tried(&self) -> &[(Endpoint, ConnectionError)] {
        &self.tried
    }
}

impl fmt::Display for NoHostAvailableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tried.is_empty() {
            write!(f, "no host is available according to the load balancing policy (empty query plan)")
        } else {
            write!(
                f,
                "no host is available according to the load balancing policy; tried: {}",
                self.tried
                    .iter()
                    .map(|(endpoint, err)| format!("{endpoint}: {err}"))
                    .join(", ")
            )
        }
    }
}

/// Error returned by the dispatch operations (`query`, `prepare`,
/// `execute`).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum QueryError {
    #[error(transparent)]
    NoHostAvailable(#[from] NoHostAvailableError),

    /// The sole viable endpoint reached its connection cap with every
    /// connection saturated. When other hosts remain in the plan this is
    /// recovered locally and never surfaces.
    #[error("reached maximum number of connections ({cap}) to host {endpoint} and all of them are busy")]
    TooManyConnectionsPerHost { endpoint: Endpoint, cap: usize },

    #[error("session is defunct: no host is reachable")]
    SessionDefunct,

    /// Dispatch could not even start, e.g. the session was closed.
    #[error("library error: {0}")]
    Library(String),

    /// `execute` was routed to a connection that has never prepared the
    /// statement.
    #[error("prepared statement id is not known to the chosen connection")]
    UnknownPreparedStatement,

    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Error that occurred during session creation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum NewSessionError {
    /// There needs to be at least one node to connect to.
    #[error("empty known nodes list")]
    EmptyKnownNodesList,

    #[error(transparent)]
    NoHostAvailable(NoHostAvailableError),

    #[error("reached maximum number of connections ({cap}) to host {endpoint} and all of them are busy")]
    TooManyConnectionsPerHost { endpoint: Endpoint, cap: usize },

    #[error("library error: {0}")]
    Library(String),
}

impl From<QueryError> for NewSessionError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::NoHostAvailable(e) => NewSessionError::NoHostAvailable(e),
            QueryError::TooManyConnectionsPerHost { endpoint, cap } => {
                NewSessionError::TooManyConnectionsPerHost { endpoint, cap }
            }
            other => NewSessionError::Library(other.to_string()),
        }
    }
}
