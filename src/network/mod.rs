//! This module holds entities that represent connections to the cluster
//! and management over those connections: a single CQL connection with its
//! stream multiplexer, the per-endpoint connection pool with its counters,
//! and the trashcan buffer for soft-retired connections.

mod connection;
mod connection_pool;
mod stream;
mod trashcan;

pub use connection::{
    Connection, ConnectionConfig, ConnectionFactory, ConnectionId, Credentials, ErrorReceiver,
    QueryResult, TcpConnectionFactory,
};
pub use stream::StreamId;

pub(crate) use connection::StreamGuard;
#[cfg(test)]
pub(crate) use connection::test_utils;
pub(crate) use connection_pool::{ConnectionCounters, ConnectionPool, ConnectionsCollection};
pub(crate) use trashcan::Trashcan;
