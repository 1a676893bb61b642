//! Connection-pooling session core for CQL (Cassandra-family) clusters.
//!
//! The driver core revolves around the [Session](crate::Session): the
//! per-process object that owns a per-host connection pool, recycles idle
//! connections through a trashcan buffer, and turns each request into a
//! `(connection, stream)` pair according to a pluggable load balancing
//! policy.
//!
//! # Connecting
//! A `Session` is created by specifying a few known nodes and connecting
//! to them:
//!
//! ```rust,no_run
//! use cql_session::{Session, SessionBuilder};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let session: Session = SessionBuilder::new()
//!         .known_node("127.0.0.1:9042".parse::<std::net::SocketAddr>()?)
//!         .known_node("1.2.3.4:9876".parse::<std::net::SocketAddr>()?)
//!         .build()
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Making requests
//! After successfully connecting to the cluster, requests can be
//! dispatched:
//!
//! ```rust,no_run
//! # use cql_session::Session;
//! # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
//! session.query("INSERT INTO ks.tab (a, b) VALUES (2, 'text')").await?;
//!
//! let prepared = session.prepare("SELECT b FROM ks.tab WHERE a = ?").await?;
//! let result = session.execute(&prepared, &[Some(2i32.to_be_bytes().to_vec())]).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The session does not parse statements, decode result rows, or enforce
//! request timeouts; those belong to the layers around it.

pub mod client;
pub mod cluster;
pub mod errors;
pub mod frame;
pub mod network;
pub mod policies;
pub mod statement;

pub use client::session::{PoolingOptions, Session, SessionConfig, SessionListener};
pub use client::session_builder::SessionBuilder;

pub use cluster::{Endpoint, Host, HostDistance};
pub use network::{ConnectionFactory, Credentials, QueryResult};
pub use policies::load_balancing::{LoadBalancingPolicy, QueryPlan, RoundRobinPolicy};
pub use statement::{Consistency, PreparedStatement, Statement};
