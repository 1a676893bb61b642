//! This module holds entities that represent the driver's client of the
//! cluster:
//! - [Session](session::Session) - the main entity of the driver. It owns
//!   the connection pool, the trashcan and the per-endpoint counters, and
//!   turns each request into a `(connection, stream)` pair.
//! - [SessionBuilder](session_builder::SessionBuilder) - just a convenient
//!   builder for a `Session`.

pub mod session;
pub mod session_builder;

pub use session::{PoolingOptions, Session, SessionConfig, SessionListener};
pub use session_builder::SessionBuilder;
