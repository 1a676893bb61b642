//! Pluggable policies consulted by the session.
//!
//! Only load balancing lives here for now; reconnection and retry
//! policies plug in at the same level.

pub mod load_balancing;
