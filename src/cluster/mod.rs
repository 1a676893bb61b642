//! This module holds entities that represent the cluster as seen by the
//! session: endpoints, host records and their policy-assigned distance.
//! Host discovery and topology change notifications are maintained by an
//! external component; the session only reads host state.

mod host;

pub use host::{Endpoint, Host, HostDistance};
