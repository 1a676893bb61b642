use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

/// Address of a single cluster node.
///
/// This is the stable identity of a node: pools, counters and the trashcan
/// are all keyed by it.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Endpoint {
    address: SocketAddr,
}

impl Endpoint {
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn ip(&self) -> IpAddr {
        self.address.ip()
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(address: SocketAddr) -> Self {
        Self::new(address)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Classification of a host assigned by the load balancing policy.
///
/// The distance parameterizes pool sizing: local hosts get larger pools
/// than remote ones, and ignored hosts get no connections at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDistance {
    Local,
    Remote,
    Ignored,
}

impl HostDistance {
    /// Index into per-distance configuration tables.
    ///
    /// Returns `None` for [HostDistance::Ignored], which has no pool
    /// parameters.
    pub(crate) fn index(self) -> Option<usize> {
        match self {
            HostDistance::Local => Some(0),
            HostDistance::Remote => Some(1),
            HostDistance::Ignored => None,
        }
    }
}

/// A cluster node record.
///
/// The liveness flag is maintained by an external component (topology
/// watcher, gossip listener); the session reads it but never mutates it
/// on its own.
#[derive(Debug)]
pub struct Host {
    endpoint: Endpoint,
    up: AtomicBool,
}

impl Host {
    /// Creates a host record, initially considered up.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            up: AtomicBool::new(true),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    /// Marks the host up or down. Intended for the component that tracks
    /// cluster liveness.
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Relaxed);
    }

    /// Whether the host is worth contacting at all.
    ///
    /// Hosts which are down are skipped by dispatch without being recorded
    /// as tried.
    pub fn is_considerably_up(&self) -> bool {
        self.is_up()
    }
}

impl Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint)
    }
}
