use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::connection::{Connection, ConnectionId};
use crate::cluster::Endpoint;

/// Connections of a single endpoint, keyed by connection id.
///
/// Backed by a sharded map, so concurrent dispatches touch disjoint shards
/// instead of one collection-wide lock. Iteration is always over a
/// snapshot: the decision table of dispatch mutates the collection while
/// walking it.
#[derive(Debug, Default)]
pub(crate) struct ConnectionsCollection {
    conns: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionsCollection {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts the connection, rejecting duplicate ids.
    pub(crate) fn try_add(&self, id: ConnectionId, conn: Arc<Connection>) -> bool {
        match self.conns.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(conn);
                true
            }
        }
    }

    pub(crate) fn try_get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.conns.get(&id).map(|conn| conn.value().clone())
    }

    /// Removes the connection, returning it if it was present. Only one
    /// caller wins a concurrent erase of the same id.
    pub(crate) fn try_erase(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.conns.remove(&id).map(|(_, conn)| conn)
    }

    pub(crate) fn len(&self) -> usize {
        self.conns.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Point-in-time copy of the membership. Connections added or removed
    /// while the snapshot is walked are not reflected in it.
    pub(crate) fn snapshot(&self) -> Vec<(ConnectionId, Arc<Connection>)> {
        self.conns
            .iter()
            .map(|kv| (*kv.key(), kv.value().clone()))
            .collect()
    }
}

/// Concurrent mapping of endpoints to their connection collections.
#[derive(Debug, Default)]
pub(crate) struct ConnectionPool {
    collections: DashMap<Endpoint, Arc<ConnectionsCollection>>,
}

impl ConnectionPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the collection for the endpoint, installing an empty one on
    /// first use. The install race has a single winner; every caller
    /// observes the same instance.
    pub(crate) fn get_or_install(&self, endpoint: Endpoint) -> Arc<ConnectionsCollection> {
        self.collections
            .entry(endpoint)
            .or_insert_with(|| Arc::new(ConnectionsCollection::new()))
            .value()
            .clone()
    }

    /// Total number of pooled connections, across all endpoints.
    pub(crate) fn size(&self) -> usize {
        self.collections.iter().map(|kv| kv.value().len()).sum()
    }

    pub(crate) fn snapshot(&self) -> Vec<(Endpoint, Arc<ConnectionsCollection>)> {
        self.collections
            .iter()
            .map(|kv| (*kv.key(), kv.value().clone()))
            .collect()
    }
}

/// Per-endpoint connection counters, bounded by the per-host cap.
///
/// A connection is counted from the moment its allocation begins until it
/// is truly freed, including time spent in the trashcan; the cap is
/// thereby honored globally per endpoint. Every increment has exactly one
/// matched decrement.
#[derive(Debug, Default)]
pub(crate) struct ConnectionCounters {
    counters: DashMap<Endpoint, Arc<AtomicUsize>>,
}

impl ConnectionCounters {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserves one connection slot under `cap`. Returns false without
    /// side effects when the cap is already reached.
    pub(crate) fn try_increment(&self, endpoint: Endpoint, cap: usize) -> bool {
        let counter = self.counter(endpoint);
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < cap).then_some(current + 1)
            })
            .is_ok()
    }

    pub(crate) fn decrement(&self, endpoint: Endpoint) {
        let counter = self.counter(endpoint);
        let previous = counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "counter for {endpoint} went negative");
    }

    pub(crate) fn get(&self, endpoint: Endpoint) -> usize {
        self.counter(endpoint).load(Ordering::Acquire)
    }

    fn counter(&self, endpoint: Endpoint) -> Arc<AtomicUsize> {
        self.counters
            .entry(endpoint)
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .value()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::test_utils::connected_pair;

    fn endpoint(n: u8) -> Endpoint {
        format!("127.0.0.{n}:9042")
            .parse::<std::net::SocketAddr>()
            .unwrap()
            .into()
    }

    #[tokio::test]
    async fn collection_rejects_duplicate_ids() {
        let collection = ConnectionsCollection::new();
        let (conn, _err, _server) = connected_pair(endpoint(1));

        assert!(collection.try_add(conn.id(), conn.clone()));
        assert!(!collection.try_add(conn.id(), conn.clone()));
        assert_eq!(collection.len(), 1);

        let erased = collection.try_erase(conn.id()).unwrap();
        assert_eq!(erased.id(), conn.id());
        assert!(collection.try_erase(conn.id()).is_none());
        assert!(collection.is_empty());
    }

    #[tokio::test]
    async fn collection_lookup_returns_the_inserted_connection() {
        let collection = ConnectionsCollection::new();
        let (conn, _err, _server) = connected_pair(endpoint(1));
        collection.try_add(conn.id(), conn.clone());

        assert_eq!(collection.try_get(conn.id()).unwrap().id(), conn.id());
        assert!(collection.try_get(ConnectionId::new_v4()).is_none());
    }

    #[test]
    fn get_or_install_converges_under_concurrency() {
        let pool = Arc::new(ConnectionPool::new());
        let ep = endpoint(7);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || Arc::as_ptr(&pool.get_or_install(ep)) as usize)
            })
            .collect();

        let mut pointers: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        pointers.dedup();
        assert_eq!(pointers.len(), 1, "all callers must observe one instance");
    }

    #[test]
    fn counter_respects_the_cap() {
        let counters = ConnectionCounters::new();
        let ep = endpoint(1);

        assert!(counters.try_increment(ep, 2));
        assert!(counters.try_increment(ep, 2));
        assert!(!counters.try_increment(ep, 2));
        assert_eq!(counters.get(ep), 2);

        counters.decrement(ep);
        assert!(counters.try_increment(ep, 2));
    }

    #[test]
    fn increment_decrement_round_trip_is_neutral() {
        let counters = ConnectionCounters::new();
        let ep = endpoint(2);

        assert_eq!(counters.get(ep), 0);
        assert!(counters.try_increment(ep, 8));
        counters.decrement(ep);
        assert_eq!(counters.get(ep), 0);
    }

    #[test]
    fn counters_are_independent_per_endpoint() {
        let counters = ConnectionCounters::new();
        assert!(counters.try_increment(endpoint(1), 1));
        assert!(counters.try_increment(endpoint(2), 1));
        assert!(!counters.try_increment(endpoint(1), 1));
    }
}
