use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::connection::Connection;
use crate::cluster::Endpoint;

/// Soft-retirement buffer for connections evicted from the pool.
///
/// A connection that just fell below the idle watermark may be needed
/// again moments later; parking it here instead of closing it absorbs such
/// usage spikes. Deposits older than the TTL are reaped by a timer task
/// owned by the session, which also performs the counter decrement for
/// each reaped connection.
#[derive(Debug)]
pub(crate) struct Trashcan {
    entries: DashMap<Endpoint, VecDeque<TrashedConnection>>,
    ttl: Duration,
}

#[derive(Debug)]
struct TrashedConnection {
    conn: Arc<Connection>,
    trashed_at: Instant,
}

impl Trashcan {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub(crate) fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Deposits a connection, stamped with now. Non-blocking.
    pub(crate) fn put(&self, conn: Arc<Connection>) {
        trace!("[{}] Moving connection {} to trashcan", conn.endpoint(), conn.id());
        self.entries
            .entry(conn.endpoint())
            .or_default()
            .push_back(TrashedConnection {
                conn,
                trashed_at: Instant::now(),
            });
    }

    /// Takes back the most recently deposited connection for the endpoint.
    ///
    /// The caller must verify the connection is still healthy before
    /// reusing it.
    pub(crate) fn recycle(&self, endpoint: Endpoint) -> Option<Arc<Connection>> {
        let mut bucket = self.entries.get_mut(&endpoint)?;
        let entry = bucket.pop_back()?;
        trace!("[{}] Recycled connection {} from trashcan", endpoint, entry.conn.id());
        Some(entry.conn)
    }

    /// Removes every deposit older than the TTL. The returned connections
    /// are no longer tracked here; the caller closes them and settles the
    /// counters.
    pub(crate) fn reap_expired(&self, now: Instant) -> Vec<Arc<Connection>> {
        let mut reaped = Vec::new();
        for mut bucket in self.entries.iter_mut() {
            while let Some(oldest) = bucket.front() {
                if now.duration_since(oldest.trashed_at) < self.ttl {
                    break;
                }
                // Entries are deposited in time order, so the front is
                // always the oldest.
                let entry = bucket.pop_front().expect("front was just observed");
                reaped.push(entry.conn);
            }
        }
        reaped
    }

    /// Empties the trashcan unconditionally. Used by session close.
    pub(crate) fn drain_all(&self) -> Vec<Arc<Connection>> {
        let mut drained = Vec::new();
        for mut bucket in self.entries.iter_mut() {
            drained.extend(bucket.drain(..).map(|entry| entry.conn));
        }
        drained
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.iter().all(|bucket| bucket.is_empty())
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
    async fn recycle_returns_the_most_recent_deposit() {
        let trashcan = Trashcan::new(Duration::from_secs(10));
        let (first, _e1, _s1) = connected_pair(endpoint(1));
        let (second, _e2, _s2) = connected_pair(endpoint(1));

        trashcan.put(first.clone());
        trashcan.put(second.clone());

        assert_eq!(trashcan.recycle(endpoint(1)).unwrap().id(), second.id());
        assert_eq!(trashcan.recycle(endpoint(1)).unwrap().id(), first.id());
        assert!(trashcan.recycle(endpoint(1)).is_none());
    }

    #[tokio::test]
    async fn recycle_is_per_endpoint() {
        let trashcan = Trashcan::new(Duration::from_secs(10));
        let (conn, _err, _server) = connected_pair(endpoint(1));
        trashcan.put(conn);

        assert!(trashcan.recycle(endpoint(2)).is_none());
        assert!(trashcan.recycle(endpoint(1)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reap_takes_only_expired_entries() {
        let trashcan = Trashcan::new(Duration::from_secs(10));
        let (old, _e1, _s1) = connected_pair(endpoint(1));
        let (fresh, _e2, _s2) = connected_pair(endpoint(1));

        trashcan.put(old.clone());
        tokio::time::advance(Duration::from_secs(7)).await;
        trashcan.put(fresh.clone());
        tokio::time::advance(Duration::from_secs(4)).await;

        // 11s for `old`, 4s for `fresh`.
        let reaped = trashcan.reap_expired(Instant::now());
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id(), old.id());

        assert_eq!(trashcan.recycle(endpoint(1)).unwrap().id(), fresh.id());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_at_exactly_ttl_is_reaped() {
        let trashcan = Trashcan::new(Duration::from_secs(10));
        let (conn, _err, _server) = connected_pair(endpoint(1));
        trashcan.put(conn);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(trashcan.reap_expired(Instant::now()).len(), 1);
        assert!(trashcan.is_empty());
    }

    #[tokio::test]
    async fn drain_empties_every_bucket() {
        let trashcan = Trashcan::new(Duration::from_secs(10));
        let (a, _e1, _s1) = connected_pair(endpoint(1));
        let (b, _e2, _s2) = connected_pair(endpoint(2));
        trashcan.put(a);
        trashcan.put(b);

        assert_eq!(trashcan.drain_all().len(), 2);
        assert!(trashcan.is_empty());
    }
}
