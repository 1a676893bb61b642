//! `Session` is the main object of the driver core.\
//! It multiplexes CQL requests over a per-host pool of connections,
//! selecting hosts according to the load balancing policy.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::cluster::{Endpoint, Host, HostDistance};
use crate::errors::{ConnectionError, NewSessionError, NoHostAvailableError, QueryError};
use crate::network::{
    Connection, ConnectionConfig, ConnectionCounters, ConnectionFactory, ConnectionPool,
    ConnectionsCollection, Credentials, ErrorReceiver, QueryResult, StreamGuard,
    TcpConnectionFactory, Trashcan,
};
use crate::policies::load_balancing::{LoadBalancingPolicy, QueryPlan, RoundRobinPolicy};
use crate::statement::{PreparedStatement, Statement};

/// Default soft-retirement delay before a trashed connection is truly
/// closed.
pub const DEFAULT_TRASHCAN_TTL: Duration = Duration::from_secs(10);

/// Pool sizing parameters, per host distance.
///
/// Each option has a LOCAL and a REMOTE value; IGNORED hosts get no
/// connections at all.
#[derive(Debug, Clone)]
pub struct PoolingOptions {
    core_connections_per_host: [usize; 2],
    max_connections_per_host: [usize; 2],
    max_simultaneous_requests_per_connection: [usize; 2],
    min_simultaneous_requests_per_connection: [usize; 2],
}

impl Default for PoolingOptions {
    fn default() -> Self {
        Self {
            core_connections_per_host: [2, 1],
            max_connections_per_host: [8, 2],
            max_simultaneous_requests_per_connection: [128, 128],
            min_simultaneous_requests_per_connection: [25, 25],
        }
    }
}

impl PoolingOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool size below which connections are never moved to the trashcan.
    pub fn core_connections_per_host(&self, distance: HostDistance) -> usize {
        Self::get(&self.core_connections_per_host, distance)
    }

    /// Hard cap on connections per endpoint, enforced by the counters.
    pub fn max_connections_per_host(&self, distance: HostDistance) -> usize {
        Self::get(&self.max_connections_per_host, distance)
    }

    /// The "busy" watermark: at or above this many in-flight requests a
    /// new connection is preferred over an existing one.
    pub fn max_simultaneous_requests_per_connection(&self, distance: HostDistance) -> usize {
        Self::get(&self.max_simultaneous_requests_per_connection, distance)
    }

    /// The "idle" watermark: at or below this many in-flight requests a
    /// connection becomes a candidate for the trashcan.
    pub fn min_simultaneous_requests_per_connection(&self, distance: HostDistance) -> usize {
        Self::get(&self.min_simultaneous_requests_per_connection, distance)
    }

    pub fn set_core_connections_per_host(mut self, distance: HostDistance, value: usize) -> Self {
        Self::set(&mut self.core_connections_per_host, distance, value);
        self
    }

    pub fn set_max_connections_per_host(mut self, distance: HostDistance, value: usize) -> Self {
        Self::set(&mut self.max_connections_per_host, distance, value);
        self
    }

    pub fn set_max_simultaneous_requests_per_connection(
        mut self,
        distance: HostDistance,
        value: usize,
    ) -> Self {
        Self::set(
            &mut self.max_simultaneous_requests_per_connection,
            distance,
            value,
        );
        self
    }

    pub fn set_min_simultaneous_requests_per_connection(
        mut self,
        distance: HostDistance,
        value: usize,
    ) -> Self {
        Self::set(
            &mut self.min_simultaneous_requests_per_connection,
            distance,
            value,
        );
        self
    }

    fn get(table: &[usize; 2], distance: HostDistance) -> usize {
        distance.index().map(|i| table[i]).unwrap_or(0)
    }

    fn set(table: &mut [usize; 2], distance: HostDistance, value: usize) {
        if let Some(i) = distance.index() {
            table[i] = value;
        }
    }
}

/// Listens to session lifecycle transitions.
///
/// Callbacks are invoked outside of any session-internal lock, at most
/// once per transition in the given direction.
pub trait SessionListener: Send + Sync {
    /// The session has established its first connection.
    fn on_ready(&self, _session_id: Uuid) {}

    /// The session has lost its last connection and considers every host
    /// unreachable.
    fn on_defunct(&self, _session_id: Uuid) {}
}

/// Configuration options for [`Session`].
/// Can be created manually, but usually it's easier to use
/// [SessionBuilder](super::session_builder::SessionBuilder).
#[derive(Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Cluster nodes known on session startup. Ignored when an explicit
    /// load balancing policy is provided.
    pub known_nodes: Vec<Endpoint>,

    /// Produces query plans. Defaults to round robin over `known_nodes`.
    pub load_balancing_policy: Option<Arc<dyn LoadBalancingPolicy>>,

    /// Per-host pool sizing.
    pub pooling: PoolingOptions,

    /// Opaque credentials passed to every new connection.
    pub credentials: Option<Credentials>,

    /// Timeout for establishing a connection to a node.
    pub connect_timeout: Duration,

    /// Whether to set the nodelay TCP flag.
    pub tcp_nodelay: bool,

    /// Number of fatal errors after which a connection slot is removed
    /// instead of being reconnected in place.
    pub reconnect_limit: u32,

    /// Soft-retirement delay of the trashcan.
    pub trashcan_ttl: Duration,

    /// Optional lifecycle listener.
    pub listener: Option<Arc<dyn SessionListener>>,

    /// Produces connections. Defaults to plain TCP.
    pub connection_factory: Option<Arc<dyn ConnectionFactory>>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self {
            known_nodes: Vec::new(),
            load_balancing_policy: None,
            pooling: PoolingOptions::default(),
            credentials: None,
            connect_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
            reconnect_limit: 0,
            trashcan_ttl: DEFAULT_TRASHCAN_TTL,
            listener: None,
            connection_factory: None,
        }
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: self.connect_timeout,
            tcp_nodelay: self.tcp_nodelay,
            credentials: self.credentials.clone(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// `Session` manages connections to the cluster and allows to execute CQL
/// requests.
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    id: Uuid,
    policy: Arc<dyn LoadBalancingPolicy>,
    pooling: PoolingOptions,
    connection_config: ConnectionConfig,
    reconnect_limit: u32,
    factory: Arc<dyn ConnectionFactory>,
    listener: Option<Arc<dyn SessionListener>>,
    pub(crate) pool: ConnectionPool,
    pub(crate) counters: ConnectionCounters,
    pub(crate) trashcan: Trashcan,
    // Error count per connection slot, carried across in-place reconnects.
    slot_errors: DashMap<Uuid, u32>,
    ready: AtomicBool,
    defunct: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("policy", &self.inner.policy.name())
            .field("size", &self.size())
            .field("ready", &self.is_ready())
            .field("defunct", &self.is_defunct())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates the session and performs the first connection attempt.
    ///
    /// The session becomes ready when the attempt succeeds; an exhausted
    /// query plan fails creation with the tried-host report.
    pub async fn connect(config: SessionConfig) -> Result<Session, NewSessionError> {
        if config.known_nodes.is_empty() && config.load_balancing_policy.is_none() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        let policy = config.load_balancing_policy.clone().unwrap_or_else(|| {
            Arc::new(RoundRobinPolicy::with_hosts(
                config
                    .known_nodes
                    .iter()
                    .map(|endpoint| Arc::new(Host::new(*endpoint))),
            ))
        });

        let factory = config
            .connection_factory
            .clone()
            .unwrap_or_else(|| Arc::new(TcpConnectionFactory));

        let inner = Arc::new(SessionInner {
            id: Uuid::new_v4(),
            policy,
            pooling: config.pooling.clone(),
            connection_config: config.connection_config(),
            reconnect_limit: config.reconnect_limit,
            factory,
            listener: config.listener.clone(),
            pool: ConnectionPool::new(),
            counters: ConnectionCounters::new(),
            trashcan: Trashcan::new(config.trashcan_ttl),
            slot_errors: DashMap::new(),
            ready: AtomicBool::new(false),
            defunct: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        SessionInner::spawn_trashcan_reaper(&inner);

        let session = Session { inner };
        session.init().await?;
        Ok(session)
    }

    /// Performs a connection attempt through a fresh query plan.
    ///
    /// Called by [Session::connect]; may be called again later to clear
    /// the defunct state by reattempting the connect.
    pub async fn init(&self) -> Result<(), NewSessionError> {
        let plan = self.inner.policy.new_query_plan(None);
        let probe = self
            .inner
            .connect_via_plan(plan)
            .await
            .map_err(NewSessionError::from)?;
        // The probe stream is released immediately; init only proves that
        // a host is reachable.
        drop(probe);
        Ok(())
    }

    /// Executes an unprepared statement.
    pub async fn query(&self, statement: impl Into<Statement>) -> Result<QueryResult, QueryError> {
        let statement = statement.into();
        let stream = self.inner.dispatch(Some(&statement)).await?;
        let conn = stream.connection().clone();
        Ok(conn.query(stream, &statement).await?)
    }

    /// Prepares a statement on one of the pooled connections.
    pub async fn prepare(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<PreparedStatement, QueryError> {
        let statement = statement.into();
        let stream = self.inner.dispatch(Some(&statement)).await?;
        let conn = stream.connection().clone();
        Ok(conn.prepare(stream, &statement).await?)
    }

    /// Executes a previously prepared statement.
    ///
    /// Fails with [QueryError::UnknownPreparedStatement] when dispatch
    /// picks a connection on which the statement has never been prepared.
    pub async fn execute(
        &self,
        prepared: &PreparedStatement,
        values: &[Option<Vec<u8>>],
    ) -> Result<QueryResult, QueryError> {
        let stream = self.inner.dispatch(None).await?;
        let conn = stream.connection().clone();
        if !conn.knows_prepared_id(prepared.id()) {
            // Dropping the stream guard returns the id to the free pool.
            return Err(QueryError::UnknownPreparedStatement);
        }
        Ok(conn.execute(stream, prepared, values).await?)
    }

    /// Closes the session: the trashcan is emptied and every pooled
    /// connection is freed. Dispatches started afterwards fail; requests
    /// already in flight are allowed to finish.
    ///
    /// Idempotent and safe to call concurrently with dispatches.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Current total number of pooled connections.
    pub fn size(&self) -> usize {
        self.inner.pool.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether the session has established at least one connection.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Whether the session has lost every connection and given up.
    pub fn is_defunct(&self) -> bool {
        self.inner.defunct.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }
}

impl SessionInner {
    /// Turns one request into an acquired `(connection, stream)` pair.
    async fn dispatch(
        self: &Arc<Self>,
        statement: Option<&Statement>,
    ) -> Result<StreamGuard, QueryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueryError::Library("session is closed".to_owned()));
        }
        if self.defunct.load(Ordering::SeqCst) {
            return Err(QueryError::SessionDefunct);
        }
        let plan = self.policy.new_query_plan(statement);
        self.connect_via_plan(plan).await
    }

    /// Walks the query plan until a host yields a connection with a free
    /// stream.
    ///
    /// Per host, in order: a free stream on a pooled connection, a
    /// recycled connection from the trashcan, a fresh dial. Hosts that are
    /// down are skipped silently; hosts that fail are recorded as tried.
    pub(crate) async fn connect_via_plan(
        self: &Arc<Self>,
        plan: QueryPlan,
    ) -> Result<StreamGuard, QueryError> {
        let mut tried: Vec<(Endpoint, ConnectionError)> = Vec::new();

        for host in plan {
            if !host.is_considerably_up() {
                continue;
            }
            let distance = self.policy.distance(&host);
            if matches!(distance, HostDistance::Ignored) {
                continue;
            }
            let endpoint = host.endpoint();
            let collection = self.pool.get_or_install(endpoint);

            if let Some(stream) = self.try_find_free_stream(distance, &collection) {
                return Ok(stream);
            }

            let mut conn = self.trashcan.recycle(endpoint);
            if let Some(recycled) = conn.take() {
                if recycled.is_healthy() {
                    conn = Some(recycled);
                } else {
                    self.free_connection(&recycled);
                }
            }

            let conn = match conn {
                Some(conn) => conn,
                None => match self.allocate_connection(&host, distance).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        debug!("[{}] Connection attempt failed: {}", endpoint, err);
                        tried.push((endpoint, err));
                        continue;
                    }
                },
            };

            collection.try_add(conn.id(), conn.clone());
            if self.closed.load(Ordering::SeqCst) {
                // Lost the race against close(); do not leak the freshly
                // pooled connection.
                if collection.try_erase(conn.id()).is_some() {
                    self.free_connection(&conn);
                }
                return Err(QueryError::Library("session is closed".to_owned()));
            }

            match StreamGuard::acquire(&conn) {
                Some(stream) => return Ok(stream),
                // Stream acquisition failure is never surfaced; the next
                // host gets its chance instead.
                None => continue,
            }
        }

        Err(self.plan_exhausted(tried))
    }

    /// Applies the per-connection decision table over a snapshot of the
    /// endpoint's collection; first match wins.
    fn try_find_free_stream(
        self: &Arc<Self>,
        distance: HostDistance,
        collection: &Arc<ConnectionsCollection>,
    ) -> Option<StreamGuard> {
        let max_requests = self
            .pooling
            .max_simultaneous_requests_per_connection(distance);
        let min_requests = self
            .pooling
            .min_simultaneous_requests_per_connection(distance);
        let core_connections = self.pooling.core_connections_per_host(distance);

        for (id, conn) in collection.snapshot() {
            if !conn.is_healthy() {
                // Eviction on next touch: only the erasing winner frees.
                if collection.try_erase(id).is_some() {
                    self.free_connection(&conn);
                }
            } else if !conn.is_busy(max_requests) {
                if let Some(stream) = StreamGuard::acquire(&conn) {
                    return Some(stream);
                }
            } else if collection.len() > core_connections && conn.is_free(min_requests) {
                if collection.try_erase(id).is_some() {
                    self.trashcan.put(conn);
                }
            }
        }
        None
    }

    /// Dials a new connection to the host, charging it against the
    /// endpoint's counter first.
    async fn allocate_connection(
        self: &Arc<Self>,
        host: &Arc<Host>,
        distance: HostDistance,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let endpoint = host.endpoint();
        let cap = self.pooling.max_connections_per_host(distance);
        if !self.counters.try_increment(endpoint, cap) {
            return Err(ConnectionError::TooManyConnections(cap));
        }
        // The charge covers the pending dial: a failed or abandoned dial
        // must not keep a slot reserved.
        let charge = CounterCharge {
            inner: self.as_ref(),
            endpoint,
            armed: true,
        };

        match self.factory.open(endpoint, &self.connection_config).await {
            Ok((conn, error_receiver)) => {
                charge.defuse();
                trace!("[{}] Opened connection {}", endpoint, conn.id());
                self.spawn_connection_watcher(host.clone(), &conn, error_receiver);
                self.mark_ready();
                Ok(conn)
            }
            Err(err) => {
                drop(charge);
                warn!("[{}] Failed to open connection: {}", endpoint, err);
                Err(err)
            }
        }
    }

    fn plan_exhausted(&self, tried: Vec<(Endpoint, ConnectionError)>) -> QueryError {
        if !tried.is_empty() && self.pool.size() == 0 && self.trashcan.is_empty() {
            self.mark_defunct();
        }

        // A lone host refusing on its cap surfaces as the cap error; any
        // other combination aggregates into the tried-host report.
        if let [(endpoint, ConnectionError::TooManyConnections(cap))] = &tried[..] {
            return QueryError::TooManyConnectionsPerHost {
                endpoint: *endpoint,
                cap: *cap,
            };
        }
        QueryError::NoHostAvailable(NoHostAvailableError::new(tried))
    }

    /// Closes a connection and settles its counter, exactly once per
    /// connection.
    pub(crate) fn free_connection(&self, conn: &Arc<Connection>) {
        if conn.set_closed() {
            trace!("[{}] Freeing connection {}", conn.endpoint(), conn.id());
            self.slot_errors.remove(&conn.id());
            self.counters.decrement(conn.endpoint());
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing session {}", self.id);

        for conn in self.trashcan.drain_all() {
            self.free_connection(&conn);
        }
        for (_endpoint, collection) in self.pool.snapshot() {
            for (id, conn) in collection.snapshot() {
                if collection.try_erase(id).is_some() {
                    self.free_connection(&conn);
                }
            }
        }
    }

    fn mark_ready(&self) {
        self.defunct.store(false, Ordering::SeqCst);
        if !self.ready.swap(true, Ordering::SeqCst) {
            debug!("Session {} is ready", self.id);
            if let Some(listener) = &self.listener {
                listener.on_ready(self.id);
            }
        }
    }

    fn mark_defunct(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.ready.store(false, Ordering::SeqCst);
        if !self.defunct.swap(true, Ordering::SeqCst) {
            error!("Session {} has no reachable hosts left; marking defunct", self.id);
            if let Some(listener) = &self.listener {
                listener.on_defunct(self.id);
            }
        }
    }

    fn check_defunct(&self) {
        if self.pool.size() == 0 && self.trashcan.is_empty() {
            self.mark_defunct();
        }
    }

    /// Watches the connection's fatal-error channel and feeds the error
    /// into the slot bookkeeping.
    ///
    /// The task holds only weak references: a dropped session stops the
    /// watchers, and a freed connection must not be pinned by its own
    /// watcher. Once the pool, the trashcan and the in-flight callers
    /// have released their handles, the connection drops, its router task
    /// is cancelled and the socket closes; the error channel then resolves
    /// and this task ends.
    fn spawn_connection_watcher(
        self: &Arc<Self>,
        host: Arc<Host>,
        conn: &Arc<Connection>,
        error_receiver: ErrorReceiver,
    ) {
        let session = Arc::downgrade(self);
        let conn = Arc::downgrade(conn);
        tokio::spawn(async move {
            let error = match error_receiver.await {
                Ok(error) => error,
                // The connection was dropped without a fatal error.
                Err(_) => return,
            };
            let (Some(session), Some(conn)) = (session.upgrade(), conn.upgrade()) else {
                // The connection is already gone; there is no slot left
                // to repair.
                return;
            };
            session.handle_connection_error(host, conn, error).await;
        });
    }

    /// A connection reported a fatal error: under the reconnect limit the
    /// slot is reconnected in place, above it the slot is removed and the
    /// defunct transition is evaluated.
    async fn handle_connection_error(
        self: &Arc<Self>,
        host: Arc<Host>,
        conn: Arc<Connection>,
        error: ConnectionError,
    ) {
        let endpoint = conn.endpoint();
        warn!("[{}] Connection {} broke: {}", endpoint, conn.id(), error);

        if conn.is_closed() {
            // Already evicted and freed through another path.
            return;
        }

        let collection = self.pool.get_or_install(endpoint);
        if self.closed.load(Ordering::SeqCst) {
            if collection.try_erase(conn.id()).is_some() {
                self.free_connection(&conn);
            }
            return;
        }

        let errors = {
            let mut entry = self.slot_errors.entry(conn.id()).or_insert(0);
            *entry += 1;
            *entry
        };

        if errors > self.reconnect_limit {
            warn!(
                "[{}] Connection {} reached the error threshold, removing from pool",
                endpoint,
                conn.id()
            );
            collection.try_erase(conn.id());
            self.free_connection(&conn);
            self.check_defunct();
            return;
        }

        debug!("[{}] Attempting to reconnect connection {}", endpoint, conn.id());
        collection.try_erase(conn.id());
        self.free_connection(&conn);

        let distance = self.policy.distance(&host);
        match self.allocate_connection(&host, distance).await {
            Ok(new_conn) => {
                // The slot keeps its error count across the replacement.
                self.slot_errors.insert(new_conn.id(), errors);
                collection.try_add(new_conn.id(), new_conn.clone());
                if self.closed.load(Ordering::SeqCst) {
                    // close() ran while the replacement was being dialed.
                    if collection.try_erase(new_conn.id()).is_some() {
                        self.free_connection(&new_conn);
                    }
                }
            }
            Err(err) => {
                warn!("[{}] In-place reconnect failed: {}", endpoint, err);
                self.check_defunct();
            }
        }
    }

    /// Reaps trashcan entries past their TTL on a timer. Holds a weak
    /// session reference: once the session is gone, reaping is a no-op
    /// and the task ends.
    fn spawn_trashcan_reaper(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        let period = (inner.trashcan.ttl() / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(session) = weak.upgrade() else {
                    return;
                };
                for conn in session.trashcan.reap_expired(Instant::now()) {
                    debug!(
                        "[{}] Reaping trashed connection {}",
                        conn.endpoint(),
                        conn.id()
                    );
                    session.free_connection(&conn);
                }
            }
        });
    }
}

/// Settles the endpoint counter unless the dial it covers completes.
struct CounterCharge<'a> {
    inner: &'a SessionInner,
    endpoint: Endpoint,
    armed: bool,
}

impl CounterCharge<'_> {
    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for CounterCharge<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.counters.decrement(self.endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_utils::TestConnectionFactory;
    use crate::network::StreamGuard;

    fn endpoint(n: u8) -> Endpoint {
        format!("127.0.0.{n}:9042")
            .parse::<std::net::SocketAddr>()
            .unwrap()
            .into()
    }

    fn pooling_for_trashcan_tests() -> PoolingOptions {
        // max_sim below min_sim makes lightly loaded connections eligible
        // for retirement as soon as the pool exceeds its core size.
        PoolingOptions::new()
            .set_core_connections_per_host(HostDistance::Local, 1)
            .set_max_connections_per_host(HostDistance::Local, 2)
            .set_max_simultaneous_requests_per_connection(HostDistance::Local, 1)
            .set_min_simultaneous_requests_per_connection(HostDistance::Local, 25)
    }

    async fn build_session(
        pooling: PoolingOptions,
        nodes: u8,
        configure: impl FnOnce(&mut SessionConfig),
    ) -> (Session, Arc<TestConnectionFactory>) {
        let factory = TestConnectionFactory::new();
        let mut config = SessionConfig::new();
        config.known_nodes = (1..=nodes).map(endpoint).collect();
        config.pooling = pooling;
        config.connection_factory = Some(factory.clone());
        configure(&mut config);
        let session = Session::connect(config).await.unwrap();
        (session, factory)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn single_host_plan(ep: Endpoint) -> QueryPlan {
        Box::new(std::iter::once(Arc::new(Host::new(ep))))
    }

    #[tokio::test]
    async fn surplus_lightly_loaded_connection_moves_to_trashcan() {
        let (session, _factory) = build_session(pooling_for_trashcan_tests(), 1, |_| {}).await;
        let inner = session.inner();
        let ep = endpoint(1);
        let collection = inner.pool.get_or_install(ep);

        let first = collection.snapshot()[0].1.clone();
        let second = inner
            .allocate_connection(&Arc::new(Host::new(ep)), HostDistance::Local)
            .await
            .unwrap();
        collection.try_add(second.id(), second.clone());
        assert_eq!(inner.counters.get(ep), 2);

        // One request each: busy under max_sim=1, yet within min_sim=25.
        let _g1 = StreamGuard::acquire(&first).unwrap();
        let _g2 = StreamGuard::acquire(&second).unwrap();

        let found = inner.try_find_free_stream(HostDistance::Local, &collection);
        assert!(found.is_none());

        // Exactly one of them was retired; the counter still covers both.
        assert_eq!(collection.len(), 1);
        assert!(!inner.trashcan.is_empty());
        assert_eq!(inner.counters.get(ep), 2);
    }

    #[tokio::test]
    async fn connection_at_core_size_is_never_trashed() {
        let (session, _factory) = build_session(pooling_for_trashcan_tests(), 1, |_| {}).await;
        let inner = session.inner();
        let ep = endpoint(1);
        let collection = inner.pool.get_or_install(ep);
        let conn = collection.snapshot()[0].1.clone();

        // Busy under max_sim=1 and within min_sim, but the pool holds
        // exactly core connections: strict inequality keeps it pooled.
        let _g = StreamGuard::acquire(&conn).unwrap();
        assert!(inner
            .try_find_free_stream(HostDistance::Local, &collection)
            .is_none());
        assert_eq!(collection.len(), 1);
        assert!(inner.trashcan.is_empty());
    }

    #[tokio::test]
    async fn dispatch_recycles_the_trashed_connection() {
        let (session, _factory) = build_session(pooling_for_trashcan_tests(), 1, |_| {}).await;
        let inner = session.inner();
        let ep = endpoint(1);
        let collection = inner.pool.get_or_install(ep);

        let first = collection.snapshot()[0].1.clone();
        let second = inner
            .allocate_connection(&Arc::new(Host::new(ep)), HostDistance::Local)
            .await
            .unwrap();
        collection.try_add(second.id(), second.clone());

        let _g1 = StreamGuard::acquire(&first).unwrap();
        let _g2 = StreamGuard::acquire(&second).unwrap();
        assert!(inner
            .try_find_free_stream(HostDistance::Local, &collection)
            .is_none());
        assert!(!inner.trashcan.is_empty());

        // The next dispatch on the endpoint pulls the retired connection
        // back instead of dialing a third one.
        let stream = inner
            .connect_via_plan(single_host_plan(ep))
            .await
            .unwrap();
        assert!(inner.trashcan.is_empty());
        assert_eq!(collection.len(), 2);
        assert_eq!(inner.counters.get(ep), 2);
        drop(stream);
    }

    #[tokio::test(start_paused = true)]
    async fn trashcan_reap_closes_and_decrements() {
        let (session, _factory) = build_session(pooling_for_trashcan_tests(), 1, |_| {}).await;
        let inner = session.inner().clone();
        let ep = endpoint(1);
        let collection = inner.pool.get_or_install(ep);

        let conn = collection.snapshot()[0].1.clone();
        collection.try_erase(conn.id()).unwrap();
        inner.trashcan.put(conn.clone());
        assert_eq!(inner.counters.get(ep), 1);

        tokio::time::advance(DEFAULT_TRASHCAN_TTL + Duration::from_secs(1)).await;
        wait_until(|| inner.counters.get(ep) == 0).await;

        assert!(inner.trashcan.is_empty());
        assert!(conn.is_closed());
        assert_eq!(session.size(), 0);

        // Nothing may pin the reaped connection; its router task dies with
        // the last handle.
        let weak = Arc::downgrade(&conn);
        drop(conn);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn abandoned_dial_settles_the_counter() {
        let (session, factory) = build_session(PoolingOptions::default(), 1, |_| {}).await;
        let inner = session.inner().clone();
        factory.set_hang_dials(true);

        let ep = endpoint(2);
        {
            let dispatch = inner.connect_via_plan(single_host_plan(ep));
            tokio::select! {
                biased;
                _ = dispatch => panic!("dial should hang"),
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
        // The dispatch was dropped mid-dial; the reserved slot is returned.
        assert_eq!(inner.counters.get(ep), 0);
    }

    #[tokio::test]
    async fn unhealthy_connection_is_evicted_not_served() {
        let (session, _factory) = build_session(PoolingOptions::default(), 1, |_| {}).await;
        let inner = session.inner();
        let ep = endpoint(1);
        let collection = inner.pool.get_or_install(ep);

        let conn = collection.snapshot()[0].1.clone();
        conn.mark_unhealthy();

        assert!(inner
            .try_find_free_stream(HostDistance::Local, &collection)
            .is_none());
        assert!(collection.is_empty());
        assert!(conn.is_closed());
        assert_eq!(inner.counters.get(ep), 0);
    }

    #[tokio::test]
    async fn unhealthy_trashed_connection_is_never_recycled() {
        let (session, factory) = build_session(PoolingOptions::default(), 1, |_| {}).await;
        let inner = session.inner();
        let ep = endpoint(1);
        let collection = inner.pool.get_or_install(ep);

        // Park a broken connection in the trashcan by hand.
        let conn = collection.snapshot()[0].1.clone();
        collection.try_erase(conn.id()).unwrap();
        inner.trashcan.put(conn.clone());
        conn.mark_unhealthy();

        let dials_before = factory.opened();
        let stream = inner
            .connect_via_plan(single_host_plan(ep))
            .await
            .unwrap();

        // The broken connection was dropped and a fresh one dialed.
        assert!(conn.is_closed());
        assert_ne!(stream.connection().id(), conn.id());
        assert_eq!(factory.opened(), dials_before + 1);
        assert_eq!(inner.counters.get(ep), 1);
    }

    #[tokio::test]
    async fn broken_connection_reconnects_in_place_under_the_limit() {
        let (session, factory) =
            build_session(PoolingOptions::default(), 1, |config| {
                config.reconnect_limit = 1;
            })
            .await;
        let inner = session.inner().clone();
        assert_eq!(factory.opened(), 1);

        factory.kill_all();
        wait_until(|| factory.opened() == 2).await;
        wait_until(|| session.size() == 1).await;

        assert!(!session.is_defunct());
        assert_eq!(inner.counters.get(endpoint(1)), 1);

        // The slot carries its error count onto the replacement.
        let replacement_id = inner.pool.get_or_install(endpoint(1)).snapshot()[0].0;
        assert_eq!(*inner.slot_errors.get(&replacement_id).unwrap(), 1);
    }

    #[tokio::test]
    async fn slot_over_the_limit_is_removed_and_session_goes_defunct() {
        let (session, factory) = build_session(PoolingOptions::default(), 1, |_| {}).await;
        assert_eq!(session.inner().reconnect_limit, 0);

        factory.kill_all();
        wait_until(|| session.is_defunct()).await;

        assert_eq!(session.size(), 0);
        assert!(!session.is_ready());
        assert_eq!(session.inner().counters.get(endpoint(1)), 0);

        let err = session.query("SELECT 1").await.unwrap_err();
        assert!(matches!(err, QueryError::SessionDefunct));

        // A repeated init clears the defunct state by reconnecting.
        session.init().await.unwrap();
        assert!(session.is_ready());
        assert!(!session.is_defunct());
    }
}
