use bytes::Bytes;
use futures::{future::RemoteHandle, FutureExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::stream::{StreamId, StreamPool};
use crate::cluster::Endpoint;
use crate::errors::{BrokenConnectionError, ConnectionError, FrameError, RequestError};
use crate::frame::{
    self,
    request::{self, SerializableRequest},
    response::{CqlResult, Response, ResponseOpcode},
    SerializedRequest, EVENT_STREAM,
};
use crate::statement::{PreparedStatement, Statement};

/// Process-unique identifier of a connection, used to key connections
/// inside a pool without relying on pointer identity.
pub type ConnectionId = Uuid;

/// Used to listen for a fatal error on a connection.
pub type ErrorReceiver = oneshot::Receiver<ConnectionError>;

// Each request gets a process-wide-unique id used to match orphanhood
// notifications to in-flight slots even across stream id reuse.
type RequestId = u64;

/// Opaque credentials carried into every new connection.
///
/// The session never interprets them; they are shipped verbatim in the
/// CREDENTIALS answer to an AUTHENTICATE challenge.
#[derive(Clone, Default)]
pub struct Credentials {
    pairs: HashMap<String, String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// The common username/password pair.
    pub fn with_username_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new()
            .with("username", username)
            .with("password", password)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.insert(key.into(), value.into());
        self
    }

    pub(crate) fn pairs(&self) -> &HashMap<String, String> {
        &self.pairs
    }
}

// Values are secrets; only keys are printed.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.pairs.keys()).finish()
    }
}

/// Configuration used for new connections.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub tcp_nodelay: bool,
    pub credentials: Option<Credentials>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
            credentials: None,
        }
    }
}

/// Produces a fresh, ready-to-use connection to an endpoint.
///
/// The default implementation dials TCP and performs the protocol
/// handshake; tests and embedders may substitute their own transport.
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open(
        &self,
        endpoint: Endpoint,
        config: &ConnectionConfig,
    ) -> Result<(Arc<Connection>, ErrorReceiver), ConnectionError>;
}

/// The production [ConnectionFactory]: plain TCP.
#[derive(Debug, Default)]
pub struct TcpConnectionFactory;

#[async_trait::async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn open(
        &self,
        endpoint: Endpoint,
        config: &ConnectionConfig,
    ) -> Result<(Arc<Connection>, ErrorReceiver), ConnectionError> {
        open_connection(endpoint, config).await
    }
}

/// Dials the endpoint, runs the handshake and returns the connection
/// together with the receiver signalling its eventual fatal error.
pub(crate) async fn open_connection(
    endpoint: Endpoint,
    config: &ConnectionConfig,
) -> Result<(Arc<Connection>, ErrorReceiver), ConnectionError> {
    let transport = tokio::time::timeout(
        config.connect_timeout,
        TcpStream::connect(endpoint.address()),
    )
    .await
    .map_err(|_| ConnectionError::ConnectTimeout)??;
    transport.set_nodelay(config.tcp_nodelay)?;

    let (connection, error_receiver) = Connection::new(endpoint, transport, config);
    let connection = Arc::new(connection);
    connection
        .perform_handshake(config.credentials.as_ref())
        .await?;

    Ok((connection, error_receiver))
}

/// Holds an acquired stream id until a request takes it over.
///
/// Covers the window between stream acquisition and the moment the router
/// assumes ownership of the id: if the dispatching future is dropped in
/// between, the guard returns the id to the free pool.
pub(crate) struct StreamGuard {
    conn: Arc<Connection>,
    stream: StreamId,
    armed: bool,
}

impl StreamGuard {
    pub(crate) fn acquire(conn: &Arc<Connection>) -> Option<Self> {
        let stream = conn.streams.acquire()?;
        Some(Self {
            conn: conn.clone(),
            stream,
            armed: true,
        })
    }

    pub(crate) fn stream(&self) -> StreamId {
        self.stream
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.armed {
            self.conn.streams.release(self.stream);
        }
    }
}

/// A single TCP session to one endpoint.
///
/// Owns the stream-id allocator, the healthy flag and the set of prepared
/// statement ids it has seen. Frame multiplexing is done by a background
/// router task which lives as long as the last handle to this connection.
pub struct Connection {
    id: ConnectionId,
    endpoint: Endpoint,
    streams: Arc<StreamPool>,
    healthy: Arc<AtomicBool>,
    closed: AtomicBool,
    prepared_ids: StdMutex<HashSet<Bytes>>,
    router_handle: RouterHandle,
    _worker_handle: RemoteHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("in_flight", &self.in_flight())
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wraps an established transport in a connection. No frames are sent;
    /// the caller is expected to run the handshake next.
    pub(crate) fn new(
        endpoint: Endpoint,
        transport: impl AsyncRead + AsyncWrite + Send + 'static,
        _config: &ConnectionConfig,
    ) -> (Self, ErrorReceiver) {
        // Unbounded channels, because both submission and orphan
        // notification have to happen without an await: submission so that
        // the router owns the stream id from the moment the request future
        // first runs, notification because it is pushed from Drop.
        let (submit_sender, submit_receiver) = mpsc::unbounded_channel();
        let (error_sender, error_receiver) = oneshot::channel();
        let (orphan_notification_sender, orphan_notification_receiver) =
            mpsc::unbounded_channel();

        let streams = Arc::new(StreamPool::new());
        let healthy = Arc::new(AtomicBool::new(true));

        let (router_task, worker_handle) = Self::router(
            transport,
            submit_receiver,
            error_sender,
            orphan_notification_receiver,
            streams.clone(),
            healthy.clone(),
            endpoint,
        )
        .remote_handle();
        tokio::task::spawn(router_task);

        let connection = Connection {
            id: Uuid::new_v4(),
            endpoint,
            streams,
            healthy,
            closed: AtomicBool::new(false),
            prepared_ids: StdMutex::new(HashSet::new()),
            router_handle: RouterHandle {
                submit_channel: submit_sender,
                request_id_generator: AtomicU64::new(0),
                orphan_notification_sender,
            },
            _worker_handle: worker_handle,
        };

        (connection, error_receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }

    /// Number of requests currently in flight on this connection.
    pub fn in_flight(&self) -> usize {
        self.streams.in_flight()
    }

    /// Whether the connection already carries `max_requests` or more
    /// concurrent requests.
    pub(crate) fn is_busy(&self, max_requests: usize) -> bool {
        self.in_flight() >= max_requests
    }

    /// Whether the connection carries `min_requests` or fewer concurrent
    /// requests, making it a candidate for soft retirement.
    pub(crate) fn is_free(&self, min_requests: usize) -> bool {
        self.in_flight() <= min_requests
    }

    /// Marks the connection as freed by the session, exactly once.
    ///
    /// Returns true on the first call. The underlying socket is torn down
    /// when the last holder drops its handle.
    pub(crate) fn set_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.mark_unhealthy();
        }
        first
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn knows_prepared_id(&self, id: &Bytes) -> bool {
        self.prepared_ids.lock().unwrap().contains(id)
    }

    /// STARTUP → READY, answering an AUTHENTICATE challenge with the
    /// opaque credentials.
    pub(crate) async fn perform_handshake(
        self: &Arc<Self>,
        credentials: Option<&Credentials>,
    ) -> Result<(), ConnectionError> {
        let response = self
            .request_during_handshake(&request::Startup::new())
            .await?;
        match response {
            Response::Ready => Ok(()),
            Response::Authenticate(authenticator) => {
                trace!(
                    "[{}] Server requests authentication: {}",
                    self.endpoint,
                    authenticator
                );
                let credentials = credentials.ok_or_else(|| {
                    ConnectionError::Handshake(format!(
                        "server requires authentication ({authenticator}), but no credentials were provided"
                    ))
                })?;
                let response = self
                    .request_during_handshake(&request::CredentialsRequest {
                        credentials: credentials.pairs(),
                    })
                    .await?;
                match response {
                    Response::Ready => Ok(()),
                    Response::Error(err) => Err(ConnectionError::Handshake(format!(
                        "authentication rejected: {}",
                        err.message
                    ))),
                    other => Err(ConnectionError::Handshake(format!(
                        "unexpected response to CREDENTIALS: {other:?}"
                    ))),
                }
            }
            Response::Error(err) => Err(ConnectionError::Handshake(err.message)),
            other => Err(ConnectionError::Handshake(format!(
                "unexpected response to STARTUP: {other:?}"
            ))),
        }
    }

    async fn request_during_handshake(
        self: &Arc<Self>,
        request: &impl SerializableRequest,
    ) -> Result<Response, ConnectionError> {
        let guard = StreamGuard::acquire(self)
            .ok_or_else(|| ConnectionError::Handshake("no free stream".to_owned()))?;
        self.send_request(guard, request)
            .await
            .map_err(|err| match err {
                RequestError::BrokenConnection(e) => ConnectionError::Broken(e),
                other => ConnectionError::Handshake(other.to_string()),
            })
    }

    /// Executes an unprepared statement on the acquired stream.
    pub(crate) async fn query(
        &self,
        stream: StreamGuard,
        statement: &Statement,
    ) -> Result<QueryResult, RequestError> {
        let query = request::Query {
            contents: &statement.contents,
            consistency: statement.consistency,
        };
        let response = self.send_request(stream, &query).await?;
        self.expect_result(response)
    }

    /// Prepares a statement, recording the returned id as known to this
    /// connection.
    pub(crate) async fn prepare(
        &self,
        stream: StreamGuard,
        statement: &Statement,
    ) -> Result<PreparedStatement, RequestError> {
        let prepare = request::Prepare {
            contents: &statement.contents,
        };
        let response = self.send_request(stream, &prepare).await?;
        match response {
            Response::Result(CqlResult::Prepared(id)) => {
                self.prepared_ids.lock().unwrap().insert(id.clone());
                Ok(PreparedStatement::new(
                    id,
                    statement.contents.clone(),
                    statement.consistency,
                ))
            }
            Response::Error(err) => Err(RequestError::DbError(err)),
            Response::Result(_) => Err(RequestError::UnexpectedResponse(ResponseOpcode::Result)),
            other => Err(self.unexpected_response(other)),
        }
    }

    /// Executes a previously prepared statement on the acquired stream.
    pub(crate) async fn execute(
        &self,
        stream: StreamGuard,
        prepared: &PreparedStatement,
        values: &[Option<Vec<u8>>],
    ) -> Result<QueryResult, RequestError> {
        let execute = request::Execute {
            id: prepared.id(),
            values,
            consistency: prepared.consistency,
        };
        let response = self.send_request(stream, &execute).await?;
        self.expect_result(response)
    }

    fn expect_result(&self, response: Response) -> Result<QueryResult, RequestError> {
        match response {
            Response::Result(result) => Ok(QueryResult { result }),
            Response::Error(err) => Err(RequestError::DbError(err)),
            other => Err(self.unexpected_response(other)),
        }
    }

    // A response of the wrong kind means the multiplexing contract is
    // broken; the connection must not be reused.
    fn unexpected_response(&self, response: Response) -> RequestError {
        warn!(
            "[{}] Protocol violation: unexpected response {:?}",
            self.endpoint, response
        );
        self.mark_unhealthy();
        let opcode = match response {
            Response::Error(_) => ResponseOpcode::Error,
            Response::Ready => ResponseOpcode::Ready,
            Response::Authenticate(_) => ResponseOpcode::Authenticate,
            Response::Supported => ResponseOpcode::Supported,
            Response::Result(_) => ResponseOpcode::Result,
            Response::Event(_) => ResponseOpcode::Event,
        };
        RequestError::UnexpectedResponse(opcode)
    }

    async fn send_request(
        &self,
        stream: StreamGuard,
        request: &impl SerializableRequest,
    ) -> Result<Response, RequestError> {
        // A serialization failure happens before anything hits the wire;
        // the guard still owns the stream and releases it.
        let serialized_request = SerializedRequest::make(request)?;
        let task_response = self
            .router_handle
            .send_request(stream, serialized_request)
            .await?;
        let response =
            Response::deserialize(task_response.opcode, task_response.body).map_err(|err| {
                // An unparseable body leaves the wire state unknown.
                self.mark_unhealthy();
                err
            })?;
        Ok(response)
    }

    async fn router(
        transport: impl AsyncRead + AsyncWrite,
        submit_receiver: mpsc::UnboundedReceiver<Task>,
        error_sender: oneshot::Sender<ConnectionError>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        streams: Arc<StreamPool>,
        healthy: Arc<AtomicBool>,
        endpoint: Endpoint,
    ) {
        let (read_half, write_half) = split(transport);

        // Shared between the reader and writer futures, which run on the
        // same task; the lock is never held across an await point, so
        // try_lock().unwrap() is always fine.
        let handler_map = StdMutex::new(ResponseHandlerMap::new());

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &handler_map,
            &streams,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &handler_map,
            &streams,
            submit_receiver,
        );
        let o = Self::orphaner(&handler_map, orphan_notification_receiver);

        let result = futures::try_join!(r, w, o);

        let error: BrokenConnectionError = match result {
            Ok(_) => return, // Connection was dropped, we can return
            Err(err) => err,
        };

        debug!("[{}] Connection broke: {}", endpoint, error);
        healthy.store(false, Ordering::Release);

        // Respond to all pending requests with the error
        let response_handlers = handler_map.into_inner().unwrap().into_handlers();
        for (_, (_, handler)) in response_handlers {
            // Ignore sending error, request was dropped
            let _ = handler.send(Err(error.clone()));
        }

        // If someone is listening for connection errors notify them
        let _ = error_sender.send(error.into());
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        streams: &StreamPool,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response(&mut read_half)
                .await
                .map_err(BrokenConnectionError::FrameError)?;

            if params.stream == EVENT_STREAM {
                // Server-push frames; event subscription is handled by an
                // external component, so they are dropped here.
                trace!("Ignoring server-pushed frame, opcode {:?}", opcode);
                continue;
            }

            let lookup = {
                // We are guaranteed here that handler_map will not be
                // locked by anybody else, so we can do try_lock().unwrap()
                let mut guard = handler_map.try_lock().unwrap();
                guard.lookup(params.stream)
            };

            match lookup {
                HandlerLookupResult::Handler(request_id, handler) => {
                    streams.release(params.stream);
                    if handler.send(Ok(TaskResponse { opcode, body })).is_err() {
                        // The receiver was just dropped; its orphanhood
                        // notification is on its way and must be ignored.
                        let mut guard = handler_map.try_lock().unwrap();
                        guard.expect_stale_notification(request_id);
                    }
                }
                HandlerLookupResult::Orphaned => {
                    // The request was cancelled; the server's response is
                    // drained and its stream goes back into the pool.
                    trace!("Drained response for orphaned stream {}", params.stream);
                    streams.release(params.stream);
                }
                HandlerLookupResult::Missing => {
                    // Unsolicited frame. This should not happen and
                    // indicates a bug either in the driver, or in the
                    // database.
                    debug!(
                        "Received response with unexpected stream id {}",
                        params.stream
                    );
                    return Err(BrokenConnectionError::UnexpectedStreamId(params.stream));
                }
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        streams: &StreamPool,
        mut submit_receiver: mpsc::UnboundedReceiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        // When the Connection object is dropped, the sender half of the
        // channel is dropped too, this loop ends and the whole router
        // returns cleanly.
        while let Some(task) = submit_receiver.recv().await {
            let stream = task.stream;
            let registered = {
                // Same reasoning as in the reader: never locked across
                // an await.
                let mut guard = handler_map.try_lock().unwrap();
                guard.register(task)
            };

            match registered {
                RegisterResult::Registered(serialized_request) => {
                    frame::write_request(&mut write_half, stream, &serialized_request)
                        .await
                        .map_err(|err| match err {
                            FrameError::Io(io) => BrokenConnectionError::WriteError(io),
                            other => BrokenConnectionError::FrameError(other),
                        })?;
                }
                RegisterResult::CancelledBeforeWrite => {
                    // The request future was dropped while its task sat in
                    // the queue; nothing was written, so the stream can be
                    // recycled right away.
                    trace!("Skipping request cancelled before write, stream {}", stream);
                    streams.release(stream);
                }
                RegisterResult::StreamIdReused => {
                    // The stream allocator must prevent this; getting here
                    // is a session bug, not a server problem.
                    error!("Stream id {} used for two requests at once", stream);
                    return Err(BrokenConnectionError::StreamIdReused(stream));
                }
            }
        }

        Ok(())
    }

    // Receives notifications from `OrphanhoodNotifier`s and marks streams
    // as orphaned, so that the reader drains their late responses.
    async fn orphaner(
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) -> Result<(), BrokenConnectionError> {
        while let Some(request_id) = orphan_receiver.recv().await {
            trace!(
                "Trying to orphan stream id associated with request_id = {}",
                request_id
            );
            let mut guard = handler_map.try_lock().unwrap();
            guard.orphan(request_id);
        }
        Ok(())
    }
}

struct RouterHandle {
    submit_channel: mpsc::UnboundedSender<Task>,

    // Each request sent through `send_request` needs a unique request id.
    // This field is a monotonic generator of such ids.
    request_id_generator: AtomicU64,

    // If a request future is cancelled, it reports the orphaned request via
    // this sender; unbounded, because Drop cannot await.
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_request(
        &self,
        stream: StreamGuard,
        serialized_request: SerializedRequest,
    ) -> Result<TaskResponse, RequestError> {
        let request_id = self.allocate_request_id();
        let (response_sender, receiver) = oneshot::channel();

        // The submission is synchronous: once this function body runs, the
        // router owns the stream id and the guard can be defused.
        self.submit_channel
            .send(Task {
                request_id,
                stream: stream.stream(),
                serialized_request,
                response_sender,
            })
            .map_err(|_| BrokenConnectionError::ChannelError)?;
        stream.defuse();

        // Dropping `notifier` before `notifier.disable()` is called tells
        // the router that no one waits for this request anymore.
        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        let task_response = receiver
            .await
            .map_err(|_| BrokenConnectionError::ChannelError)??;

        // Response was successfully received, so it's time to disable
        // notification about orphaning.
        notifier.disable();

        Ok(task_response)
    }
}

struct Task {
    request_id: RequestId,
    stream: StreamId,
    serialized_request: SerializedRequest,
    response_sender: ResponseHandler,
}

type ResponseHandler = oneshot::Sender<Result<TaskResponse, BrokenConnectionError>>;

struct TaskResponse {
    opcode: ResponseOpcode,
    body: Bytes,
}

// Notifies the router about a `send_request` future being dropped before
// the response arrived.
struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(
        request_id: RequestId,
        notification_sender: &'a mpsc::UnboundedSender<RequestId>,
    ) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

struct ResponseHandlerMap {
    handlers: HashMap<StreamId, (RequestId, ResponseHandler)>,
    stream_by_request: HashMap<RequestId, StreamId>,
    // Streams whose requests were cancelled mid-flight; their responses
    // must be drained off the wire.
    orphaned_streams: HashSet<StreamId>,
    // Cancellations that arrived before the writer registered the request.
    early_orphans: HashSet<RequestId>,
    // Requests delivered to an already-dropped receiver; the pending
    // notification for them carries no work.
    stale_notifications: HashSet<RequestId>,
}

enum HandlerLookupResult {
    Handler(RequestId, ResponseHandler),
    Orphaned,
    Missing,
}

enum RegisterResult {
    Registered(SerializedRequest),
    CancelledBeforeWrite,
    StreamIdReused,
}

impl ResponseHandlerMap {
    fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            stream_by_request: HashMap::new(),
            orphaned_streams: HashSet::new(),
            early_orphans: HashSet::new(),
            stale_notifications: HashSet::new(),
        }
    }

    fn register(&mut self, task: Task) -> RegisterResult {
        if self.early_orphans.remove(&task.request_id) {
            return RegisterResult::CancelledBeforeWrite;
        }
        if self.handlers.contains_key(&task.stream) || self.orphaned_streams.contains(&task.stream)
        {
            return RegisterResult::StreamIdReused;
        }
        self.stream_by_request.insert(task.request_id, task.stream);
        self.handlers
            .insert(task.stream, (task.request_id, task.response_sender));
        RegisterResult::Registered(task.serialized_request)
    }

    fn lookup(&mut self, stream: StreamId) -> HandlerLookupResult {
        if self.orphaned_streams.remove(&stream) {
            return HandlerLookupResult::Orphaned;
        }
        match self.handlers.remove(&stream) {
            Some((request_id, handler)) => {
                self.stream_by_request.remove(&request_id);
                HandlerLookupResult::Handler(request_id, handler)
            }
            None => HandlerLookupResult::Missing,
        }
    }

    fn orphan(&mut self, request_id: RequestId) {
        if let Some(stream) = self.stream_by_request.remove(&request_id) {
            self.handlers.remove(&stream);
            self.orphaned_streams.insert(stream);
        } else if !self.stale_notifications.remove(&request_id) {
            // The request has not reached the writer yet; remember the
            // cancellation so that its task is skipped.
            self.early_orphans.insert(request_id);
        }
    }

    fn expect_stale_notification(&mut self, request_id: RequestId) {
        self.stale_notifications.insert(request_id);
    }

    fn into_handlers(self) -> HashMap<StreamId, (RequestId, ResponseHandler)> {
        self.handlers
    }
}

/// Result of a `query` or `execute` call.
#[derive(Debug, Clone)]
pub struct QueryResult {
    result: CqlResult,
}

impl QueryResult {
    pub fn is_void(&self) -> bool {
        matches!(self.result, CqlResult::Void)
    }

    /// Raw, undecoded rows payload, if the result carries rows.
    pub fn rows_raw(&self) -> Option<&Bytes> {
        match &self.result {
            CqlResult::Rows(raw) => Some(raw),
            _ => None,
        }
    }

    pub fn result(&self) -> &CqlResult {
        &self.result
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::connected_pair;
    use super::*;

    fn endpoint() -> Endpoint {
        "127.0.0.1:9042"
            .parse::<std::net::SocketAddr>()
            .unwrap()
            .into()
    }

    #[tokio::test]
    async fn handshake_and_query_round_trip() {
        let (conn, _err, _server) = connected_pair(endpoint());
        conn.perform_handshake(None).await.unwrap();

        let stream = StreamGuard::acquire(&conn).unwrap();
        let result = conn
            .query(stream, &Statement::new("SELECT 1"))
            .await
            .unwrap();
        assert!(result.is_void());
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn prepare_registers_the_id() {
        let (conn, _err, _server) = connected_pair(endpoint());
        conn.perform_handshake(None).await.unwrap();

        let stream = StreamGuard::acquire(&conn).unwrap();
        let prepared = conn
            .prepare(stream, &Statement::new("SELECT v FROM t WHERE k = ?"))
            .await
            .unwrap();
        assert!(conn.knows_prepared_id(prepared.id()));

        let stream = StreamGuard::acquire(&conn).unwrap();
        let result = conn
            .execute(stream, &prepared, &[Some(vec![0, 0, 0, 1])])
            .await
            .unwrap();
        assert!(result.is_void());
    }

    #[tokio::test]
    async fn handshake_answers_an_authenticate_challenge() {
        use crate::frame::{types, RESPONSE_VERSION};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
        let (conn, _err) = Connection::new(endpoint(), client_io, &ConnectionConfig::default());
        let conn = Arc::new(conn);

        let server = tokio::spawn(async move {
            // STARTUP → AUTHENTICATE
            let mut header = [0u8; 8];
            server_io.read_exact(&mut header).await.unwrap();
            assert_eq!(header[3], request::RequestOpcode::Startup as u8);
            let len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
            let mut body = vec![0u8; len];
            server_io.read_exact(&mut body).await.unwrap();

            let mut challenge = Vec::new();
            types::write_string("PasswordAuthenticator", &mut challenge).unwrap();
            let mut frame = vec![RESPONSE_VERSION, 0, header[2], 0x03];
            frame.extend_from_slice(&(challenge.len() as u32).to_be_bytes());
            frame.extend_from_slice(&challenge);
            server_io.write_all(&frame).await.unwrap();

            // CREDENTIALS → READY; the opaque pairs arrive verbatim.
            server_io.read_exact(&mut header).await.unwrap();
            assert_eq!(header[3], request::RequestOpcode::Credentials as u8);
            let len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
            let mut body = vec![0u8; len];
            server_io.read_exact(&mut body).await.unwrap();
            let pairs = types::read_string_map(&mut &body[..]).unwrap();
            assert_eq!(pairs.get("username").map(String::as_str), Some("cassandra"));

            let mut frame = vec![RESPONSE_VERSION, 0, header[2], 0x02];
            frame.extend_from_slice(&0u32.to_be_bytes());
            server_io.write_all(&frame).await.unwrap();
        });

        let credentials = Credentials::with_username_password("cassandra", "cassandra");
        conn.perform_handshake(Some(&credentials)).await.unwrap();
        server.await.unwrap();
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn handshake_without_credentials_fails_on_a_challenge() {
        use crate::frame::{types, RESPONSE_VERSION};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (client_io, mut server_io) = tokio::io::duplex(1 << 16);
        let (conn, _err) = Connection::new(endpoint(), client_io, &ConnectionConfig::default());
        let conn = Arc::new(conn);

        tokio::spawn(async move {
            let mut header = [0u8; 8];
            if server_io.read_exact(&mut header).await.is_err() {
                return;
            }
            let len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
            let mut body = vec![0u8; len];
            if server_io.read_exact(&mut body).await.is_err() {
                return;
            }

            let mut challenge = Vec::new();
            types::write_string("PasswordAuthenticator", &mut challenge).unwrap();
            let mut frame = vec![RESPONSE_VERSION, 0, header[2], 0x03];
            frame.extend_from_slice(&(challenge.len() as u32).to_be_bytes());
            frame.extend_from_slice(&challenge);
            let _ = server_io.write_all(&frame).await;
        });

        let err = conn.perform_handshake(None).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Handshake(_)));
    }

    #[tokio::test]
    async fn unpolled_request_releases_its_stream() {
        let (conn, _err, _server) = connected_pair(endpoint());
        conn.perform_handshake(None).await.unwrap();

        let statement = Statement::new("SELECT 1");
        let stream = StreamGuard::acquire(&conn).unwrap();
        assert_eq!(conn.in_flight(), 1);

        let fut = conn.query(stream, &statement);
        drop(fut);
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_request_drains_and_releases_its_stream() {
        let (conn, _err, server) = connected_pair(endpoint());
        conn.perform_handshake(None).await.unwrap();

        server.hold_responses(true);
        let statement = Statement::new("SELECT 1");
        let stream = StreamGuard::acquire(&conn).unwrap();
        {
            let fut = conn.query(stream, &statement);
            // Poll once so the request is submitted, then drop it.
            tokio::select! {
                biased;
                _ = fut => panic!("response should be held"),
                _ = tokio::task::yield_now() => {}
            }
        }
        assert_eq!(conn.in_flight(), 1);

        server.hold_responses(false);
        // The router drains the late response and recycles the stream.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while conn.in_flight() != 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::task::yield_now().await;
        }
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn dropped_transport_breaks_the_connection() {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let (conn, error_receiver) =
            Connection::new(endpoint(), client_io, &ConnectionConfig::default());
        let conn = Arc::new(conn);
        drop(server_io);

        let stream = StreamGuard::acquire(&conn).unwrap();
        let err = conn
            .query(stream, &Statement::new("SELECT 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::BrokenConnection(_)));
        assert!(!conn.is_healthy());
        assert!(error_receiver.await.is_ok());
    }

    #[tokio::test]
    async fn set_closed_is_idempotent() {
        let (conn, _err, _server) = connected_pair(endpoint());
        assert!(conn.set_closed());
        assert!(!conn.set_closed());
        assert!(!conn.is_healthy());
    }
}
