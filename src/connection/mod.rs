//! The connection handle and its duplex engine.
//!
//! A [`Connection`] owns one socket, an outbound and an inbound message queue,
//! its state and a sender/receiver thread pair. The application enqueues and
//! dequeues whole messages while the engine moves them over the wire.
//!
//! # Example
//!
//! ```no_run
//! use duplexnet::{Connection, IpFamily};
//! use std::time::Duration;
//!
//! let conn = Connection::connect("localhost", 7000, IpFamily::Any)?;
//! conn.start_engine()?;
//! conn.enqueue(b"hello")?;
//! if let Some(reply) = conn.wait_message(Duration::from_millis(5), Some(Duration::from_secs(1))) {
//!     println!("{} bytes back", reply.len());
//! }
//! conn.wait_close(Duration::from_secs(5))?;
//! # Ok::<(), duplexnet::Error>(())
//! ```

mod close;
mod engine;
mod options;
mod queue;
mod signal;
mod state;

pub use close::CloseSummary;
pub use options::{SocketOption, SocketOptions};
pub use state::{ConnectionState, EngineState};

use crate::config::EngineConfig;
use crate::error::Error;
use crate::net::{self, IpFamily};
use crate::pool::{PoolId, PoolInner};
use crate::transport::{PlainTransport, TlsContext, TlsTransport, Transport, TransportKind};
use crate::wire::MAX_FRAME_PAYLOAD;
use engine::EngineThreads;
use parking_lot::Mutex;
use queue::MessageQueue;
use signal::Semaphore;
use state::StatePair;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

const CONNECTION_ID_RANGE_START: u64 = 1000;
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(CONNECTION_ID_RANGE_START);

/// Process-unique identity of a connection. Pools key their members by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

/// Messages waiting in each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatus {
    /// Queued by the application, not yet written by the sender thread.
    pub to_send: usize,
    /// Received by the receiver thread, not yet dequeued by the application.
    pub to_read: usize,
}

// State shared by the handle, its engine threads and the pools it belongs to.
pub(crate) struct Shared {
    pub(crate) id: ConnectionId,
    role: Role,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    transport: Box<dyn Transport>,
    outbound: MessageQueue,
    inbound: MessageQueue,
    state: Mutex<StatePair>,
    work: Semaphore,
    running_tasks: AtomicUsize,
    options: Mutex<SocketOptions>,
    // Pools this connection is registered in. Only weak back-references.
    pools: Mutex<HashMap<PoolId, Weak<PoolInner>>>,
    // Set under the `pools` lock so no pool can register a closed connection.
    closed: AtomicBool,
    threads: Mutex<EngineThreads>,
    user_id: Mutex<Option<u64>>,
    config: EngineConfig,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("transport", &self.transport.kind())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// State
// ============================================================================

impl Shared {
    pub(crate) fn state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    pub(crate) fn engine_state(&self) -> EngineState {
        self.state.lock().engine
    }

    /// Moves the state forward and wakes the sender so it sees the change.
    pub(crate) fn set_state(&self, requested: ConnectionState) -> ConnectionState {
        let (before, after) = {
            let mut pair = self.state.lock();
            let before = pair.connection;
            pair.connection = before.advance(requested);
            (before, pair.connection)
        };
        if before != after {
            debug!(id = %self.id, from = %before, to = %after, "State changed");
        }
        self.work.post();
        after
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// Queues
// ============================================================================

impl Shared {
    fn max_message_size(&self) -> usize {
        self.config.max_message_size.min(MAX_FRAME_PAYLOAD)
    }

    pub(crate) fn enqueue(&self, message: Vec<u8>) -> Result<(), Error> {
        if message.is_empty() {
            return Err(Error::EmptyMessage);
        }
        let max = self.max_message_size();
        if message.len() > max {
            return Err(Error::MessageTooLarge {
                len: message.len(),
                max,
            });
        }
        if self.is_closed() {
            return Err(Error::ConnectionClosed { id: self.id });
        }
        let state = self.state();
        if !state.accepts_work() {
            return Err(Error::NotRunning { id: self.id, state });
        }

        let len = message.len();
        self.outbound.push(message).map_err(|full| Error::QueueFull {
            id: self.id,
            limit: full.limit,
        })?;
        self.work.post();
        trace!(id = %self.id, len, "Message queued");
        Ok(())
    }

    // Registers the membership while the caller holds the pool's write lock.
    pub(crate) fn join_pool(&self, pool_id: PoolId, pool: Weak<PoolInner>) -> Result<(), Error> {
        let mut pools = self.pools.lock();
        if self.is_closed() {
            return Err(Error::ConnectionClosed { id: self.id });
        }
        pools.insert(pool_id, pool);
        Ok(())
    }

    pub(crate) fn leave_pool(&self, pool_id: PoolId) {
        self.pools.lock().remove(&pool_id);
    }

    #[cfg(test)]
    pub(crate) fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }
}

// ============================================================================
// Connection Handle
// ============================================================================

/// One endpoint of a message-framed TCP or TLS connection.
///
/// The handle is `Send + Sync`; share it between threads with an `Arc` if
/// several of them enqueue or dequeue. Dropping it force-closes the
/// connection if [`close`](Self::close) or [`wait_close`](Self::wait_close)
/// was not called.
pub struct Connection {
    shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.shared.fmt(f)
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Connection {
    /// Connects over plain TCP with default tunables.
    pub fn connect(host: &str, port: u16, family: IpFamily) -> Result<Self, Error> {
        Self::connect_with(host, port, family, None, &EngineConfig::default())
    }

    /// Connects to `host:port`, trying every resolved address of `family` in
    /// resolver order. With a TLS context the client handshake completes
    /// before this returns.
    #[instrument(skip(tls, config), fields(encrypted = tls.is_some()))]
    pub fn connect_with(
        host: &str,
        port: u16,
        family: IpFamily,
        tls: Option<Arc<TlsContext>>,
        config: &EngineConfig,
    ) -> Result<Self, Error> {
        let (stream, _) = net::connect_first(host, port, family)?;
        Self::establish(stream, Role::Client, tls.as_deref(), host, config)
    }

    /// Wraps an already connected stream in a plain-TCP connection.
    ///
    /// The engine is not started.
    pub fn from_stream(stream: TcpStream, role: Role, config: &EngineConfig) -> Result<Self, Error> {
        Self::establish(stream, role, None, "", config)
    }

    pub(crate) fn establish(
        stream: TcpStream,
        role: Role,
        tls: Option<&TlsContext>,
        host: &str,
        config: &EngineConfig,
    ) -> Result<Self, Error> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(config.tcp_nodelay)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;

        let transport: Box<dyn Transport> = match (tls, role) {
            (Some(context), Role::Client) => Box::new(TlsTransport::connect(stream, context, host)?),
            (Some(context), Role::Server) => Box::new(TlsTransport::accept(stream, context)?),
            (None, _) => Box::new(PlainTransport::new(stream)),
        };

        let mut options = SocketOptions {
            send_backoff: config.send_backoff,
            drain_timeout: config.drain_timeout,
            ..SocketOptions::default()
        };
        options.record(SocketOption::NoDelay(config.tcp_nodelay));

        let id = ConnectionId::next();
        info!(
            %id,
            ?role,
            %local_addr,
            %peer_addr,
            transport = ?transport.kind(),
            "Connection established"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                role,
                local_addr,
                peer_addr,
                transport,
                outbound: MessageQueue::new(config.send_queue_limit),
                inbound: MessageQueue::new(config.recv_queue_limit),
                state: Mutex::new(StatePair::default()),
                work: Semaphore::new(),
                running_tasks: AtomicUsize::new(0),
                options: Mutex::new(options),
                pools: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                threads: Mutex::new(EngineThreads::default()),
                user_id: Mutex::new(None),
                config: config.clone(),
            }),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    // The acceptor sets SO_REUSEADDR before the handle exists.
    pub(crate) fn record_reuse_address(&self) {
        self.shared
            .options
            .lock()
            .record(SocketOption::ReuseAddress(true));
    }
}

// ============================================================================
// Messaging
// ============================================================================

impl Connection {
    /// Queues one message for the sender thread.
    ///
    /// Empty messages are rejected, as is any message once the connection
    /// left [`ConnectionState::Running`]. Messages may be queued before the
    /// engine is started.
    pub fn enqueue(&self, message: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.shared.enqueue(message.into())
    }

    /// Takes the oldest received message, if any. Never blocks.
    pub fn dequeue(&self) -> Option<Vec<u8>> {
        self.shared.inbound.pop()
    }

    /// Polls the inbound queue every `poll_interval` until a message arrives.
    ///
    /// Returns `None` once `timeout` elapses, or as soon as the connection
    /// can no longer receive anything. `timeout: None` waits without bound.
    pub fn wait_message(&self, poll_interval: Duration, timeout: Option<Duration>) -> Option<Vec<u8>> {
        let interval = poll_interval.max(MIN_POLL_INTERVAL);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(message) = self.dequeue() {
                return Some(message);
            }
            if self.is_drained() {
                return None;
            }
            let pause = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return None;
                    }
                    interval.min(left)
                }
                None => interval,
            };
            thread::sleep(pause);
        }
    }

    // Nothing is queued and nothing more can arrive.
    fn is_drained(&self) -> bool {
        let state = self.shared.state();
        let receiving = if state.is_finished() {
            false
        } else {
            state.accepts_work() || self.shared.running_tasks.load(Ordering::Acquire) > 0
        };
        !receiving && self.shared.inbound.is_empty()
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            to_send: self.shared.outbound.len(),
            to_read: self.shared.inbound.len(),
        }
    }

    /// Drops every message not yet sent. Returns how many were dropped.
    pub fn clear_send_queue(&self) -> usize {
        let dropped = self.shared.outbound.clear();
        debug!(id = %self.shared.id, dropped, "Send queue cleared");
        dropped
    }

    /// Drops every received message not yet dequeued.
    pub fn clear_recv_queue(&self) -> usize {
        let dropped = self.shared.inbound.clear();
        debug!(id = %self.shared.id, dropped, "Receive queue cleared");
        dropped
    }
}

// ============================================================================
// State and Engine
// ============================================================================

impl Connection {
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn engine_state(&self) -> EngineState {
        self.shared.engine_state()
    }

    /// Asks both engine threads to finish. The sender announces the exit to
    /// the peer. Has no effect on a connection that already left `Running`.
    pub fn request_exit(&self) -> ConnectionState {
        self.shared.set_state(ConnectionState::ExitRequested)
    }

    /// Spawns the sender and receiver threads.
    pub fn start_engine(&self) -> Result<(), Error> {
        self.shared.start_engine()
    }

    /// Requests exit and joins both engine threads.
    ///
    /// Waits up to `timeout` for the threads to finish on their own, then
    /// shuts the socket down to unblock them. A zero timeout uses the
    /// configured `stop_timeout`. A second call fails with
    /// [`Error::EngineNotStarted`].
    pub fn stop_engine(&self, timeout: Duration) -> Result<(), Error> {
        let timeout = if timeout.is_zero() {
            self.shared.config.stop_timeout
        } else {
            timeout
        };
        self.shared.stop_engine(timeout)
    }
}

// ============================================================================
// Options and Metadata
// ============================================================================

impl Connection {
    /// Applies an option to the socket and records it.
    pub fn set_option(&self, option: SocketOption) -> Result<(), Error> {
        options::apply(self.shared.transport.stream(), option)?;
        self.shared.options.lock().record(option);
        debug!(id = %self.shared.id, ?option, "Option set");
        Ok(())
    }

    /// Options set so far, plus the engine tunables.
    pub fn options(&self) -> SocketOptions {
        self.shared.options.lock().clone()
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Address of the remote endpoint.
    pub fn ip(&self) -> IpAddr {
        self.shared.peer_addr.ip()
    }

    /// Port of the remote endpoint.
    pub fn port(&self) -> u16 {
        self.shared.peer_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.shared.transport.kind()
    }

    pub fn is_encrypted(&self) -> bool {
        self.transport_kind() == TransportKind::Tls
    }

    /// Application-defined tag, e.g. a player id.
    pub fn set_user_id(&self, user_id: u64) {
        *self.shared.user_id.lock() = Some(user_id);
    }

    pub fn user_id(&self) -> Option<u64> {
        *self.shared.user_id.lock()
    }

    /// Bytes written to the socket but not yet acknowledged by the peer.
    /// Always 0 where the platform cannot report it.
    pub fn outstanding_send_bytes(&self) -> Result<usize, Error> {
        Ok(close::outstanding_send_bytes(self.shared.transport.stream())?)
    }
}

// ============================================================================
// Shutdown
// ============================================================================

impl Connection {
    /// Closes immediately.
    ///
    /// Leaves every pool first, then stops the engine without waiting for the
    /// peer, sends a TLS close_notify when encrypted, shuts the socket down
    /// and drops both queues. In-flight data may be lost. A second call fails
    /// with [`Error::ConnectionClosed`].
    pub fn close(&self) -> Result<(), Error> {
        self.shared.close()
    }

    /// Closes gracefully, bounded by `timeout` (zero uses the configured
    /// `close_timeout`).
    ///
    /// Asks the engine to exit and waits for both threads, half-closes the
    /// socket, optionally waits for the kernel send queue to drain (see
    /// [`SocketOption::DrainTimeout`]), reads until the peer closes its side,
    /// then closes like [`close`](Self::close).
    pub fn wait_close(&self, timeout: Duration) -> Result<CloseSummary, Error> {
        self.shared.wait_close(timeout)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.shared.is_closed() {
            if let Err(err) = self.shared.close() {
                warn!(id = %self.shared.id, %err, "Close on drop failed");
            }
        }
    }
}
