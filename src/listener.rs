//! Listening socket producing server-side connections.

use crate::config::EngineConfig;
use crate::connection::{Connection, Role};
use crate::error::Error;
use crate::net::{self, IpFamily};
use crate::transport::TlsContext;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use socket2::SockRef;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

const LISTENER: Token = Token(0);

/// How long [`Listener::accept`] may wait for a pending connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptMode {
    /// Wait until a connection arrives.
    Blocking,
    /// Return `None` at once when nothing is pending.
    NonBlocking,
    /// Wait at most this long. A zero duration waits without bound.
    Timeout(Duration),
}

impl AcceptMode {
    /// `-1` non-blocking, `0` blocking, a positive value is a timeout in
    /// milliseconds.
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            0 => AcceptMode::Blocking,
            n if n < 0 => AcceptMode::NonBlocking,
            n => AcceptMode::Timeout(Duration::from_millis(n.unsigned_abs())),
        }
    }
}

/// A bound, listening TCP socket.
///
/// Accepted connections inherit the listener's TLS context and tunables.
/// The engine of an accepted connection is not started.
pub struct Listener {
    socket: TcpListener,
    // Readiness wait for the non-blocking listener; one accept at a time.
    poll: Mutex<Poll>,
    local_addr: SocketAddr,
    tls: Option<Arc<TlsContext>>,
    config: EngineConfig,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("encrypted", &self.tls.is_some())
            .finish()
    }
}

impl Listener {
    /// Listens for plain TCP connections with default tunables.
    ///
    /// `addr: None` binds the wildcard address of `family`.
    pub fn listen(addr: Option<&str>, port: u16, backlog: i32, family: IpFamily) -> Result<Self, Error> {
        Self::listen_with(addr, port, backlog, family, None, &EngineConfig::default())
    }

    /// Binds the first resolved candidate that succeeds, with address reuse
    /// enabled, and starts listening. With a TLS context every accepted
    /// connection performs the server handshake.
    #[instrument(skip(tls, config), fields(encrypted = tls.is_some()))]
    pub fn listen_with(
        addr: Option<&str>,
        port: u16,
        backlog: i32,
        family: IpFamily,
        tls: Option<Arc<TlsContext>>,
        config: &EngineConfig,
    ) -> Result<Self, Error> {
        if let Some(context) = &tls {
            if !context.can_accept() {
                return Err(Error::TlsServerConfigMissing);
            }
        }

        let socket = net::bind_first(addr, port, backlog, family)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&socket.as_raw_fd()),
            LISTENER,
            Interest::READABLE,
        )?;

        info!(%local_addr, backlog, "Listening");
        Ok(Self {
            socket,
            poll: Mutex::new(poll),
            local_addr,
            tls,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_encrypted(&self) -> bool {
        self.tls.is_some()
    }

    /// Accepts one pending connection.
    ///
    /// Returns `Ok(None)` when nothing arrived: immediately in
    /// [`AcceptMode::NonBlocking`], after the timeout in
    /// [`AcceptMode::Timeout`]. A failed TLS handshake is an error for this
    /// call only; the listener stays usable.
    #[instrument(skip(self), fields(local_addr = %self.local_addr))]
    pub fn accept(&self, mode: AcceptMode) -> Result<Option<Connection>, Error> {
        let mode = match mode {
            AcceptMode::Timeout(limit) if limit.is_zero() => AcceptMode::Blocking,
            other => other,
        };
        let deadline = match mode {
            AcceptMode::Timeout(limit) => Some(Instant::now() + limit),
            _ => None,
        };

        let mut poll = self.poll.lock();
        let mut events = Events::with_capacity(8);
        loop {
            // Always try first: readiness is edge-triggered and an earlier
            // call may have left connections in the backlog.
            match self.socket.accept() {
                Ok((stream, peer_addr)) => {
                    drop(poll);
                    return self.admit(stream, peer_addr).map(Some);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }

            let wait = match (mode, deadline) {
                (AcceptMode::NonBlocking, _) => {
                    trace!("No pending connection");
                    return Ok(None);
                }
                (_, Some(deadline)) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        debug!("Accept timed out");
                        return Ok(None);
                    }
                    Some(left)
                }
                (_, None) => None,
            };

            match poll.poll(&mut events, wait) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn admit(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<Connection, Error> {
        debug!(%peer_addr, "Accepting connection");
        stream.set_nonblocking(false)?;
        SockRef::from(&stream).set_reuse_address(true)?;

        let conn = Connection::establish(stream, Role::Server, self.tls.as_deref(), "", &self.config)
            .inspect_err(|err| warn!(%peer_addr, %err, "Could not set up accepted connection"))?;
        conn.record_reuse_address();
        Ok(conn)
    }
}
