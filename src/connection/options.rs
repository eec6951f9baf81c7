//! Socket options and engine tunables settable on a live connection.

use socket2::SockRef;
use std::net::TcpStream;
use std::time::Duration;

/// One option for [`Connection::set_option`](crate::Connection::set_option).
///
/// The first eight map to socket options. `SendBackoff` and `DrainTimeout`
/// only change engine behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// `SO_RCVBUF` in bytes.
    RecvBufferSize(usize),
    /// `SO_SNDBUF` in bytes.
    SendBufferSize(usize),
    /// `TCP_NODELAY`.
    NoDelay(bool),
    /// `SO_REUSEADDR`.
    ReuseAddress(bool),
    /// `SO_LINGER`. `None` disables lingering, `Some(Duration::ZERO)` resets
    /// the connection on close.
    Linger(Option<Duration>),
    /// `SO_RCVTIMEO`. `None` or zero blocks forever. A receive timeout makes
    /// an idle receiver fail, which moves the connection to `Error`.
    RecvTimeout(Option<Duration>),
    /// `SO_SNDTIMEO`. `None` or zero blocks forever.
    SendTimeout(Option<Duration>),
    /// `SO_KEEPALIVE`.
    KeepAlive(bool),
    /// Pause of the sender thread after every message.
    SendBackoff(Duration),
    /// How long a graceful close waits for the kernel send queue to empty.
    DrainTimeout(Duration),
}

impl SocketOption {
    fn is_socket_level(&self) -> bool {
        !matches!(
            self,
            SocketOption::SendBackoff(_) | SocketOption::DrainTimeout(_)
        )
    }
}

/// Last value set for each option. `None` means never set through this
/// connection, so the system default applies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketOptions {
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    pub nodelay: Option<bool>,
    pub reuse_address: Option<bool>,
    pub linger: Option<Option<Duration>>,
    pub recv_timeout: Option<Option<Duration>>,
    pub send_timeout: Option<Option<Duration>>,
    pub keepalive: Option<bool>,
    pub send_backoff: Duration,
    pub drain_timeout: Duration,
}

impl SocketOptions {
    pub(crate) fn record(&mut self, option: SocketOption) {
        match option {
            SocketOption::RecvBufferSize(size) => self.recv_buffer_size = Some(size),
            SocketOption::SendBufferSize(size) => self.send_buffer_size = Some(size),
            SocketOption::NoDelay(on) => self.nodelay = Some(on),
            SocketOption::ReuseAddress(on) => self.reuse_address = Some(on),
            SocketOption::Linger(linger) => self.linger = Some(linger),
            SocketOption::RecvTimeout(timeout) => self.recv_timeout = Some(non_zero(timeout)),
            SocketOption::SendTimeout(timeout) => self.send_timeout = Some(non_zero(timeout)),
            SocketOption::KeepAlive(on) => self.keepalive = Some(on),
            SocketOption::SendBackoff(delay) => self.send_backoff = delay,
            SocketOption::DrainTimeout(timeout) => self.drain_timeout = timeout,
        }
    }
}

// A zero timeout would be rejected by the OS; it means "no timeout" here.
fn non_zero(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|t| !t.is_zero())
}

/// Applies a socket-level option. Engine tunables are a no-op here.
pub(crate) fn apply(stream: &TcpStream, option: SocketOption) -> std::io::Result<()> {
    if !option.is_socket_level() {
        return Ok(());
    }
    let socket = SockRef::from(stream);
    match option {
        SocketOption::RecvBufferSize(size) => socket.set_recv_buffer_size(size),
        SocketOption::SendBufferSize(size) => socket.set_send_buffer_size(size),
        SocketOption::NoDelay(on) => socket.set_nodelay(on),
        SocketOption::ReuseAddress(on) => socket.set_reuse_address(on),
        SocketOption::Linger(linger) => socket.set_linger(linger),
        SocketOption::RecvTimeout(timeout) => socket.set_read_timeout(non_zero(timeout)),
        SocketOption::SendTimeout(timeout) => socket.set_write_timeout(non_zero(timeout)),
        SocketOption::KeepAlive(on) => socket.set_keepalive(on),
        SocketOption::SendBackoff(_) | SocketOption::DrainTimeout(_) => Ok(()),
    }
}
