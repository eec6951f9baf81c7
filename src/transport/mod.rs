//! Transport strategy for moving raw bytes over one socket.
//!
//! A connection binds exactly one [`Transport`] when it is created, either
//! [`PlainTransport`] or [`TlsTransport`], and never swaps it afterwards. The
//! duplex engine only talks to the socket through this trait, so the framing
//! protocol is identical for both variants.
//!
//! Both directions are used concurrently: one sender thread calls
//! [`Transport::send_all`] while one receiver thread calls
//! [`Transport::recv_exact`]. Implementations must allow that.

mod tcp;
mod tls;
mod tls_config;

#[cfg(test)]
pub(crate) use tcp::loopback_pair;
pub(crate) use tcp::PlainTransport;
pub(crate) use tls::TlsTransport;
pub use tls_config::TlsContext;

use crate::error::TransportError;
use std::io::ErrorKind;
use std::net::TcpStream;

/// Which strategy a connection is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Plain,
    Tls,
}

// Internal transport trait for full-buffer transfers.
//
// `send_all` returns only once every byte of `buf` was handed to the socket,
// `recv_exact` only once `buf` is completely filled. Interrupted calls are
// retried internally.
pub(crate) trait Transport: Send + Sync {
    fn send_all(&self, buf: &[u8]) -> Result<(), TransportError>;
    fn recv_exact(&self, buf: &mut [u8]) -> Result<(), TransportError>;

    // Best-effort end-of-stream notice before the socket is shut down.
    fn close_notify(&self) {}

    fn stream(&self) -> &TcpStream;
    fn kind(&self) -> TransportKind;
}

// Maps socket errors to the transport outcome. Resets and broken pipes are
// the peer going away, not a local failure.
pub(crate) fn classify(err: std::io::Error) -> TransportError {
    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof => TransportError::PeerClosed,
        _ => TransportError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_class_errors() {
        for kind in [
            ErrorKind::ConnectionReset,
            ErrorKind::BrokenPipe,
            ErrorKind::NotConnected,
        ] {
            assert!(classify(std::io::Error::from(kind)).is_disconnect());
        }
        assert!(!classify(std::io::Error::from(ErrorKind::PermissionDenied)).is_disconnect());
    }
}
