//! duplexnet - Threaded, message-framed TCP and TLS connections
//!
//! Each [`Connection`] runs a sender and a receiver thread that move whole
//! messages between two in-memory queues and the socket. Messages are framed
//! on the wire as a 4-byte state tag, a 4-byte length and the payload, so both
//! ends must run duplexnet. Connections are opened with
//! [`Connection::connect`] or accepted from a [`Listener`], optionally over
//! TLS through a shared [`TlsContext`], and can be grouped in a
//! [`ConnectionPool`] for broadcast.
//!
//! ```no_run
//! use duplexnet::prelude::*;
//! use std::time::Duration;
//!
//! let listener = Listener::listen(Some("127.0.0.1"), 7000, 16, IpFamily::V4)?;
//! let pool = ConnectionPool::new(16);
//! while let Some(conn) = listener.accept(AcceptMode::Blocking)? {
//!     conn.start_engine()?;
//!     pool.add(&conn)?;
//!     pool.broadcast(Some(&conn), b"someone joined")?;
//!     # break;
//! }
//! # Ok::<(), duplexnet::Error>(())
//! ```
//!
//! Tunables are read with the [`config`](https://docs.rs/config) crate, see
//! [`EngineConfig`] and [`TlsContext::from_config`].

// Internal-only modules
pub(crate) mod config;
pub(crate) mod connection;
pub(crate) mod error;
pub(crate) mod listener;
pub(crate) mod net;
pub(crate) mod pool;
pub(crate) mod transport;
pub(crate) mod wire;

// These are the intended public API
pub use crate::config::EngineConfig;
pub use crate::connection::{
    CloseSummary, Connection, ConnectionId, ConnectionState, EngineState, QueueStatus, Role,
    SocketOption, SocketOptions,
};
pub use crate::error::{Error, TransportError};
pub use crate::listener::{AcceptMode, Listener};
pub use crate::net::IpFamily;
pub use crate::pool::ConnectionPool;
pub use crate::transport::{TlsContext, TransportKind};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::connection::{Connection, ConnectionState, Role, SocketOption};
    pub use crate::error::Error;
    pub use crate::listener::{AcceptMode, Listener};
    pub use crate::net::IpFamily;
    pub use crate::pool::ConnectionPool;
    pub use crate::transport::TlsContext;
}
