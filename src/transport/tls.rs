//! TLS transport built on rustls over a blocking socket.
//!
//! The rustls session is shared by the sender and the receiver thread behind
//! a mutex. The mutex is only held while records are encrypted or decrypted,
//! never during a socket read or write, so a sender blocked on a full socket
//! never stalls the receiver of the same connection.

use super::{classify, Transport, TransportKind};
use crate::error::{Error, TransportError};
use crate::transport::TlsContext;
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};

const RAW_READ_SIZE: usize = 16 * 1024;

// Internal enum for TLS connection type
enum TlsSession {
    Server(rustls::ServerConnection),
    Client(rustls::ClientConnection),
}

impl TlsSession {
    fn read_tls(&mut self, rd: &mut dyn Read) -> Result<usize, std::io::Error> {
        match self {
            TlsSession::Server(conn) => conn.read_tls(rd),
            TlsSession::Client(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> Result<usize, std::io::Error> {
        match self {
            TlsSession::Server(conn) => conn.write_tls(wr),
            TlsSession::Client(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsSession::Server(conn) => conn.process_new_packets(),
            TlsSession::Client(conn) => conn.process_new_packets(),
        }
    }

    fn complete_io(&mut self, io: &mut &TcpStream) -> Result<(usize, usize), std::io::Error> {
        match self {
            TlsSession::Server(conn) => conn.complete_io(io),
            TlsSession::Client(conn) => conn.complete_io(io),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsSession::Server(conn) => conn.wants_write(),
            TlsSession::Client(conn) => conn.wants_write(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsSession::Server(conn) => conn.writer(),
            TlsSession::Client(conn) => conn.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsSession::Server(conn) => conn.reader(),
            TlsSession::Client(conn) => conn.reader(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsSession::Server(conn) => conn.is_handshaking(),
            TlsSession::Client(conn) => conn.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsSession::Server(conn) => conn.send_close_notify(),
            TlsSession::Client(conn) => conn.send_close_notify(),
        }
    }

    // Moves every pending TLS record into `out`.
    fn drain_records(&mut self, out: &mut Vec<u8>) -> Result<(), std::io::Error> {
        while self.wants_write() {
            self.write_tls(out)?;
        }
        Ok(())
    }
}

struct InboundBuffers {
    // Ciphertext read from the socket but not yet handed to rustls.
    pending: Vec<u8>,
    // Socket read target, reused across calls.
    scratch: Box<[u8]>,
}

impl InboundBuffers {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            scratch: vec![0u8; RAW_READ_SIZE].into_boxed_slice(),
        }
    }
}

/// Encrypted transport. The handshake is complete when a value exists.
pub(crate) struct TlsTransport {
    stream: TcpStream,
    session: Mutex<TlsSession>,
    // Serializes socket writes so records leave in the order rustls made them.
    write_lock: Mutex<()>,
    // Receiver-side buffers. Only the receiver thread takes this lock.
    inbound: Mutex<InboundBuffers>,
    close_notified: AtomicBool,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl TlsTransport {
    /// Runs the client handshake on a connected stream.
    pub(crate) fn connect(stream: TcpStream, context: &TlsContext, host: &str) -> Result<Self, Error> {
        let server_name = context.server_name_for(host)?;
        let conn = rustls::ClientConnection::new(context.client_config()?, server_name)
            .map_err(|e| Error::TlsClientConfigBuild(e.to_string()))?;
        Self::handshake(stream, TlsSession::Client(conn))
    }

    /// Runs the server handshake on an accepted stream.
    pub(crate) fn accept(stream: TcpStream, context: &TlsContext) -> Result<Self, Error> {
        let conn = rustls::ServerConnection::new(context.server_config()?)
            .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;
        Self::handshake(stream, TlsSession::Server(conn))
    }

    fn handshake(stream: TcpStream, mut session: TlsSession) -> Result<Self, Error> {
        let mut io = &stream;
        while session.is_handshaking() {
            match session.complete_io(&mut io) {
                Ok((0, 0)) if session.is_handshaking() => {
                    return Err(Error::TlsHandshake(
                        "Peer closed the connection during the handshake".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::TlsHandshake(err.to_string())),
            }
        }

        let mut out = Vec::new();
        session.drain_records(&mut out)?;
        (&stream).write_all(&out)?;

        debug!(peer_addr = ?stream.peer_addr().ok(), "TLS handshake complete");
        Ok(Self {
            stream,
            session: Mutex::new(session),
            write_lock: Mutex::new(()),
            inbound: Mutex::new(InboundBuffers::new()),
            close_notified: AtomicBool::new(false),
        })
    }

    fn write_raw(&self, mut buf: &[u8]) -> Result<(), TransportError> {
        while !buf.is_empty() {
            match (&self.stream).write(buf) {
                Ok(0) => return Err(TransportError::PeerClosed),
                Ok(sz) => buf = &buf[sz..],
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(classify(err)),
            }
        }
        Ok(())
    }
}

impl Transport for TlsTransport {
    fn send_all(&self, buf: &[u8]) -> Result<(), TransportError> {
        let _writer = self.write_lock.lock();
        let mut pos = 0;
        let mut records = Vec::new();

        loop {
            records.clear();
            let accepted = {
                let mut session = self.session.lock();
                let accepted = if pos < buf.len() {
                    session.writer().write(&buf[pos..])?
                } else {
                    0
                };
                session.drain_records(&mut records)?;
                accepted
            };
            pos += accepted;

            if records.is_empty() {
                if pos == buf.len() {
                    return Ok(());
                }
                // rustls refused the plaintext and had nothing to flush
                return Err(TransportError::Io(std::io::Error::from(ErrorKind::WriteZero)));
            }

            trace!(plaintext = accepted, records = records.len(), "Writing TLS records");
            self.write_raw(&records)?;

            if pos == buf.len() {
                return Ok(());
            }
        }
    }

    fn recv_exact(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut inbound = self.inbound.lock();
        let InboundBuffers { pending, scratch } = &mut *inbound;
        let mut pos = 0;

        while pos < buf.len() {
            {
                let mut session = self.session.lock();
                match session.reader().read(&mut buf[pos..]) {
                    // close_notify received
                    Ok(0) => return Err(TransportError::PeerClosed),
                    Ok(sz) => {
                        pos += sz;
                        continue;
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                    Err(err) => return Err(classify(err)),
                }

                if !pending.is_empty() {
                    let mut ciphertext: &[u8] = pending;
                    let consumed = session.read_tls(&mut ciphertext)?;
                    pending.drain(..consumed);
                    session.process_new_packets()?;
                    continue;
                }
            }

            match (&self.stream).read(scratch) {
                Ok(0) => return Err(TransportError::PeerClosed),
                Ok(sz) => {
                    trace!(len = sz, "Read TLS records from socket");
                    pending.extend_from_slice(&scratch[..sz]);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(classify(err)),
            }
        }
        Ok(())
    }

    fn close_notify(&self) {
        if self.close_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        let _writer = self.write_lock.lock();
        let mut records = Vec::new();
        {
            let mut session = self.session.lock();
            session.send_close_notify();
            if let Err(err) = session.drain_records(&mut records) {
                warn!(?err, "Could not encode close_notify");
                return;
            }
        }
        if let Err(err) = self.write_raw(&records) {
            debug!(?err, "Could not send close_notify");
        }
    }

    fn stream(&self) -> &TcpStream {
        &self.stream
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }
}
