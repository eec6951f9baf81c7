//! Plain TCP transport.

use super::{classify, Transport, TransportKind};
use crate::error::TransportError;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use tracing::trace;

/// Blocking socket I/O without encryption.
///
/// `&TcpStream` implements both `Read` and `Write`, so the sender and the
/// receiver thread share the stream without a lock.
#[derive(Debug)]
pub(crate) struct PlainTransport {
    stream: TcpStream,
}

impl PlainTransport {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Transport for PlainTransport {
    fn send_all(&self, mut buf: &[u8]) -> Result<(), TransportError> {
        while !buf.is_empty() {
            match (&self.stream).write(buf) {
                Ok(0) => return Err(TransportError::PeerClosed),
                Ok(sz) => {
                    trace!(len = sz, remaining = buf.len() - sz, "Wrote to socket");
                    buf = &buf[sz..];
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(classify(err)),
            }
        }
        Ok(())
    }

    fn recv_exact(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut pos = 0;
        while pos < buf.len() {
            match (&self.stream).read(&mut buf[pos..]) {
                Ok(0) => return Err(TransportError::PeerClosed),
                Ok(sz) => {
                    trace!(len = sz, "Read from socket");
                    pos += sz;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(classify(err)),
            }
        }
        Ok(())
    }

    fn stream(&self) -> &TcpStream {
        &self.stream
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Plain
    }
}

// Two plain transports connected over loopback.
#[cfg(test)]
pub(crate) fn loopback_pair() -> (PlainTransport, PlainTransport) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = std::thread::spawn(move || TcpStream::connect(addr).unwrap());
    let (server, _) = listener.accept().unwrap();
    (
        PlainTransport::new(client.join().unwrap()),
        PlainTransport::new(server),
    )
}
