//! Forced and graceful teardown.

use super::{ConnectionState, EngineState, Shared};
use crate::error::Error;
use crate::pool::PoolInner;
use std::io::{ErrorKind, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::Weak;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

const FORCED_STOP_GRACE: Duration = Duration::from_millis(100);
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What a graceful close observed before releasing the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseSummary {
    /// Bytes still in the kernel send queue when draining ended. `None` when
    /// the drain step was skipped (zero drain timeout) or unsupported.
    pub remaining_send_bytes: Option<usize>,
    /// Engine threads that had not finished within the timeout.
    pub threads_still_running: usize,
    /// Whether the peer closed its side before the timeout.
    pub peer_closed: bool,
}

impl Shared {
    #[instrument(skip(self), fields(id = %self.id))]
    pub(crate) fn close(&self) -> Result<(), Error> {
        // Leave every pool before touching the socket so no broadcast can
        // reach a half-closed connection. Once `closed` is set no pool can
        // add us, so the snapshot is complete.
        let pools: Vec<Weak<PoolInner>> = {
            let pools = self.pools.lock();
            if self.closed.swap(true, std::sync::atomic::Ordering::AcqRel) {
                return Err(Error::ConnectionClosed { id: self.id });
            }
            pools.values().cloned().collect()
        };
        for pool in pools.iter().filter_map(Weak::upgrade) {
            pool.evict(self);
        }
        // Back-references of pools dropped meanwhile
        self.pools.lock().clear();

        if self.engine_state() == EngineState::Started {
            if let Err(err) = self.stop_engine(FORCED_STOP_GRACE) {
                debug!(%err, "Engine stop during close failed");
            }
        }

        self.transport.close_notify();
        if let Err(err) = self.transport.stream().shutdown(Shutdown::Both) {
            if err.kind() != ErrorKind::NotConnected {
                debug!(?err, "Socket shutdown failed");
            }
        }

        let dropped = self.outbound.clear() + self.inbound.clear();
        let state = self.set_state(ConnectionState::Exited);
        info!(%state, dropped, "Connection closed");
        Ok(())
    }

    #[instrument(skip(self), fields(id = %self.id))]
    pub(crate) fn wait_close(&self, timeout: Duration) -> Result<CloseSummary, Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed { id: self.id });
        }
        let timeout = if timeout.is_zero() {
            self.config.close_timeout
        } else {
            timeout
        };
        let deadline = Instant::now() + timeout;

        self.set_state(ConnectionState::ExitRequested);
        let threads_still_running = if self.engine_state() == EngineState::Started {
            self.wait_for_tasks(timeout);
            self.running_tasks()
        } else {
            0
        };
        if threads_still_running > 0 {
            warn!(threads_still_running, "Engine did not finish before the close timeout");
        }

        self.transport.close_notify();
        let stream = self.transport.stream();
        if let Err(err) = stream.shutdown(Shutdown::Write) {
            debug!(?err, "Half-close failed");
        }

        let drain_timeout = self.options.lock().drain_timeout;
        let remaining_send_bytes = if drain_timeout.is_zero() {
            None
        } else {
            drain_send_queue(stream, drain_timeout)
        };

        let peer_closed = await_peer_close(stream, deadline);
        self.close()?;

        let summary = CloseSummary {
            remaining_send_bytes,
            threads_still_running,
            peer_closed,
        };
        info!(?summary, "Graceful close finished");
        Ok(summary)
    }
}

// Polls the kernel send queue until it is empty or `timeout` elapses.
fn drain_send_queue(stream: &TcpStream, timeout: Duration) -> Option<usize> {
    let deadline = Instant::now() + timeout;
    loop {
        let pending = match outstanding_send_bytes(stream) {
            Ok(pending) => pending,
            Err(err) => {
                debug!(?err, "Send queue depth unavailable");
                return None;
            }
        };
        let left = deadline.saturating_duration_since(Instant::now());
        if pending == 0 || left.is_zero() {
            debug!(pending, "Send queue drain finished");
            return Some(pending);
        }
        trace!(pending, "Waiting for the send queue to drain");
        thread::sleep(CLOSE_POLL_INTERVAL.min(left));
    }
}

// Reads and discards until the peer closes its side or `deadline` passes.
fn await_peer_close(stream: &TcpStream, deadline: Instant) -> bool {
    if let Err(err) = stream.set_read_timeout(Some(CLOSE_POLL_INTERVAL)) {
        debug!(?err, "Could not set the close read timeout");
        return false;
    }

    let mut reader = stream;
    let mut scratch = [0u8; 4096];
    loop {
        match reader.read(&mut scratch) {
            Ok(0) => return true,
            Ok(sz) => trace!(len = sz, "Discarding data received while closing"),
            Err(err) => match err.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => {}
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected => return true,
                _ => {
                    debug!(?err, "Read failed while closing");
                    return false;
                }
            },
        }
        if Instant::now() >= deadline {
            debug!("Peer did not close before the timeout");
            return false;
        }
    }
}

/// Bytes written but not yet acknowledged, from `SIOCOUTQ`.
#[cfg(target_os = "linux")]
pub(crate) fn outstanding_send_bytes(stream: &TcpStream) -> std::io::Result<usize> {
    use std::os::fd::AsRawFd;

    let mut pending: libc::c_int = 0;
    // SAFETY: the descriptor is valid for the lifetime of `stream` and
    // TIOCOUTQ writes exactly one c_int through the pointer.
    let rc = unsafe {
        libc::ioctl(
            stream.as_raw_fd(),
            libc::TIOCOUTQ,
            &mut pending as *mut libc::c_int,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(usize::try_from(pending).unwrap_or(0))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn outstanding_send_bytes(_stream: &TcpStream) -> std::io::Result<usize> {
    Ok(0)
}
