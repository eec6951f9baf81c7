//! Sender and receiver threads of one connection.
//!
//! The sender sleeps on the work semaphore and writes queued messages in FIFO
//! order. On `ExitRequested` it writes the exit frame and stops. The receiver
//! blocks on the transport, pushes every data frame onto the inbound queue
//! and stops when the peer's exit frame arrives. A task that ends cleanly
//! requests exit; a task that fails moves the connection to `Error`.

use super::{ConnectionState, EngineState, Shared};
use crate::error::{Error, TransportError};
use crate::wire::{self, Frame};
use std::net::Shutdown;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

// How often stop posts the semaphore so an idle sender sees the new state.
const STOP_NUDGES: usize = 10;
const STOP_NUDGE_INTERVAL: Duration = Duration::from_millis(1);
const TASK_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
pub(crate) struct EngineThreads {
    sender: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
}

// Decrements the running-task counter when a task ends, even by panic.
struct RunningTask<'a>(&'a AtomicUsize);

impl Drop for RunningTask<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Start / Stop
// ============================================================================

impl Shared {
    #[instrument(skip(self), fields(id = %self.id))]
    pub(crate) fn start_engine(self: &Arc<Self>) -> Result<(), Error> {
        let mut threads = self.threads.lock();
        if self.is_closed() {
            return Err(Error::ConnectionClosed { id: self.id });
        }
        {
            let pair = self.state.lock();
            if pair.engine == EngineState::Started {
                return Err(Error::EngineAlreadyStarted { id: self.id });
            }
            if !pair.connection.accepts_work() {
                return Err(Error::NotRunning {
                    id: self.id,
                    state: pair.connection,
                });
            }
        }

        let receiver = self.spawn_task("recv", receiver_task)?;
        let sender = match self.spawn_task("send", sender_task) {
            Ok(handle) => handle,
            Err(err) => {
                error!(%err, "Could not spawn the sender thread");
                self.set_state(ConnectionState::Error);
                let _ = self.transport.stream().shutdown(Shutdown::Both);
                if receiver.join().is_err() {
                    error!("Receiver thread panicked");
                }
                return Err(err);
            }
        };

        threads.sender = Some(sender);
        threads.receiver = Some(receiver);
        self.state.lock().engine = EngineState::Started;
        info!("Engine started");
        Ok(())
    }

    fn spawn_task(
        self: &Arc<Self>,
        name: &str,
        task: fn(&Shared) -> Result<(), TransportError>,
    ) -> Result<JoinHandle<()>, Error> {
        let shared = Arc::clone(self);
        self.running_tasks.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(format!("duplexnet-{name}-{}", self.id))
            .spawn(move || {
                let _running = RunningTask(&shared.running_tasks);
                let outcome = task(&shared);
                shared.finish_task(outcome);
            });
        spawned.map_err(|err| {
            self.running_tasks.fetch_sub(1, Ordering::AcqRel);
            Error::Io(err)
        })
    }

    fn finish_task(&self, outcome: Result<(), TransportError>) {
        let task = thread::current().name().unwrap_or("engine").to_string();
        match outcome {
            Ok(()) => {
                debug!(id = %self.id, %task, "Engine task finished");
                self.set_state(ConnectionState::ExitRequested);
            }
            Err(err) if err.is_disconnect() => {
                info!(id = %self.id, %task, peer_addr = %self.peer_addr, "Peer disconnected");
                self.set_state(ConnectionState::ExitRequested);
            }
            Err(err) => {
                error!(id = %self.id, %task, %err, "Engine task failed");
                self.set_state(ConnectionState::Error);
            }
        }
    }

    #[instrument(skip(self), fields(id = %self.id))]
    pub(crate) fn stop_engine(&self, timeout: Duration) -> Result<(), Error> {
        let mut threads = self.threads.lock();
        if self.engine_state() != EngineState::Started {
            return Err(Error::EngineNotStarted { id: self.id });
        }

        self.set_state(ConnectionState::ExitRequested);
        for _ in 0..STOP_NUDGES {
            self.work.post();
            thread::sleep(STOP_NUDGE_INTERVAL);
        }

        if !self.wait_for_tasks(timeout) {
            warn!(
                running = self.running_tasks.load(Ordering::Acquire),
                "Engine tasks still running, shutting the socket down"
            );
            if let Err(err) = self.transport.stream().shutdown(Shutdown::Both) {
                debug!(?err, "Socket shutdown failed");
            }
        }

        for handle in [threads.sender.take(), threads.receiver.take()].into_iter().flatten() {
            if handle.join().is_err() {
                error!("Engine thread panicked");
                self.set_state(ConnectionState::Error);
            }
        }

        let final_state = {
            let mut pair = self.state.lock();
            pair.connection = pair.connection.advance(ConnectionState::Exited);
            pair.engine = EngineState::Stopped;
            pair.connection
        };
        info!(state = %final_state, "Engine stopped");
        Ok(())
    }

    /// Polls the running-task counter until it reaches zero or `timeout`
    /// elapses. Returns true if every task finished.
    pub(crate) fn wait_for_tasks(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.running_tasks.load(Ordering::Acquire) == 0 {
                return true;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            thread::sleep(TASK_POLL_INTERVAL.min(left));
        }
    }

    pub(crate) fn running_tasks(&self) -> usize {
        self.running_tasks.load(Ordering::Acquire)
    }
}

// ============================================================================
// Tasks
// ============================================================================

fn sender_task(shared: &Shared) -> Result<(), TransportError> {
    let transport = shared.transport.as_ref();
    loop {
        shared.work.wait();

        // One permit per message, but drain whatever is queued anyway.
        loop {
            match shared.state() {
                ConnectionState::Exited | ConnectionState::Error => return Ok(()),
                ConnectionState::ExitRequested => {
                    return match wire::write_exit(transport) {
                        // the peer left first; nothing to announce
                        Err(err) if err.is_disconnect() => Ok(()),
                        other => other,
                    };
                }
                ConnectionState::Running => {}
            }

            let Some(message) = shared.outbound.pop() else {
                break;
            };
            wire::write_frame(transport, ConnectionState::Running, &message)?;
            trace!(id = %shared.id, len = message.len(), "Message sent");

            let backoff = shared.options.lock().send_backoff;
            if !backoff.is_zero() {
                thread::sleep(backoff);
            }
        }
    }
}

fn receiver_task(shared: &Shared) -> Result<(), TransportError> {
    let transport = shared.transport.as_ref();
    let max_payload = shared.max_message_size();
    loop {
        if !shared.state().accepts_work() {
            return Ok(());
        }

        match wire::read_frame(transport, max_payload)? {
            Frame::Exit => {
                debug!(id = %shared.id, "Peer requested exit");
                return Ok(());
            }
            Frame::Data(payload) => {
                let len = payload.len();
                shared
                    .inbound
                    .push(payload)
                    .map_err(|full| TransportError::InboundQueueFull { limit: full.limit })?;
                trace!(id = %shared.id, len, "Message received");
            }
        }
    }
}
