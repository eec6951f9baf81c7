//! Helpers shared by the integration tests.
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! # Info level (equivalent to -v)
//! TEST_LOG=1 cargo test --test connection -- --nocapture
//!
//! # Debug level (equivalent to -vv)
//! TEST_LOG=2 cargo test --test connection -- --nocapture
//!
//! # Trace level (equivalent to -vvv)
//! TEST_LOG=3 cargo test --test connection -- --nocapture
//! ```

#![allow(dead_code)]

use duplexnet::prelude::*;
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

static INIT: Once = Once::new();

pub const POLL: Duration = Duration::from_millis(1);
pub const PATIENCE: Duration = Duration::from_secs(10);

/// Initialize tracing based on TEST_LOG environment variable
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("duplexnet={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_thread_names(true)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

/// Loopback listener on an ephemeral port.
pub fn listener(tls: Option<Arc<TlsContext>>, config: &EngineConfig) -> Listener {
    Listener::listen_with(Some("127.0.0.1"), 0, 16, IpFamily::V4, tls, config)
        .expect("Failed to listen")
}

/// Client connection to `listener`, established from a helper thread while
/// the listener accepts. Returns (client, server). Engines are not started.
pub fn connect_to(
    listener: &Listener,
    tls: Option<Arc<TlsContext>>,
    config: &EngineConfig,
) -> (Connection, Connection) {
    let port = listener.local_addr().port();
    let client_config = config.clone();
    let client = thread::spawn(move || {
        Connection::connect_with("127.0.0.1", port, IpFamily::V4, tls, &client_config)
            .expect("Failed to connect")
    });
    let server = listener
        .accept(AcceptMode::Timeout(PATIENCE))
        .expect("Accept failed")
        .expect("Accept timed out");
    (client.join().unwrap(), server)
}

/// Connected pair with both engines running.
pub fn started_pair(config: &EngineConfig) -> (Connection, Connection) {
    let listener = listener(None, config);
    let (client, server) = connect_to(&listener, None, config);
    client.start_engine().expect("Failed to start client engine");
    server.start_engine().expect("Failed to start server engine");
    (client, server)
}

pub fn recv(conn: &Connection) -> Vec<u8> {
    conn.wait_message(POLL, Some(PATIENCE))
        .expect("No message before timeout")
}

/// Waits until `conn` leaves `Running`.
pub fn wait_not_running(conn: &Connection) -> ConnectionState {
    let deadline = std::time::Instant::now() + PATIENCE;
    loop {
        let state = conn.state();
        if state != ConnectionState::Running || std::time::Instant::now() > deadline {
            return state;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
