//! Relays every message a client sends to all other connected clients.
//!
//! ```bash
//! cargo run --example broadcast_server -- --port 7000 -vv
//! ```
//!
//! With a config file containing `tls_server_cert` and `tls_server_key`, the
//! server only accepts TLS clients.

use clap::Parser;
use config::Config;
use duplexnet::prelude::*;
use duplexnet::ConnectionId;
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

const ACCEPT_TIMEOUT: Duration = Duration::from_millis(50);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for duplexnet crate based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return, // No tracing
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("duplexnet={},broadcast_server={}", level, level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(author, version, about = "Broadcast server", long_about = None)]
struct Args {
    /// Address to bind to (all interfaces if omitted)
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long, default_value_t = 7000)]
    port: u16,

    /// Listen backlog
    #[arg(long, default_value_t = 64)]
    backlog: i32,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path (TOML format)
    #[arg(long)]
    config: Option<String>,
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = if let Some(config_path) = &args.config {
        match Config::builder()
            .add_source(config::File::with_name(config_path))
            .build()
        {
            Ok(c) => c,
            Err(err) => {
                eprintln!("Failed to load config file '{}': {}", config_path, err);
                return ExitCode::FAILURE;
            }
        }
    } else {
        Config::default()
    };

    let engine_config = match EngineConfig::from_config_named(&config, "server") {
        Ok(c) => c,
        Err(err) => {
            eprintln!("Invalid engine configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let tls = match TlsContext::from_config_named(&config, "server") {
        Ok(context) if context.can_accept() => Some(Arc::new(context)),
        Ok(_) => None,
        Err(err) => {
            eprintln!("Invalid TLS configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let listener = match Listener::listen_with(
        args.bind.as_deref(),
        args.port,
        args.backlog,
        engine_config.ip_family,
        tls,
        &engine_config,
    ) {
        Ok(l) => l,
        Err(err) => {
            eprintln!("Failed to listen on port {}: {err}", args.port);
            return ExitCode::FAILURE;
        }
    };
    println!(
        "Listening on {} ({})",
        listener.local_addr(),
        if listener.is_encrypted() { "TLS" } else { "TCP" }
    );

    match run(&listener) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Server failed: {err}");
            ExitCode::FAILURE
        }
    }
}

// ============================================================================
// Relay Loop
// ============================================================================

fn run(listener: &Listener) -> Result<(), Error> {
    let pool = ConnectionPool::new(64);
    let mut clients: HashMap<ConnectionId, Connection> = HashMap::new();

    loop {
        // New clients join the pool as soon as their engine runs
        match listener.accept(AcceptMode::Timeout(ACCEPT_TIMEOUT)) {
            Ok(Some(conn)) => {
                conn.start_engine()?;
                pool.add(&conn)?;
                println!("[{}] joined from {}", conn.id(), conn.peer_addr());
                clients.insert(conn.id(), conn);
            }
            Ok(None) => {}
            Err(err) => eprintln!("Accept failed: {err}"),
        }

        for conn in clients.values() {
            while let Some(message) = conn.dequeue() {
                let delivered = pool.broadcast(Some(conn), &message)?;
                println!(
                    "[{}] {} bytes relayed to {} clients",
                    conn.id(),
                    message.len(),
                    delivered
                );
            }
        }

        let finished: Vec<ConnectionId> = clients
            .iter()
            .filter(|(_, conn)| conn.state() != ConnectionState::Running)
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            if let Some(conn) = clients.remove(&id) {
                // Leave the pool now and close off the relay loop
                if let Err(err) = pool.remove(&conn) {
                    eprintln!("[{id}] {err}");
                }
                thread::spawn(move || {
                    let state = conn.state();
                    match conn.wait_close(CLOSE_TIMEOUT) {
                        Ok(summary) => println!("[{id}] left ({state}, {summary:?})"),
                        Err(err) => eprintln!("[{id}] close failed: {err}"),
                    }
                });
            }
        }
    }
}
