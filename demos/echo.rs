//! Minimal echo server and client.
//!
//! ```bash
//! cargo run --example echo -- server --port 7001
//! cargo run --example echo -- client --port 7001 hello world
//! ```

use clap::{Parser, Subcommand};
use duplexnet::prelude::*;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(2);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(author, version, about = "Echo demo", long_about = None)]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Mode {
    /// Echo every message back to its sender
    Server {
        #[arg(short, long, default_value_t = 7001)]
        port: u16,
    },
    /// Send each word and print the echoes
    Client {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value_t = 7001)]
        port: u16,
        words: Vec<String>,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    if args.verbose > 0 {
        let level = match args.verbose {
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(format!("duplexnet={level}")))
            .with_writer(std::io::stderr)
            .init();
    }

    let result = match args.mode {
        Mode::Server { port } => serve(port),
        Mode::Client { host, port, words } => ask(&host, port, &words),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn serve(port: u16) -> Result<(), Error> {
    let listener = Listener::listen(None, port, 16, IpFamily::Any)?;
    println!("Echoing on {}", listener.local_addr());

    // One client at a time
    while let Some(conn) = listener.accept(AcceptMode::Blocking)? {
        conn.start_engine()?;
        while let Some(message) = conn.wait_message(POLL_INTERVAL, None) {
            conn.enqueue(message)?;
        }
        let summary = conn.wait_close(Duration::ZERO)?;
        println!("{} done: {summary:?}", conn.peer_addr());
    }
    Ok(())
}

fn ask(host: &str, port: u16, words: &[String]) -> Result<(), Error> {
    let conn = Connection::connect(host, port, IpFamily::Any)?;
    conn.start_engine()?;

    for word in words {
        conn.enqueue(word.as_bytes())?;
        match conn.wait_message(POLL_INTERVAL, Some(REPLY_TIMEOUT)) {
            Some(reply) => println!("{}", String::from_utf8_lossy(&reply)),
            None => println!("(no reply)"),
        }
    }

    conn.wait_close(Duration::from_secs(2))?;
    Ok(())
}
