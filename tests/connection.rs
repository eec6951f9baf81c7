//! End-to-end tests of one connection over loopback TCP.

mod support;

use duplexnet::{
    AcceptMode, CloseSummary, Connection, ConnectionState, EngineConfig, EngineState, Error,
    SocketOption,
};
use std::thread;
use std::time::{Duration, Instant};
use support::*;

// ============================================================================
// Framing
// ============================================================================

#[test]
fn payloads_arrive_byte_identical() {
    init_tracing();
    let (client, server) = started_pair(&EngineConfig::default());

    for len in [1usize, 2, 255, 4096, 65_537, 1_000_000] {
        let payload: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
        client.enqueue(payload.clone()).unwrap();
        let received = recv(&server);
        assert_eq!(received.len(), len);
        assert_eq!(received, payload);
    }
}

#[test]
fn default_config_has_no_size_cap() {
    init_tracing();
    let (client, server) = started_pair(&EngineConfig::default());
    let payload: Vec<u8> = (0..17 * 1024 * 1024).map(|i| (i % 241) as u8).collect();

    client.enqueue(payload.clone()).unwrap();
    assert_eq!(recv(&server), payload);
    assert_eq!(server.state(), ConnectionState::Running);
}

#[test]
fn empty_payload_is_rejected() {
    init_tracing();
    let (client, _server) = started_pair(&EngineConfig::default());
    assert!(matches!(client.enqueue(Vec::new()), Err(Error::EmptyMessage)));
    assert!(matches!(client.enqueue(b"".as_slice()), Err(Error::EmptyMessage)));
}

#[test]
fn messages_keep_fifo_order() {
    init_tracing();
    let (client, server) = started_pair(&EngineConfig::default());

    for i in 0..500u32 {
        client.enqueue(i.to_be_bytes().to_vec()).unwrap();
    }
    for i in 0..500u32 {
        assert_eq!(recv(&server), i.to_be_bytes());
    }
}

#[test]
fn both_directions_run_concurrently() {
    init_tracing();
    let (client, server) = started_pair(&EngineConfig::default());
    let chunk = vec![0xabu8; 256 * 1024];

    // Enough data in both directions to fill both socket buffers at once
    for _ in 0..16 {
        client.enqueue(chunk.clone()).unwrap();
        server.enqueue(chunk.clone()).unwrap();
    }
    for _ in 0..16 {
        assert_eq!(recv(&server).len(), chunk.len());
        assert_eq!(recv(&client).len(), chunk.len());
    }
}

#[test]
fn queued_before_start_is_sent_after_start() {
    init_tracing();
    let config = EngineConfig::default();
    let listener = listener(None, &config);
    let (client, server) = connect_to(&listener, None, &config);

    client.enqueue(b"first".as_slice()).unwrap();
    client.enqueue(b"second".as_slice()).unwrap();
    assert_eq!(client.queue_status().to_send, 2);

    server.start_engine().unwrap();
    client.start_engine().unwrap();
    assert_eq!(recv(&server), b"first");
    assert_eq!(recv(&server), b"second");
    assert_eq!(client.queue_status().to_send, 0);
}

#[test]
fn queue_status_counts_unread_messages() {
    init_tracing();
    let (client, server) = started_pair(&EngineConfig::default());
    for _ in 0..3 {
        client.enqueue(b"x".as_slice()).unwrap();
    }
    let deadline = Instant::now() + PATIENCE;
    while server.queue_status().to_read < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(server.queue_status().to_read, 3);
    assert_eq!(server.clear_recv_queue(), 3);
    assert!(server.dequeue().is_none());
}

#[test]
fn send_backoff_spaces_out_messages() {
    init_tracing();
    let (client, server) = started_pair(&EngineConfig::default());
    let backoff = Duration::from_millis(20);
    client.set_option(SocketOption::SendBackoff(backoff)).unwrap();

    let count = 6u32;
    let started = Instant::now();
    for i in 0..count {
        client.enqueue(i.to_be_bytes().to_vec()).unwrap();
    }
    for i in 0..count {
        assert_eq!(recv(&server), i.to_be_bytes());
    }
    // The last message leaves only after a pause behind each earlier one
    assert!(started.elapsed() >= backoff * (count - 1));
}

#[test]
fn configured_send_backoff_is_applied() {
    init_tracing();
    let config = EngineConfig {
        send_backoff: Duration::from_millis(25),
        ..EngineConfig::default()
    };
    let (client, server) = started_pair(&config);
    assert_eq!(client.options().send_backoff, Duration::from_millis(25));

    let started = Instant::now();
    for _ in 0..4 {
        client.enqueue(b"tick".as_slice()).unwrap();
    }
    for _ in 0..4 {
        assert_eq!(recv(&server), b"tick");
    }
    assert!(started.elapsed() >= Duration::from_millis(75));
}

// ============================================================================
// State Machine
// ============================================================================

#[test]
fn stop_engine_exits_both_sides() {
    init_tracing();
    let (client, server) = started_pair(&EngineConfig::default());

    client.stop_engine(Duration::from_secs(5)).unwrap();
    assert_eq!(client.state(), ConnectionState::Exited);
    assert_eq!(client.engine_state(), EngineState::Stopped);

    // The exit frame reaches the peer, which stops accepting work
    assert_eq!(wait_not_running(&server), ConnectionState::ExitRequested);
    server.stop_engine(Duration::from_secs(5)).unwrap();
    assert_eq!(server.state(), ConnectionState::Exited);
}

#[test]
fn finished_connection_refuses_work() {
    init_tracing();
    let (client, _server) = started_pair(&EngineConfig::default());
    client.stop_engine(Duration::from_secs(5)).unwrap();

    assert!(matches!(
        client.enqueue(b"late".as_slice()),
        Err(Error::NotRunning {
            state: ConnectionState::Exited,
            ..
        })
    ));
    assert!(matches!(
        client.stop_engine(Duration::from_secs(5)),
        Err(Error::EngineNotStarted { .. })
    ));
    assert_eq!(client.state(), ConnectionState::Exited);
    assert!(client.start_engine().is_err());
}

#[test]
fn oversized_frame_is_an_error() {
    init_tracing();
    let server_config = EngineConfig {
        max_message_size: 16,
        ..EngineConfig::default()
    };
    let listener = listener(None, &server_config);
    let (client, server) = connect_to(&listener, None, &EngineConfig::default());
    client.start_engine().unwrap();
    server.start_engine().unwrap();

    client.enqueue(vec![1u8; 64]).unwrap();
    assert_eq!(wait_not_running(&server), ConnectionState::Error);
    assert!(matches!(
        server.enqueue(b"x".as_slice()),
        Err(Error::NotRunning {
            state: ConnectionState::Error,
            ..
        })
    ));

    // Error survives a stop
    server.stop_engine(Duration::from_millis(200)).unwrap();
    assert_eq!(server.state(), ConnectionState::Error);
}

#[test]
fn full_inbound_queue_is_an_error() {
    init_tracing();
    let server_config = EngineConfig {
        recv_queue_limit: Some(2),
        ..EngineConfig::default()
    };
    let listener = listener(None, &server_config);
    let (client, server) = connect_to(&listener, None, &EngineConfig::default());
    client.start_engine().unwrap();
    server.start_engine().unwrap();

    for i in 0..3u8 {
        client.enqueue(vec![i]).unwrap();
    }
    assert_eq!(wait_not_running(&server), ConnectionState::Error);
    assert_eq!(server.queue_status().to_read, 2);
}

#[test]
fn wait_message_gives_up_when_peer_leaves() {
    init_tracing();
    let (client, server) = started_pair(&EngineConfig::default());
    server.close().unwrap();

    let started = Instant::now();
    assert!(client.wait_message(POLL, None).is_none());
    assert!(started.elapsed() < PATIENCE);
    assert_eq!(client.state(), ConnectionState::ExitRequested);
}

// ============================================================================
// Close
// ============================================================================

#[test]
fn graceful_close_drains_the_send_queue() {
    init_tracing();
    let (client, server) = started_pair(&EngineConfig::default());
    client
        .set_option(SocketOption::DrainTimeout(Duration::from_secs(5)))
        .unwrap();

    let chunk = vec![7u8; 512 * 1024];
    for _ in 0..8 {
        client.enqueue(chunk.clone()).unwrap();
    }

    let peer = thread::spawn(move || {
        for _ in 0..8 {
            assert_eq!(recv(&server).len(), 512 * 1024);
        }
        wait_not_running(&server);
        server.close().unwrap();
    });

    // Only the kernel queue is left once the sender thread took everything
    let deadline = Instant::now() + PATIENCE;
    while client.queue_status().to_send > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    let summary = client.wait_close(Duration::from_secs(10)).unwrap();
    assert_eq!(
        summary,
        CloseSummary {
            remaining_send_bytes: Some(0),
            threads_still_running: 0,
            peer_closed: true,
        }
    );
    assert!(client.is_closed());
    peer.join().unwrap();
}

#[test]
fn zero_drain_timeout_skips_draining() {
    init_tracing();
    let (client, server) = started_pair(&EngineConfig::default());
    assert_eq!(client.options().drain_timeout, Duration::ZERO);

    let peer = thread::spawn(move || {
        wait_not_running(&server);
        server.close().unwrap();
    });

    let summary = client.wait_close(Duration::from_secs(10)).unwrap();
    assert_eq!(summary.remaining_send_bytes, None);
    assert!(summary.peer_closed);
    peer.join().unwrap();
}

#[test]
fn graceful_close_is_bounded_by_its_timeout() {
    init_tracing();
    let (client, _server) = started_pair(&EngineConfig::default());

    // The server never closes its side
    let started = Instant::now();
    let summary = client.wait_close(Duration::from_millis(500)).unwrap();
    assert!(!summary.peer_closed);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        client.wait_close(Duration::from_millis(500)),
        Err(Error::ConnectionClosed { .. })
    ));
}

#[test]
fn graceful_close_on_another_thread() {
    init_tracing();
    let (client, server) = started_pair(&EngineConfig::default());

    // The owner hands the handle off and keeps serving without waiting
    let closer = thread::spawn(move || client.wait_close(Duration::from_secs(10)));
    assert_eq!(wait_not_running(&server), ConnectionState::ExitRequested);
    server.close().unwrap();

    let summary = closer.join().unwrap().unwrap();
    assert!(summary.peer_closed);
    assert_eq!(summary.threads_still_running, 0);
}

#[test]
fn close_is_not_repeatable() {
    init_tracing();
    let (client, _server) = started_pair(&EngineConfig::default());
    client.close().unwrap();
    assert_eq!(client.state(), ConnectionState::Exited);
    assert_eq!(client.engine_state(), EngineState::Stopped);
    assert!(matches!(client.close(), Err(Error::ConnectionClosed { .. })));
}

// ============================================================================
// Accept Modes
// ============================================================================

#[test]
fn nonblocking_accept_without_pending_client() {
    init_tracing();
    let listener = listener(None, &EngineConfig::default());
    let started = Instant::now();
    assert!(listener.accept(AcceptMode::NonBlocking).unwrap().is_none());
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn timed_accept_gives_up() {
    init_tracing();
    let listener = listener(None, &EngineConfig::default());
    let started = Instant::now();
    assert!(listener
        .accept(AcceptMode::Timeout(Duration::from_millis(200)))
        .unwrap()
        .is_none());
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[test]
fn blocking_accept_waits_for_client() {
    init_tracing();
    let listener = listener(None, &EngineConfig::default());
    let port = listener.local_addr().port();

    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        Connection::connect("127.0.0.1", port, duplexnet::IpFamily::V4).unwrap()
    });
    let server = listener.accept(AcceptMode::Blocking).unwrap().unwrap();
    let client = client.join().unwrap();

    assert_eq!(server.role(), duplexnet::Role::Server);
    assert_eq!(client.role(), duplexnet::Role::Client);
    assert_eq!(server.peer_addr(), client.local_addr());
    assert_eq!(server.options().reuse_address, Some(true));
    assert_eq!(server.state(), ConnectionState::Running);
}

#[test]
fn nonblocking_accept_takes_pending_client() {
    init_tracing();
    let listener = listener(None, &EngineConfig::default());
    let port = listener.local_addr().port();
    let _client = Connection::connect("127.0.0.1", port, duplexnet::IpFamily::V4).unwrap();

    let deadline = Instant::now() + PATIENCE;
    let server = loop {
        if let Some(conn) = listener.accept(AcceptMode::NonBlocking).unwrap() {
            break conn;
        }
        assert!(Instant::now() < deadline, "Pending client never became ready");
        thread::sleep(Duration::from_millis(5));
    };
    assert_eq!(server.role(), duplexnet::Role::Server);
}

#[test]
fn connect_to_closed_port_fails() {
    init_tracing();
    let port = {
        let listener = listener(None, &EngineConfig::default());
        listener.local_addr().port()
    };
    assert!(matches!(
        Connection::connect("127.0.0.1", port, duplexnet::IpFamily::V4),
        Err(Error::NoAddressSucceeded { .. })
    ));
}
