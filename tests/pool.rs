//! Connection pool behavior with live connections.

mod support;

use duplexnet::{Connection, ConnectionPool, EngineConfig, Error};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use support::*;

// Server side handles in a pool, each with its connected client.
fn star(size: usize) -> (ConnectionPool, Vec<Connection>, Vec<Connection>) {
    let config = EngineConfig::default();
    let listener = listener(None, &config);
    let pool = ConnectionPool::new(size);
    let mut clients = Vec::new();
    let mut servers = Vec::new();
    for _ in 0..size {
        let (client, server) = connect_to(&listener, None, &config);
        client.start_engine().unwrap();
        server.start_engine().unwrap();
        pool.add(&server).unwrap();
        clients.push(client);
        servers.push(server);
    }
    (pool, clients, servers)
}

#[test]
fn broadcast_skips_the_sender() {
    init_tracing();
    let (pool, clients, servers) = star(3);

    let delivered = pool.broadcast(Some(&servers[0]), b"hello").unwrap();
    assert_eq!(delivered, 2);

    assert_eq!(recv(&clients[1]), b"hello");
    assert_eq!(recv(&clients[2]), b"hello");
    assert!(clients[0]
        .wait_message(POLL, Some(Duration::from_millis(200)))
        .is_none());
}

#[test]
fn broadcast_without_origin_reaches_everyone() {
    init_tracing();
    let (pool, clients, _servers) = star(4);

    assert_eq!(pool.broadcast(None, b"all").unwrap(), 4);
    for client in &clients {
        assert_eq!(recv(client), b"all");
    }
}

#[test]
fn relay_from_member_to_others() {
    init_tracing();
    let (pool, clients, servers) = star(3);

    clients[2].enqueue(b"from c".as_slice()).unwrap();
    let message = recv(&servers[2]);
    pool.broadcast(Some(&servers[2]), &message).unwrap();

    assert_eq!(recv(&clients[0]), b"from c");
    assert_eq!(recv(&clients[1]), b"from c");
}

#[test]
fn duplicate_add_is_rejected() {
    init_tracing();
    let (pool, _clients, servers) = star(1);

    assert!(matches!(
        pool.add(&servers[0]),
        Err(Error::AlreadyInPool { .. })
    ));
    assert_eq!(pool.count(), 1);
}

#[test]
fn close_leaves_every_pool() {
    init_tracing();
    let config = EngineConfig::default();
    let listener = listener(None, &config);
    let first = ConnectionPool::new(4);
    let second = ConnectionPool::new(4);

    let (_client, server) = connect_to(&listener, None, &config);
    first.add(&server).unwrap();
    second.add(&server).unwrap();
    assert_eq!(first.count(), 1);
    assert_eq!(second.count(), 1);

    server.close().unwrap();
    assert_eq!(first.count(), 0);
    assert_eq!(second.count(), 0);
    assert!(matches!(first.add(&server), Err(Error::ConnectionClosed { .. })));

    // A new handle can take the place of the old one
    let (_client2, replacement) = connect_to(&listener, None, &config);
    first.add(&replacement).unwrap();
    assert_eq!(first.count(), 1);
    assert_eq!(first.members(), vec![replacement.id()]);
}

#[test]
fn dropped_connection_leaves_the_pool() {
    init_tracing();
    let (pool, clients, mut servers) = star(2);
    let gone = servers.remove(0);
    drop(gone);
    assert_eq!(pool.count(), 1);

    assert_eq!(pool.broadcast(None, b"left").unwrap(), 1);
    assert_eq!(recv(&clients[1]), b"left");
}

#[test]
fn remove_twice_reports_missing_member() {
    init_tracing();
    let (pool, _clients, servers) = star(2);
    pool.remove(&servers[1]).unwrap();
    assert!(matches!(
        pool.remove(&servers[1]),
        Err(Error::NotInPool { .. })
    ));
    assert!(!pool.contains(&servers[1]));
    assert_eq!(pool.count(), 1);
}

#[test]
fn broadcast_to_finished_members_reaches_nobody() {
    init_tracing();
    let (pool, _clients, servers) = star(2);
    for server in &servers {
        server.request_exit();
    }
    assert_eq!(pool.broadcast(None, b"nobody").unwrap(), 0);
}

#[test]
fn concurrent_broadcast_and_close() {
    init_tracing();
    let (pool, _clients, servers) = star(6);
    let servers: Vec<Arc<Connection>> = servers.into_iter().map(Arc::new).collect();

    let broadcasters: Vec<_> = (0..4)
        .map(|i| {
            let pool = pool.clone();
            thread::spawn(move || {
                for n in 0..200u32 {
                    let message = [i as u8, (n % 256) as u8];
                    pool.broadcast(None, &message).unwrap();
                }
            })
        })
        .collect();

    for server in &servers {
        server.close().unwrap();
        thread::sleep(Duration::from_millis(2));
    }
    for handle in broadcasters {
        handle.join().unwrap();
    }

    assert_eq!(pool.count(), 0);
    assert_eq!(pool.broadcast(None, b"empty").unwrap(), 0);
}
