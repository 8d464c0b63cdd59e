
use std::sync::Arc;

use harness::{
    assert_silent, connect_client, read_exactly, spawn_proxy, wait_until, EchoBackend,
    RecordingBackend, QUIET_PERIOD,
};
use tokio::io::AsyncWriteExt;

fn message(i: usize) -> Vec<u8> {
    format!("message_{i:04};").into_bytes()
}

#[tokio::test]
async fn drop_client_to_upstream_loses_messages_without_replay() {
    let backend = RecordingBackend::spawn().await.unwrap();
    let proxy = spawn_proxy(backend.addr).await;
    let (mut client, conn) = connect_client(&proxy).await;

    let mut expected = Vec::new();
    for i in 0..10 {
        client.write_all(&message(i)).await.unwrap();
        expected.extend_from_slice(&message(i));
    }
    backend.wait_for_received(&expected).await;

    let report = proxy.execute(|c| c.client_to_upstream().set_drop(true));
    assert_eq!(report.visited, 1);

    // Sends keep succeeding; the relay drains and discards.
    let mut dropped_len = 0;
    for i in 10..15 {
        client.write_all(&message(i)).await.unwrap();
        dropped_len += message(i).len() as u64;
    }
    wait_until("dropped bytes are drained", || {
        let conn = Arc::clone(&conn);
        async move { conn.client_to_upstream().bytes_dropped() == dropped_len }
    })
    .await;
    assert_eq!(backend.received().await, expected);
    assert!(!conn.is_disposed());
    assert_eq!(proxy.connection_count(), 1);

    proxy.execute(|c| c.client_to_upstream().set_drop(false));
    for i in 15..20 {
        client.write_all(&message(i)).await.unwrap();
        expected.extend_from_slice(&message(i));
    }
    backend.wait_for_received(&expected).await;

    assert_eq!(proxy.stats().bytes_dropped, dropped_len);
}

#[tokio::test]
async fn drop_upstream_to_client_keeps_connection_open() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = spawn_proxy(backend.addr).await;
    let (mut client, conn) = connect_client(&proxy).await;

    conn.upstream_to_client().set_drop(true);
    client.write_all(b"ping").await.unwrap();

    // The upstream got the request and answered; the answer was discarded.
    wait_until("echo reply is dropped", || {
        let conn = Arc::clone(&conn);
        async move { conn.upstream_to_client().bytes_dropped() == 4 }
    })
    .await;
    assert_silent(&mut client).await;
    assert!(!conn.is_disposed());

    conn.upstream_to_client().set_drop(false);
    client.write_all(b"pong").await.unwrap();
    assert_eq!(read_exactly(&mut client, 4).await, b"pong");
}

#[tokio::test]
async fn suspend_client_to_upstream_stalls_then_delivers() {
    let backend = RecordingBackend::spawn().await.unwrap();
    let proxy = spawn_proxy(backend.addr).await;
    let (mut client, _conn) = connect_client(&proxy).await;

    client.write_all(b"first;").await.unwrap();
    backend.wait_for_received(b"first;").await;

    proxy.execute(|c| c.client_to_upstream().set_suspended(true));
    client.write_all(b"second;").await.unwrap();
    client.write_all(b"third;").await.unwrap();

    tokio::time::sleep(QUIET_PERIOD).await;
    assert_eq!(backend.received().await, b"first;");

    proxy.execute(|c| c.client_to_upstream().set_suspended(false));
    backend.wait_for_received(b"first;second;third;").await;
}

#[tokio::test]
async fn suspend_upstream_to_client_stalls_reads_until_resumed() {
    let backend = RecordingBackend::spawn().await.unwrap();
    let proxy = spawn_proxy(backend.addr).await;
    let (mut client, conn) = connect_client(&proxy).await;

    client.write_all(b"hello").await.unwrap();
    backend.wait_for_received(b"hello").await;

    proxy.execute(|c| c.upstream_to_client().set_suspended(true));
    assert!(conn.upstream_to_client().is_suspended());

    // The upstream keeps producing while the client sees nothing.
    for i in 0..5 {
        backend.send(0, &message(i)).await.unwrap();
    }
    assert_silent(&mut client).await;

    proxy.execute(|c| c.upstream_to_client().set_suspended(false));

    let expected: Vec<u8> = (0..5).flat_map(message).collect();
    assert_eq!(read_exactly(&mut client, expected.len()).await, expected);
    assert_eq!(conn.upstream_to_client().bytes_dropped(), 0);
}

#[tokio::test]
async fn faults_on_both_directions_are_independent() {
    let backend = RecordingBackend::spawn().await.unwrap();
    let proxy = spawn_proxy(backend.addr).await;
    let (mut client, conn) = connect_client(&proxy).await;

    client.write_all(b"sync").await.unwrap();
    backend.wait_for_received(b"sync").await;

    // Drop requests, stall responses.
    proxy.execute(|c| {
        c.client_to_upstream().set_drop(true);
        c.upstream_to_client().set_suspended(true);
    });
    assert!(conn.client_to_upstream().is_dropping());
    assert!(!conn.client_to_upstream().is_suspended());
    assert!(conn.upstream_to_client().is_suspended());
    assert!(!conn.upstream_to_client().is_dropping());

    client.write_all(b"request").await.unwrap();
    backend.send(0, b"response").await.unwrap();
    wait_until("request is dropped", || {
        let conn = Arc::clone(&conn);
        async move { conn.client_to_upstream().bytes_dropped() == 7 }
    })
    .await;
    assert_silent(&mut client).await;

    proxy.execute(|c| {
        c.client_to_upstream().reset();
        c.upstream_to_client().reset();
    });

    assert_eq!(read_exactly(&mut client, 8).await, b"response");
    client.write_all(b"again").await.unwrap();
    backend.wait_for_received(b"syncagain").await;
}

#[tokio::test]
async fn faults_apply_to_every_live_connection() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = spawn_proxy(backend.addr).await;
    let (mut first, _) = connect_client(&proxy).await;
    let (mut second, _) = connect_client(&proxy).await;

    let report = proxy.execute(|c| c.upstream_to_client().set_suspended(true));
    assert_eq!(report.visited, 2);
    assert_eq!(report.failed, 0);

    first.write_all(b"one").await.unwrap();
    second.write_all(b"two").await.unwrap();
    assert_silent(&mut first).await;
    assert_silent(&mut second).await;

    proxy.execute(|c| c.upstream_to_client().set_suspended(false));
    assert_eq!(read_exactly(&mut first, 3).await, b"one");
    assert_eq!(read_exactly(&mut second, 3).await, b"two");
}
