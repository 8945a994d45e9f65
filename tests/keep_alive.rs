//! Server-side liveness checks

mod common;

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};

use common::{local, wait_for_connections, Event, Text, WAIT};
use swiftsocket::transport::{ACK_TOKEN, CONNECT_TOKEN};
use swiftsocket::{Client, KeepAliveSettings, Server, TransportKind};

fn pinging_server(kind: TransportKind) -> Server<Event> {
    let server = Server::new(local(kind).with_keep_alive(100, 200));
    server.register_inbound_type::<Text>(1).unwrap();
    server
}

#[tokio::test]
async fn test_silent_datagram_peer_is_dropped() {
    let server = pinging_server(TransportKind::Datagram);
    let addr = server.start().await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(CONNECT_TOKEN.as_bytes(), addr).await.unwrap();

    let mut buf = [0u8; 64];
    let len = tokio::time::timeout(WAIT, socket.recv(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..len], ACK_TOKEN.as_bytes());
    assert!(wait_for_connections(&server, 1).await);
    let context = server.contexts().await.remove(0);

    let len = tokio::time::timeout(WAIT, socket.recv(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..len], b"999\n");
    assert!(context.last_ping().is_some());

    // Never answer
    assert!(wait_for_connections(&server, 0).await);
    assert!(!context.is_active());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_silent_stream_peer_is_dropped() {
    let server = pinging_server(TransportKind::Stream);
    let addr = server.start().await.unwrap();

    let stream = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for_connections(&server, 1).await);

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    tokio::time::timeout(WAIT, reader.read_line(&mut line)).await.unwrap().unwrap();
    assert_eq!(line, "999\n");

    assert!(wait_for_connections(&server, 0).await);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_answering_client_stays_connected() {
    for kind in [TransportKind::Stream, TransportKind::Datagram] {
        let server = pinging_server(kind);
        let addr = server.start().await.unwrap();

        let client: Client<Event> = Client::new(local(kind));
        client.connect(addr).await.unwrap();
        assert!(wait_for_connections(&server, 1).await);

        // Several ping rounds, each well past the pong timeout
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert_eq!(server.connection_count().await, 1);
        assert!(client.is_connected().await);
        let context = server.contexts().await.remove(0);
        assert!(context.last_ping().is_some());

        server.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_keep_alive_applies_to_new_connections() {
    let server: Server<Event> = Server::new(local(TransportKind::Stream));
    assert!(!server.keep_alive().enabled);
    let addr = server.start().await.unwrap();

    let _unpinged = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for_connections(&server, 1).await);

    server.set_keep_alive(KeepAliveSettings::enabled(100, 200));
    let pinged = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for_connections(&server, 2).await);

    let mut reader = BufReader::new(pinged);
    let mut line = String::new();
    tokio::time::timeout(WAIT, reader.read_line(&mut line)).await.unwrap().unwrap();
    assert_eq!(line, "999\n");

    // Only the connection opened after the change gets dropped
    assert!(wait_for_connections(&server, 1).await);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(server.connection_count().await, 1);

    server.stop().await.unwrap();
}
