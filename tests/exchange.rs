//! Server and client exchanging messages over loopback sockets

mod common;

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};

use common::{local, wait_for_connections, Event, Journal, Text, WAIT};
use swiftsocket::protocol::{FrameError, ProtocolError, MAX_FRAME_SIZE};
use swiftsocket::{Client, ExecuteError, Server, TransportKind};

fn text_server(kind: TransportKind) -> Server<Event> {
    let server = Server::new(local(kind));
    server.register_inbound_type::<Text>(1).unwrap();
    server.register_outbound::<Text>(1).unwrap();
    server
}

fn text_client(kind: TransportKind) -> Client<Event> {
    let client = Client::new(local(kind));
    client.register_inbound_type::<Text>(1).unwrap();
    client.register_outbound::<Text>(1).unwrap();
    client
}

#[tokio::test]
async fn test_broadcast_wire_format_over_stream() {
    let server = text_server(TransportKind::Stream);
    let addr = server.start().await.unwrap();

    let stream = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for_connections(&server, 1).await);

    assert_eq!(server.broadcast(&Text::new("hi")).await.unwrap(), 1);

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    tokio::time::timeout(WAIT, reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line, "0012|hi\n");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_datagram_broadcast_reaches_each_client_once() {
    let server = text_server(TransportKind::Datagram);
    let addr = server.start().await.unwrap();

    let first = text_client(TransportKind::Datagram);
    let second = text_client(TransportKind::Datagram);
    first.connect(addr).await.unwrap();
    second.connect(addr).await.unwrap();
    assert!(wait_for_connections(&server, 2).await);

    assert_eq!(server.broadcast(&Text::new("tick")).await.unwrap(), 2);

    for client in [&first, &second] {
        let received = tokio::time::timeout(WAIT, client.next_message())
            .await
            .unwrap()
            .unwrap();
        let (_, body) = received.into_body().unwrap();
        assert_eq!(body, Event::Text(Text::new("tick")));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!first.has_queued_messages());
    assert!(!second.has_queued_messages());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_messages_are_queued_in_order() {
    for kind in [TransportKind::Stream, TransportKind::Datagram] {
        let server = text_server(kind);
        let addr = server.start().await.unwrap();

        let client = text_client(kind);
        client.connect(addr).await.unwrap();
        for text in ["one", "two", "three"] {
            client.send(&Text::new(text)).await.unwrap();
        }

        let mut journal = Journal::default();
        for _ in 0..3 {
            let received = tokio::time::timeout(WAIT, server.next_message())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received.context.transport_kind(), Some(kind));
            received.execute(&mut journal).unwrap();
        }
        assert_eq!(journal.entries, vec!["text:one", "text:two", "text:three"]);

        server.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_server_reply_to_sender() {
    let server = text_server(TransportKind::Stream);
    let addr = server.start().await.unwrap();

    let client = text_client(TransportKind::Stream);
    client.connect(addr).await.unwrap();
    client.send(&Text::new("ping me")).await.unwrap();

    let received = tokio::time::timeout(WAIT, server.next_message())
        .await
        .unwrap()
        .unwrap();
    server
        .send(&received.context, &Text::new("pinged"))
        .await
        .unwrap();

    let reply = tokio::time::timeout(WAIT, client.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.into_body().unwrap().1, Event::Text(Text::new("pinged")));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_datagram_handshake_rejects_other_first_packet() {
    let server = text_server(TransportKind::Datagram);
    let addr = server.start().await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(b"HELLO", addr).await.unwrap();

    let received = tokio::time::timeout(WAIT, server.next_message())
        .await
        .unwrap()
        .unwrap();
    assert!(received.is_invalid());
    assert_eq!(received.context.peer_addr(), socket.local_addr().unwrap());
    assert!(!received.context.is_active());

    let mut journal = Journal::default();
    match received.execute(&mut journal) {
        Err(ExecuteError::Invalid { source, raw, .. }) => {
            assert!(matches!(source, ProtocolError::Handshake { .. }));
            assert_eq!(raw, "HELLO");
        }
        other => panic!("Expected handshake rejection, got {:?}", other),
    }
    assert_eq!(server.connection_count().await, 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_message_id_is_queued_as_invalid() {
    let server = text_server(TransportKind::Stream);
    let addr = server.start().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"0421|x\n0012|ok\n").await.unwrap();

    let invalid = tokio::time::timeout(WAIT, server.next_message())
        .await
        .unwrap()
        .unwrap();
    assert!(invalid.is_invalid());
    assert_eq!(invalid.id(), Some(42));

    let valid = tokio::time::timeout(WAIT, server.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(valid.into_body().unwrap().1, Event::Text(Text::new("ok")));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_bye_bye_deactivates_context() {
    let server = text_server(TransportKind::Stream);
    let addr = server.start().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for_connections(&server, 1).await);
    let context = server.contexts().await.remove(0);
    assert!(context.is_active());

    stream.write_all(b"998\n0012|late\n").await.unwrap();

    assert!(wait_for_connections(&server, 0).await);
    assert!(context.said_goodbye());
    assert!(!context.is_active());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!server.has_queued_messages());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_stop_waves_goodbye() {
    let server = text_server(TransportKind::Datagram);
    let addr = server.start().await.unwrap();

    let client = text_client(TransportKind::Datagram);
    client.connect(addr).await.unwrap();
    assert!(wait_for_connections(&server, 1).await);

    client.stop().await.unwrap();
    assert!(!client.is_running());
    assert!(!client.is_connected().await);
    assert!(wait_for_connections(&server, 0).await);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_stop_lets_connections_close_themselves() {
    let server = text_server(TransportKind::Stream);
    let addr = server.start().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for_connections(&server, 1).await);
    let context = server.contexts().await.remove(0);

    server.stop().await.unwrap();
    assert!(!server.is_running());

    assert!(wait_for_connections(&server, 0).await);
    assert!(!context.is_active());

    // Closed without a bye-bye
    let mut received = String::new();
    tokio::time::timeout(WAIT, stream.read_to_string(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, "");
}

#[tokio::test]
async fn test_undecodable_bytes_keep_connection_open() {
    let server = text_server(TransportKind::Stream);
    let addr = server.start().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"001\xff\n0012|ok\n").await.unwrap();

    let invalid = tokio::time::timeout(WAIT, server.next_message())
        .await
        .unwrap()
        .unwrap();
    assert!(invalid.is_invalid());
    assert_eq!(invalid.id(), Some(1));

    let valid = tokio::time::timeout(WAIT, server.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(valid.into_body().unwrap().1, Event::Text(Text::new("ok")));
    assert_eq!(server.connection_count().await, 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_oversized_line_is_invalid_and_skipped() {
    let server = text_server(TransportKind::Stream);
    let addr = server.start().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut data = vec![b'7'; MAX_FRAME_SIZE + 16];
    data.extend_from_slice(b"\n0012|ok\n");
    stream.write_all(&data).await.unwrap();

    let invalid = tokio::time::timeout(WAIT, server.next_message())
        .await
        .unwrap()
        .unwrap();
    let mut journal = Journal::default();
    match invalid.execute(&mut journal) {
        Err(ExecuteError::Invalid { source, .. }) => {
            assert!(matches!(source, ProtocolError::Frame(FrameError::FrameTooLarge(..))));
        }
        other => panic!("Expected oversized frame, got {:?}", other),
    }

    let valid = tokio::time::timeout(WAIT, server.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(valid.into_body().unwrap().1, Event::Text(Text::new("ok")));
    assert_eq!(server.connection_count().await, 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_sees_server_stop() {
    let server = text_server(TransportKind::Stream);
    let addr = server.start().await.unwrap();

    let client = text_client(TransportKind::Stream);
    client.connect(addr).await.unwrap();
    assert!(client.is_running());

    server.stop().await.unwrap();

    let next = tokio::time::timeout(WAIT, client.next_message()).await.unwrap();
    assert!(next.is_none());
    assert!(!client.is_running());
}
