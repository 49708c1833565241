use bytes::{BufMut, Bytes, BytesMut};
use relay_protocol::ProtocolError;
use relay_transport::{
    Connection, RequestClient, TcpConfig, TcpTransport, Transport, TransportError,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn bind(max_frame_size: usize) -> (TcpTransport, SocketAddr) {
    let transport = TcpTransport::new(TcpConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        max_frame_size,
    })
    .await
    .unwrap();
    let addr = transport.local_addr().unwrap();
    (transport, addr)
}

/// Serve every accepted connection by echoing payloads back upper-cased.
fn spawn_echo(transport: TcpTransport) {
    tokio::spawn(async move {
        while let Ok(mut conn) = transport.accept().await {
            tokio::spawn(async move {
                while let Ok(Some(payload)) = conn.recv().await {
                    let reply = Bytes::from(payload.to_ascii_uppercase());
                    if conn.send(reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

#[tokio::test]
async fn replies_arrive_in_request_order() {
    let (transport, addr) = bind(1024).await;
    assert_eq!(transport.name(), "tcp");
    spawn_echo(transport);

    let mut client = RequestClient::connect(addr).await.unwrap();
    for word in ["login", "users", "channel", ""] {
        let reply = client.request(Bytes::from(word)).await.unwrap();
        assert_eq!(reply, word.to_ascii_uppercase().as_bytes());
    }
    client.close().await.unwrap();
}

#[tokio::test]
async fn many_clients_share_one_listener() {
    let (transport, addr) = bind(1024).await;
    spawn_echo(transport);

    let clients = (0..8).map(|i| async move {
        let mut client = RequestClient::connect(addr)
            .await
            .unwrap()
            .with_timeout(Duration::from_secs(5));
        let reply = client.request(Bytes::from(format!("bot_{i}"))).await.unwrap();
        assert_eq!(reply, format!("BOT_{i}").as_bytes());
    });

    futures_util::future::join_all(clients).await;
}

#[tokio::test]
async fn payload_split_across_writes_is_reassembled() {
    let (transport, addr) = bind(1024).await;

    let server = tokio::spawn(async move {
        let mut conn = transport.accept().await.unwrap();
        let first = conn.recv().await.unwrap();
        let second = conn.recv().await.unwrap();
        let end = conn.recv().await.unwrap();
        (first, second, end, conn.is_open())
    });

    let mut raw = BytesMut::new();
    raw.put_u32(5);
    raw.extend_from_slice(b"hello");
    raw.put_u32(5);
    raw.extend_from_slice(b"world");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&raw[..3]).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    stream.write_all(&raw[3..11]).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    stream.write_all(&raw[11..]).await.unwrap();
    stream.shutdown().await.unwrap();

    let (first, second, end, open) = server.await.unwrap();
    assert_eq!(first.unwrap(), "hello");
    assert_eq!(second.unwrap(), "world");
    assert!(end.is_none());
    assert!(!open);
}

#[tokio::test]
async fn oversized_frame_is_rejected() {
    let (transport, addr) = bind(16).await;

    let server = tokio::spawn(async move {
        let mut conn = transport.accept().await.unwrap();
        conn.recv().await
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut raw = BytesMut::new();
    raw.put_u32(17);
    raw.extend_from_slice(&[0u8; 17]);
    stream.write_all(&raw).await.unwrap();

    match server.await.unwrap() {
        Err(TransportError::Protocol(ProtocolError::FrameTooLarge(17))) => {}
        other => panic!("expected FrameTooLarge, got {other:?}"),
    }
}

#[tokio::test]
async fn truncated_frame_is_an_error() {
    let (transport, addr) = bind(1024).await;

    let server = tokio::spawn(async move {
        let mut conn = transport.accept().await.unwrap();
        conn.recv().await
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&[0, 0, 0, 10, b'a', b'b']).await.unwrap();
    stream.shutdown().await.unwrap();

    assert!(matches!(
        server.await.unwrap(),
        Err(TransportError::ReceiveFailed(_))
    ));
}

#[tokio::test]
async fn client_sees_server_hang_up() {
    let (transport, addr) = bind(1024).await;

    tokio::spawn(async move {
        let mut conn = transport.accept().await.unwrap();
        let _ = conn.recv().await;
        conn.close().await.unwrap();
        assert!(!conn.is_open());
    });

    let mut client = RequestClient::connect(addr).await.unwrap();
    assert!(matches!(
        client.request(Bytes::from_static(b"ping")).await,
        Err(TransportError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn slow_reply_times_out() {
    let (transport, addr) = bind(1024).await;

    tokio::spawn(async move {
        let mut conn = transport.accept().await.unwrap();
        let _ = conn.recv().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(conn);
    });

    let mut client = RequestClient::connect(addr)
        .await
        .unwrap()
        .with_timeout(Duration::from_millis(50));
    assert!(matches!(
        client.request(Bytes::from_static(b"ping")).await,
        Err(TransportError::Timeout)
    ));
}

#[tokio::test]
async fn reply_frames_are_length_prefixed() {
    let (transport, addr) = bind(1024).await;
    spawn_echo(transport);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&[0, 0, 0, 2, b'o', b'k']).await.unwrap();

    let mut reply = [0u8; 6];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0, 0, 0, 2, b'O', b'K']);
}
