use anyhow::Result;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use relay_core::{DirectMessageRecord, PublicationRecord};
use relay_protocol::frames::codes;
use relay_protocol::{codec, envelope, Frame, ReplyEnvelope, RequestEnvelope};
use relay_server::{Config, Server};
use relay_transport::{RequestClient, TransportError};
use serde_json::json;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(2);

struct Relay {
    requests: SocketAddr,
    subscribers: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl Relay {
    async fn start(data_dir: &Path) -> Result<Self> {
        let mut config = Config::default();
        config.request_port = 0;
        config.subscribe_port = 0;
        config.data_dir = data_dir.to_path_buf();
        config.metrics.enabled = false;
        config.limits.max_frame_size = 64 * 1024;

        let server = Server::bind(&config).await?;
        let requests = server.request_addr().expect("request listener bound");
        let subscribers = server.subscribe_addr().expect("subscriber listener bound");

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async move {
            let _ = stopped.await;
        }));

        Ok(Self {
            requests,
            subscribers,
            stop: Some(stop),
            task,
        })
    }

    async fn client(&self) -> Result<RequestClient> {
        Ok(RequestClient::connect(self.requests).await?.with_timeout(WAIT))
    }

    async fn subscriber(&self, topics: &[&str]) -> Result<Ws> {
        let (mut ws, _) = connect_async(format!("ws://{}/ws", self.subscribers)).await?;
        for (id, topic) in (1u64..).zip(topics) {
            send_frame(&mut ws, &Frame::subscribe(id, *topic)).await?;
            assert_eq!(next_frame(&mut ws).await?, Frame::ack(id));
        }
        Ok(ws)
    }

    async fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        timeout(WAIT, self.task).await???;
        Ok(())
    }
}

async fn call(client: &mut RequestClient, request: RequestEnvelope) -> Result<ReplyEnvelope> {
    let reply = client.request(envelope::encode(&request)?).await?;
    Ok(envelope::decode_reply(&reply)?)
}

async fn send_frame(ws: &mut Ws, frame: &Frame) -> Result<()> {
    ws.send(Message::Binary(codec::encode(frame)?.to_vec())).await?;
    Ok(())
}

async fn next_frame(ws: &mut Ws) -> Result<Frame> {
    loop {
        match timeout(WAIT, ws.next()).await? {
            Some(Ok(Message::Binary(data))) => return Ok(codec::decode(&data)?),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => anyhow::bail!("subscriber stream ended"),
        }
    }
}

fn message_payload(frame: Frame) -> (String, Vec<u8>) {
    match frame {
        Frame::Message { topic, payload } => (topic, payload),
        other => panic!("expected a message frame, got {other:?}"),
    }
}

#[tokio::test]
async fn requests_get_replies_in_order() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let relay = Relay::start(dir.path()).await?;
    let mut client = relay.client().await?;

    let reply = call(&mut client, RequestEnvelope::new("login").with("user", "alice")).await?;
    assert_eq!(reply.service, "login");
    assert_eq!(reply.status(), Some("ok"));
    assert_eq!(reply.get("user"), Some(&json!("alice")));

    call(&mut client, RequestEnvelope::new("login").with("username", "bob")).await?;
    call(&mut client, RequestEnvelope::new("login").with("user", "alice")).await?;

    let reply = call(&mut client, RequestEnvelope::new("users")).await?;
    assert_eq!(reply.get("users"), Some(&json!(["alice", "bob"])));

    let logins = std::fs::read_to_string(dir.path().join("logins.ndjson"))?;
    assert_eq!(logins.lines().count(), 3);
    assert!(logins.starts_with("{\"type\":\"login\",\"user\":\"alice\""));

    relay.shutdown().await
}

#[tokio::test]
async fn publish_reaches_channel_subscribers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let relay = Relay::start(dir.path()).await?;
    let mut general = relay.subscriber(&["general"]).await?;
    let mut other = relay.subscriber(&["random"]).await?;
    let mut client = relay.client().await?;

    let reply = call(
        &mut client,
        RequestEnvelope::new("publish")
            .with("channel", "general")
            .with("user", "alice")
            .with("message", "hi"),
    )
    .await?;
    assert_eq!(reply.status(), Some("ok"));

    let (topic, payload) = message_payload(next_frame(&mut general).await?);
    assert_eq!(topic, "general");
    let record: PublicationRecord = rmp_serde::from_slice(&payload)?;
    assert_eq!(record.user, "alice");
    assert_eq!(record.message, "hi");

    // Nothing was published on the other topic.
    send_frame(&mut other, &Frame::ping()).await?;
    assert!(matches!(next_frame(&mut other).await?, Frame::Pong { .. }));

    let reply = call(&mut client, RequestEnvelope::new("channels")).await?;
    assert_eq!(reply.get("channels"), Some(&json!(["general"])));

    relay.shutdown().await
}

#[tokio::test]
async fn direct_message_reaches_recipient_then_sender() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let relay = Relay::start(dir.path()).await?;
    let mut both = relay.subscriber(&["bob", "alice"]).await?;
    let mut client = relay.client().await?;

    call(
        &mut client,
        RequestEnvelope::new("message")
            .with("from", "alice")
            .with("to", "bob")
            .with("message", "hey"),
    )
    .await?;

    let (first, first_payload) = message_payload(next_frame(&mut both).await?);
    let (second, second_payload) = message_payload(next_frame(&mut both).await?);
    assert_eq!((first.as_str(), second.as_str()), ("bob", "alice"));
    assert_eq!(first_payload, second_payload);

    let record: DirectMessageRecord = rmp_serde::from_slice(&first_payload)?;
    assert_eq!(record.src, "alice");
    assert_eq!(record.dst, "bob");

    relay.shutdown().await
}

#[tokio::test]
async fn bad_requests_get_error_replies() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let relay = Relay::start(dir.path()).await?;
    let mut client = relay.client().await?;

    let reply = envelope::decode_reply(&client.request(Bytes::from_static(b"garbage")).await?)?;
    assert_eq!(reply.service, "error");
    assert_eq!(reply.get("message"), Some(&json!("msgpack inválido")));

    let reply = call(&mut client, RequestEnvelope::new("does-not-exist")).await?;
    assert_eq!(reply.service, "error");
    assert_eq!(reply.get("message"), Some(&json!("unknown service: does-not-exist")));

    let reply = call(&mut client, RequestEnvelope::new("message").with("src", "alice")).await?;
    assert_eq!(reply.get("message"), Some(&json!("src e dst obrigatórios")));

    // The same connection keeps working.
    let reply = call(&mut client, RequestEnvelope::new("users")).await?;
    assert_eq!(reply.get("users"), Some(&json!([])));

    relay.shutdown().await
}

#[tokio::test]
async fn oversized_request_closes_the_connection() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let relay = Relay::start(dir.path()).await?;

    let mut stream = TcpStream::connect(relay.requests).await?;
    stream.write_all(&(1u32 << 20).to_be_bytes()).await?;

    let mut buf = [0u8; 16];
    let read = timeout(WAIT, stream.read(&mut buf)).await?;
    assert!(matches!(read, Ok(0) | Err(_)));

    // Other clients are unaffected.
    let mut client = relay.client().await?;
    let reply = call(&mut client, RequestEnvelope::new("channels")).await?;
    assert_eq!(reply.status(), Some("ok"));

    relay.shutdown().await
}

#[tokio::test]
async fn subscriber_errors_and_unsubscribe() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let relay = Relay::start(dir.path()).await?;
    let mut ws = relay.subscriber(&["general"]).await?;

    send_frame(&mut ws, &Frame::subscribe(7, "")).await?;
    match next_frame(&mut ws).await? {
        Frame::Error { id, code, .. } => assert_eq!((id, code), (7, codes::INVALID_TOPIC)),
        other => panic!("expected error frame, got {other:?}"),
    }

    send_frame(&mut ws, &Frame::subscribe(8, "general")).await?;
    match next_frame(&mut ws).await? {
        Frame::Error { id, code, .. } => assert_eq!((id, code), (8, codes::SUBSCRIBE_FAILED)),
        other => panic!("expected error frame, got {other:?}"),
    }

    send_frame(&mut ws, &Frame::unsubscribe(9, "general")).await?;
    assert_eq!(next_frame(&mut ws).await?, Frame::ack(9));

    send_frame(&mut ws, &Frame::unsubscribe(10, "general")).await?;
    match next_frame(&mut ws).await? {
        Frame::Error { id, code, .. } => assert_eq!((id, code), (10, codes::NOT_SUBSCRIBED)),
        other => panic!("expected error frame, got {other:?}"),
    }

    let mut client = relay.client().await?;
    call(
        &mut client,
        RequestEnvelope::new("publish")
            .with("channel", "general")
            .with("message", "nobody listens"),
    )
    .await?;

    send_frame(&mut ws, &Frame::ping()).await?;
    assert!(matches!(next_frame(&mut ws).await?, Frame::Pong { .. }));

    relay.shutdown().await
}

#[tokio::test]
async fn health_endpoint_reports_ok() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let relay = Relay::start(dir.path()).await?;

    let mut stream = TcpStream::connect(relay.subscribers).await?;
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await?;

    let mut response = String::new();
    timeout(WAIT, stream.read_to_string(&mut response)).await??;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"status\":\"ok\""));

    relay.shutdown().await
}

#[tokio::test]
async fn records_survive_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let relay = Relay::start(dir.path()).await?;
    let mut client = relay.client().await?;
    call(&mut client, RequestEnvelope::new("channel").with("channel", "general")).await?;
    drop(client);
    relay.shutdown().await?;

    let relay = Relay::start(dir.path()).await?;
    let mut client = relay.client().await?;
    let reply = call(&mut client, RequestEnvelope::new("channel").with("name", "general")).await?;
    assert_eq!(reply.get("message"), Some(&json!("Canal assegurado")));

    // Shutdown closes idle request connections.
    relay.shutdown().await?;
    assert!(matches!(
        client.request(envelope::encode(&RequestEnvelope::new("users"))?).await,
        Err(TransportError::ConnectionClosed | TransportError::Io(_))
    ));
    Ok(())
}
