//! Connection handlers for the relay server.
//!
//! Two listeners share one process:
//! - the request listener (TCP, length-prefixed envelopes) feeding the
//!   single request worker
//! - the subscriber listener (HTTP) serving `/ws` for topic subscriptions
//!   and `/health`

use crate::config::Config;
use crate::metrics::{self, ConnectionKind, ConnectionMetricsGuard};
use crate::worker::RequestQueue;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use relay_core::{
    Delivery, Dispatcher, HubConfig, HubError, Logs, Publisher, SystemClock, TopicHub,
};
use relay_protocol::codec;
use relay_protocol::frames::codes;
use relay_protocol::Frame;
use relay_transport::{Connection, ConnectionId, TcpConfig, TcpTransport, Transport};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Deliveries = mpsc::UnboundedSender<Arc<Delivery>>;

/// Shared state of the subscriber endpoint.
pub struct AppState {
    /// The topic hub records are fanned out to.
    pub hub: Arc<TopicHub>,
}

/// A bound relay, ready to run.
pub struct Server {
    requests: TcpTransport,
    subscribers: TcpListener,
    queue: RequestQueue,
    worker: JoinHandle<()>,
    hub: Arc<TopicHub>,
}

impl Server {
    /// Open the record logs, start the request worker and bind both listeners.
    ///
    /// # Errors
    ///
    /// Returns an error if the logs cannot be opened or a listener cannot bind.
    pub async fn bind(config: &Config) -> Result<Self> {
        let hub = Arc::new(TopicHub::with_config(HubConfig {
            max_topics: config.limits.max_topics,
            max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
            topic_capacity: config.limits.topic_capacity,
            auto_delete_empty_topics: true,
        }));

        let logs = Logs::open(&config.data_dir).await?;
        let dispatcher = Dispatcher::new(
            logs,
            Publisher::new(hub.clone()),
            Arc::new(SystemClock::new()),
        );
        let (queue, worker) = RequestQueue::spawn(dispatcher, config.limits.queue_depth);

        let requests = TcpTransport::new(TcpConfig {
            bind_addr: config.request_addr()?,
            max_frame_size: config.limits.max_frame_size,
        })
        .await?;
        let subscribers = TcpListener::bind(config.subscribe_addr()?).await?;

        Ok(Self {
            requests,
            subscribers,
            queue,
            worker,
            hub,
        })
    }

    /// Address of the request listener.
    #[must_use]
    pub fn request_addr(&self) -> Option<SocketAddr> {
        self.requests.local_addr()
    }

    /// Address of the subscriber listener.
    #[must_use]
    pub fn subscribe_addr(&self) -> Option<SocketAddr> {
        self.subscribers.local_addr().ok()
    }

    /// The topic hub records are fanned out to.
    #[must_use]
    pub fn hub(&self) -> Arc<TopicHub> {
        self.hub.clone()
    }

    /// Serve until `shutdown` resolves.
    ///
    /// On shutdown both listeners stop accepting and idle request
    /// connections are closed. A request already handed to the worker still
    /// gets its reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriber listener fails.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            requests,
            subscribers,
            queue,
            worker,
            hub,
        } = self;

        if let Some(addr) = requests.local_addr() {
            info!("Request listener on tcp://{}", addr);
        }
        if let Ok(addr) = subscribers.local_addr() {
            info!("Subscriber endpoint: ws://{}/ws", addr);
        }

        let (stop_tx, stop_rx) = watch::channel(false);

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(Arc::new(AppState { hub }));

        let mut http_stop = stop_rx.clone();
        let http = tokio::spawn(async move {
            axum::serve(subscribers, app)
                .with_graceful_shutdown(async move {
                    let _ = http_stop.changed().await;
                })
                .await
        });

        let accept = tokio::spawn(accept_requests(requests, queue, stop_rx));

        shutdown.await;
        info!("Relay shutting down");
        let _ = stop_tx.send(true);

        let _ = accept.await;
        let served = http.await;
        if let Err(e) = worker.await {
            error!(error = %e, "Request worker panicked");
        }

        info!("Relay stopped");
        served??;
        Ok(())
    }
}

/// Run the relay until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let server = Server::bind(&config).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl-C handler");
            }
        })
        .await
}

/// Accept request connections until told to stop, one task per connection.
async fn accept_requests(
    transport: TcpTransport,
    queue: RequestQueue,
    stop: watch::Receiver<bool>,
) {
    let mut accept_stop = stop.clone();

    loop {
        tokio::select! {
            _ = accept_stop.changed() => break,
            accepted = transport.accept() => match accepted {
                Ok(conn) => {
                    tokio::spawn(serve_requests(conn, queue.clone(), stop.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept request connection");
                    metrics::record_error("accept");
                }
            },
        }
    }

    debug!("Stopped accepting request connections");
}

/// Forward each request on a connection to the worker and write back the
/// reply, strictly alternating.
async fn serve_requests(
    mut conn: Box<dyn Connection>,
    queue: RequestQueue,
    mut stop: watch::Receiver<bool>,
) {
    let _metrics_guard = ConnectionMetricsGuard::new(ConnectionKind::Request);
    let id = conn.id().clone();

    debug!(connection = %id, peer = ?conn.remote_addr(), "Request connection opened");

    loop {
        let received = tokio::select! {
            _ = stop.changed() => break,
            received = conn.recv() => received,
        };

        let request = match received {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                warn!(connection = %id, error = %e, "Closing request connection");
                metrics::record_error("request_frame");
                break;
            }
        };

        let reply = match queue.submit(request).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(connection = %id, error = %e, "Dropping request connection");
                break;
            }
        };

        if let Err(e) = conn.send(reply).await {
            debug!(connection = %id, error = %e, "Failed to send reply");
            break;
        }
    }

    let _ = conn.close().await;
    debug!(connection = %id, "Request connection closed");
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a subscriber connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new(ConnectionKind::Subscriber);
    let connection_id = ConnectionId::generate();

    debug!(connection = %connection_id, "Subscriber connected");

    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();
    let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel::<Arc<Delivery>>();

    loop {
        tokio::select! {
            biased;

            Some(delivery) = delivery_rx.recv() => {
                let frame = Frame::message(delivery.topic.clone(), delivery.payload.to_vec());
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
                metrics::record_delivery();
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        read_buffer.extend_from_slice(&data);
                        if drain_frames(
                            &mut read_buffer,
                            connection_id.as_str(),
                            &state,
                            &mut sender,
                            &mut forwarders,
                            &delivery_tx,
                        )
                        .await
                        .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    for (_, handle) in forwarders {
        handle.abort();
    }

    state.hub.unsubscribe_all(connection_id.as_str());
    metrics::set_active_topics(state.hub.stats().topic_count);

    debug!(connection = %connection_id, "Subscriber disconnected");
}

/// Handle every complete frame in the read buffer.
async fn drain_frames(
    read_buffer: &mut BytesMut,
    connection_id: &str,
    state: &AppState,
    sender: &mut SplitSink<WebSocket, Message>,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
    deliveries: &Deliveries,
) -> Result<()> {
    loop {
        let frame = match codec::decode_from(read_buffer) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Invalid subscriber frame");
                metrics::record_error("subscriber_frame");
                read_buffer.clear();
                send_frame(sender, &Frame::error(0, codes::UNEXPECTED_FRAME, e.to_string()))
                    .await?;
                return Ok(());
            }
        };

        let reply = handle_frame(frame, connection_id, state, forwarders, deliveries);
        if let Some(reply) = reply {
            send_frame(sender, &reply).await?;
        }
    }
}

/// Apply one subscriber frame, returning the frame to answer with.
fn handle_frame(
    frame: Frame,
    connection_id: &str,
    state: &AppState,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
    deliveries: &Deliveries,
) -> Option<Frame> {
    match frame {
        Frame::Subscribe { id, topic } => {
            debug!(connection = %connection_id, topic = %topic, "Subscribe request");

            let reply = match state.hub.subscribe(connection_id, &topic) {
                Ok(rx) => {
                    forwarders.insert(topic, spawn_forwarder(rx, deliveries.clone()));
                    metrics::record_subscription();
                    Frame::ack(id)
                }
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "Subscribe failed");
                    let code = match e {
                        HubError::InvalidTopic(_) => codes::INVALID_TOPIC,
                        _ => codes::SUBSCRIBE_FAILED,
                    };
                    Frame::error(id, code, e.to_string())
                }
            };

            metrics::set_active_topics(state.hub.stats().topic_count);
            Some(reply)
        }

        Frame::Unsubscribe { id, topic } => {
            debug!(connection = %connection_id, topic = %topic, "Unsubscribe request");

            if let Some(handle) = forwarders.remove(&topic) {
                handle.abort();
            }

            let reply = match state.hub.unsubscribe(connection_id, &topic) {
                Ok(()) => Frame::ack(id),
                Err(e) => Frame::error(id, codes::NOT_SUBSCRIBED, e.to_string()),
            };

            metrics::set_active_topics(state.hub.stats().topic_count);
            Some(reply)
        }

        Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),

        Frame::Pong { .. } => None,

        other => {
            warn!(
                connection = %connection_id,
                frame_type = ?other.frame_type(),
                "Unexpected frame type"
            );
            Some(Frame::error(
                0,
                codes::UNEXPECTED_FRAME,
                format!("unexpected {:?} frame", other.frame_type()),
            ))
        }
    }
}

/// Forward a topic's broadcast receiver into the connection's delivery queue.
fn spawn_forwarder(mut rx: broadcast::Receiver<Arc<Delivery>>, tx: Deliveries) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(delivery) => {
                    if tx.send(delivery).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagging, records dropped");
                    metrics::record_error("lagged");
                }
            }
        }
    })
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
