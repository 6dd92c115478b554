// Message-queue subscription delivering add/remove peer events over a websocket.
// The first connection must succeed; later drops are retried until shutdown.

use crate::config::MqConfig;
use crate::error::SubscribeError;
use crate::metrics::Metrics;
use crate::models::PeerEvent;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, instrument, warn};

/// Buffered events between the subscriber and the dispatch loop.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum ReadOutcome {
    Shutdown,
    Disconnected,
    ReceiverGone,
}

pub struct Subscriber {
    url: String,
    credentials: Option<(String, String)>,
    reconnect_delay: Duration,
    metrics: Arc<Metrics>,
}

/// A live subscription: the event stream plus the task feeding it.
pub struct Subscription {
    pub events: mpsc::Receiver<PeerEvent>,
    pub handle: tokio::task::JoinHandle<()>,
}

impl Subscriber {
    pub fn new(config: &MqConfig, metrics: Arc<Metrics>) -> Self {
        let credentials = (!config.username.is_empty() && !config.password.is_empty())
            .then(|| (config.username.clone(), config.password.clone()));
        Self {
            url: format!(
                "{}/channel/{}",
                config.url.trim_end_matches('/'),
                config.channel
            ),
            credentials,
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
            metrics,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connects and starts forwarding events. Fails if the initial connection cannot be made.
    #[instrument(skip(self, shutdown_rx), fields(url = %self.url))]
    pub async fn subscribe(
        self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Subscription, SubscribeError> {
        let ws = self.connect().await?;
        info!("subscribed to message-queue");
        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = tokio::spawn(self.run(ws, tx, shutdown_rx));
        Ok(Subscription { events, handle })
    }

    async fn connect(&self) -> Result<WsStream, SubscribeError> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some((user, pass)) = &self.credentials {
            let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            let value = HeaderValue::from_str(&format!("Basic {token}"))
                .map_err(|e| SubscribeError::Url(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }
        let (ws, _) = connect_async(request).await?;
        Ok(ws)
    }

    async fn run(
        self,
        mut ws: WsStream,
        tx: mpsc::Sender<PeerEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            match read_events(&mut ws, &tx, &mut shutdown_rx).await {
                ReadOutcome::Shutdown => {
                    let _ = ws.close(None).await;
                    break;
                }
                ReadOutcome::ReceiverGone => break,
                ReadOutcome::Disconnected => {}
            }

            match self.reconnect(&mut shutdown_rx).await {
                Some(new_ws) => ws = new_ws,
                None => break,
            }
        }
        debug!("subscriber shutting down");
    }

    /// Retries every `reconnect_delay` until connected. `None` on shutdown.
    async fn reconnect(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Option<WsStream> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = shutdown_rx.changed() => return None,
            }
            if *shutdown_rx.borrow() {
                return None;
            }
            self.metrics.subscriber_reconnects.inc();
            match self.connect().await {
                Ok(ws) => {
                    info!("reconnected to message-queue");
                    return Some(ws);
                }
                Err(e) => {
                    warn!(error = %e, operation = "reconnect", "error connecting to message-queue");
                }
            }
        }
    }
}

async fn read_events(
    ws: &mut WsStream,
    tx: &mpsc::Sender<PeerEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ReadOutcome {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return ReadOutcome::Shutdown,
            _ = tx.closed() => return ReadOutcome::ReceiverGone,
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<PeerEvent>(&text) {
                    Ok(event) => tokio::select! {
                        sent = tx.send(event) => {
                            if sent.is_err() {
                                return ReadOutcome::ReceiverGone;
                            }
                        }
                        _ = shutdown_rx.changed() => return ReadOutcome::Shutdown,
                    },
                    Err(e) => warn!(error = %e, data = %text, "failed to parse peer event"),
                },
                Some(Ok(Message::Ping(data))) => {
                    if ws.send(Message::Pong(data)).await.is_err() {
                        return ReadOutcome::Disconnected;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    warn!("message-queue closed the connection");
                    return ReadOutcome::Disconnected;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "message-queue read error");
                    return ReadOutcome::Disconnected;
                }
            },
        }
    }
}
