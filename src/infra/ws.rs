//! WebSocket [`FeedTransport`].
//!
//! Each channel gets its own connection. The handshake sends a `join` frame
//! and waits for the matching `join_ack`; closing the channel sends `leave`
//! and closes the socket.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use hearth_api_types::{ChangeEvent, ChannelMessage};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{Instrument, debug, info_span, warn};
use url::Url;

use crate::application::error::SyncError;
use crate::config::RemoteSettings;
use crate::realtime::{ChannelSpec, EVENT_BUFFER, FeedChannel, FeedTransport};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug)]
pub struct WsFeedTransport {
    url: Url,
    api_key: Option<String>,
    handshake_timeout: Duration,
}

impl WsFeedTransport {
    pub fn new(settings: &RemoteSettings) -> Self {
        Self {
            url: settings.feed_url.clone(),
            api_key: settings.api_key.clone(),
            handshake_timeout: settings.request_timeout,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn connect(&self) -> Result<Socket, SyncError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| SyncError::feed(format!("invalid feed url: {err}")))?;
        if let Some(key) = self.api_key.as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|err| SyncError::feed(format!("invalid api key header: {err}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (socket, _) = connect_async(request)
            .await
            .map_err(|err| SyncError::network(err.to_string()))?;
        Ok(socket)
    }

    async fn join(&self, socket: &mut Socket, spec: &ChannelSpec) -> Result<(), SyncError> {
        let channel = spec.channel_id();
        send_control(
            socket,
            &ChannelMessage::Join {
                channel: channel.clone(),
                table: spec.table.clone(),
                filter: spec.filter.clone(),
            },
        )
        .await?;

        while let Some(message) = socket.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<ChannelMessage>(&text) {
                    Ok(ChannelMessage::JoinAck { channel: acked }) if acked == channel => return Ok(()),
                    _ => debug!(%channel, "Skipping frame while waiting for join_ack"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => return Err(SyncError::network(err.to_string())),
            }
        }
        Err(SyncError::feed(format!("connection closed before {channel} was acknowledged")))
    }
}

async fn send_control(socket: &mut Socket, message: &ChannelMessage) -> Result<(), SyncError> {
    let text = serde_json::to_string(message)
        .map_err(|err| SyncError::feed(format!("failed to encode control frame: {err}")))?;
    socket
        .send(Message::Text(text))
        .await
        .map_err(|err| SyncError::network(err.to_string()))
}

#[async_trait]
impl FeedTransport for WsFeedTransport {
    async fn open(&self, spec: &ChannelSpec) -> Result<FeedChannel, SyncError> {
        let timeout = self.handshake_timeout;
        let socket = tokio::time::timeout(timeout, async {
            let mut socket = self.connect().await?;
            self.join(&mut socket, spec).await?;
            Ok::<_, SyncError>(socket)
        })
        .await
        .map_err(|_| SyncError::timeout(timeout))??;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (close_tx, close_rx) = oneshot::channel();
        let span = info_span!("ws_channel", channel = %spec);
        tokio::spawn(pump(socket, spec.channel_id(), events_tx, close_rx).instrument(span));

        Ok(FeedChannel::new(events_rx, move || {
            let _ = close_tx.send(());
        }))
    }
}

/// Forward change events until either side closes.
async fn pump(
    mut socket: Socket,
    channel: String,
    events: mpsc::Sender<ChangeEvent>,
    mut close: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut close => {
                if let Err(err) = send_control(&mut socket, &ChannelMessage::Leave { channel }).await {
                    debug!(error = %err, "Leave frame not delivered");
                }
                let _ = socket.close(None).await;
                return;
            }
            message = socket.next() => match message {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ChangeEvent>(&text) {
                    Ok(event) => {
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => debug!(error = %err, "Ignoring non-event frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Server closed the channel");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "Channel socket failed");
                    return;
                }
            }
        }
    }
}
