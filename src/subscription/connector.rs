//! Opening authenticated push channels.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use reqwest::Client;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::protocol::{
    events, ChannelAuthRequest, ChannelAuthResponse, ConnectionEstablished, PushErrorData,
    PushFrame,
};
use crate::config::ClientConfig;
use crate::job_result::JobResultRecord;

/// Failure to establish or keep a push channel.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    #[error("push connection failed: {0}")]
    Connect(String),

    #[error("channel authorization rejected with status {0}")]
    Unauthorized(u16),

    #[error("push protocol error: {0}")]
    Protocol(String),

    #[error("push handshake timed out")]
    Timeout,

    #[error("push channel closed")]
    Closed,
}

/// Everything needed to open one push channel.
#[derive(Clone)]
pub struct ChannelTarget {
    pub auth_endpoint: String,
    pub ws_url: String,
    pub channel_name: String,
    pub credential: String,
}

impl ChannelTarget {
    pub fn new(
        auth_endpoint: impl Into<String>,
        ws_url: impl Into<String>,
        channel_name: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            auth_endpoint: auth_endpoint.into(),
            ws_url: ws_url.into(),
            channel_name: channel_name.into(),
            credential: credential.into(),
        }
    }

    /// Target for the configured push endpoint, if push delivery is enabled.
    pub fn from_config(config: &ClientConfig) -> Option<Self> {
        if !config.push.enabled {
            return None;
        }
        let ws_url = config.push.ws_url.clone()?;
        let auth_endpoint = config.push.auth_endpoint.clone()?;
        Some(Self::new(
            auth_endpoint,
            ws_url,
            config.channel_name(),
            config.api_token.clone(),
        ))
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            auth_endpoint: self.auth_endpoint.clone(),
            channel_name: self.channel_name.clone(),
            credential_fingerprint: format!("{:x}", Sha256::digest(self.credential.as_bytes())),
        }
    }
}

impl fmt::Debug for ChannelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTarget")
            .field("auth_endpoint", &self.auth_endpoint)
            .field("ws_url", &self.ws_url)
            .field("channel_name", &self.channel_name)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Identity of a cached subscription.
///
/// Derived from the auth endpoint, channel name and credential; only a digest
/// of the credential is kept.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    auth_endpoint: String,
    channel_name: String,
    credential_fingerprint: String,
}

impl SubscriptionKey {
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} [{}]",
            self.channel_name,
            self.auth_endpoint,
            &self.credential_fingerprint[..12]
        )
    }
}

impl fmt::Debug for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionKey({})", self)
    }
}

/// Event surfaced by an open push channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    JobResult(JobResultRecord),
    /// The connection was lost; no further events follow.
    Disconnected(String),
}

/// An open push channel. Dropping it shuts the connection down.
pub struct PushChannel {
    events: mpsc::Receiver<ChannelEvent>,
    shutdown: CancellationToken,
}

impl PushChannel {
    pub fn new(events: mpsc::Receiver<ChannelEvent>, shutdown: CancellationToken) -> Self {
        Self { events, shutdown }
    }

    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Opens push channels. Implemented over WebSockets for production and by
/// in-memory fakes in tests.
#[async_trait]
pub trait PushConnector: Send + Sync {
    /// Connect, authorize and subscribe to `target`'s channel.
    async fn open(&self, target: &ChannelTarget) -> Result<PushChannel, SubscriptionError>;
}

/// [`PushConnector`] speaking the push protocol over a WebSocket.
pub struct WebSocketConnector {
    http_client: Client,
    handshake_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self {
            http_client: Client::new(),
            handshake_timeout,
        }
    }

    /// Obtain the channel authorization signature for `socket_id`.
    async fn authorize(
        &self,
        target: &ChannelTarget,
        socket_id: &str,
    ) -> Result<String, SubscriptionError> {
        let response = self
            .http_client
            .post(&target.auth_endpoint)
            .bearer_auth(&target.credential)
            .json(&ChannelAuthRequest {
                socket_id: socket_id.to_string(),
                channel_name: target.channel_name.clone(),
            })
            .send()
            .await
            .map_err(|e| SubscriptionError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SubscriptionError::Unauthorized(status.as_u16()));
        }

        let body: ChannelAuthResponse = response
            .json()
            .await
            .map_err(|e| SubscriptionError::Protocol(format!("invalid auth response: {}", e)))?;
        Ok(body.auth)
    }

    async fn handshake(&self, target: &ChannelTarget) -> Result<PushChannel, SubscriptionError> {
        info!("Connecting to push channel {}", target.channel_name);

        let (ws_stream, _) = connect_async(target.ws_url.as_str())
            .await
            .map_err(|e| SubscriptionError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let established = next_frame(&mut read, &mut write).await?;
        if !established.is(events::CONNECTION_ESTABLISHED) {
            return Err(SubscriptionError::Protocol(format!(
                "expected {}, got {}",
                events::CONNECTION_ESTABLISHED,
                established.event
            )));
        }
        let socket_id = established
            .decode_data::<ConnectionEstablished>()
            .map_err(|e| SubscriptionError::Protocol(e.to_string()))?
            .socket_id;
        debug!("Push connection established with socket id {}", socket_id);

        let auth = self.authorize(target, &socket_id).await?;
        send_frame(&mut write, &PushFrame::subscribe(&target.channel_name, &auth)).await?;

        loop {
            let frame = next_frame(&mut read, &mut write).await?;
            match frame.event.as_str() {
                events::SUBSCRIPTION_SUCCEEDED => break,
                events::ERROR => {
                    let data: PushErrorData = frame.decode_data().unwrap_or_default();
                    return Err(SubscriptionError::Protocol(
                        data.message
                            .unwrap_or_else(|| "subscription rejected".to_string()),
                    ));
                }
                other => trace!("Ignoring {} frame during subscribe", other),
            }
        }

        info!("Subscribed to push channel {}", target.channel_name);

        let (events_tx, events_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        tokio::spawn(run_reader(
            read,
            write,
            events_tx,
            shutdown.clone(),
            target.channel_name.clone(),
        ));

        Ok(PushChannel::new(events_rx, shutdown))
    }
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn open(&self, target: &ChannelTarget) -> Result<PushChannel, SubscriptionError> {
        match tokio::time::timeout(self.handshake_timeout, self.handshake(target)).await {
            Ok(result) => result,
            Err(_) => Err(SubscriptionError::Timeout),
        }
    }
}

async fn send_frame<W>(write: &mut W, frame: &PushFrame) -> Result<(), SubscriptionError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let text = frame
        .to_json()
        .map_err(|e| SubscriptionError::Protocol(e.to_string()))?;
    write
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| SubscriptionError::Connect(e.to_string()))
}

/// Read the next protocol frame, answering keep-alives along the way.
async fn next_frame<R, W>(read: &mut R, write: &mut W) -> Result<PushFrame, SubscriptionError>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let frame = PushFrame::parse(&text)
                    .map_err(|e| SubscriptionError::Protocol(e.to_string()))?;
                if frame.is(events::PING) {
                    send_frame(write, &PushFrame::pong()).await?;
                    continue;
                }
                return Ok(frame);
            }
            Ok(Message::Ping(data)) => {
                write
                    .send(Message::Pong(data))
                    .await
                    .map_err(|e| SubscriptionError::Connect(e.to_string()))?;
            }
            Ok(Message::Close(_)) => return Err(SubscriptionError::Closed),
            Ok(_) => {}
            Err(e) => return Err(SubscriptionError::Connect(e.to_string())),
        }
    }
    Err(SubscriptionError::Closed)
}

/// Forward job-result events until the connection drops or `shutdown` fires.
async fn run_reader<R, W>(
    mut read: R,
    mut write: W,
    events_tx: mpsc::Sender<ChannelEvent>,
    shutdown: CancellationToken,
    channel_name: String,
) where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    let reason = loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Closing push channel {}", channel_name);
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            message = read.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                let frame = match PushFrame::parse(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Failed to parse push frame: {} - {}", e, text.as_str());
                        continue;
                    }
                };
                match frame.event.as_str() {
                    events::PING => {
                        if let Err(e) = send_frame(&mut write, &PushFrame::pong()).await {
                            break e.to_string();
                        }
                    }
                    events::JOB_RESULT => {
                        if frame
                            .channel
                            .as_deref()
                            .is_some_and(|channel| channel != channel_name)
                        {
                            trace!("Ignoring job-result for channel {:?}", frame.channel);
                            continue;
                        }
                        match frame.decode_data::<JobResultRecord>() {
                            Ok(record) => {
                                if events_tx.send(ChannelEvent::JobResult(record)).await.is_err() {
                                    // Nobody is listening anymore
                                    return;
                                }
                            }
                            Err(e) => warn!("Malformed job-result event: {}", e),
                        }
                    }
                    events::ERROR => {
                        let data: PushErrorData = frame.decode_data().unwrap_or_default();
                        warn!(
                            "Push channel error {:?}: {}",
                            data.code,
                            data.message.unwrap_or_default()
                        );
                    }
                    other => trace!("Ignoring {} frame", other),
                }
            }
            Some(Ok(Message::Ping(data))) => {
                if let Err(e) = write.send(Message::Pong(data)).await {
                    error!("Failed to send pong: {}", e);
                    break e.to_string();
                }
            }
            Some(Ok(Message::Close(_))) => {
                info!("Push channel closed by server");
                break "closed by server".to_string();
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("Push channel error: {}", e);
                break e.to_string();
            }
            None => break "connection ended".to_string(),
        }
    };

    let _ = events_tx.send(ChannelEvent::Disconnected(reason)).await;
}
