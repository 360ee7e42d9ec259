//! ReconnectingChannel - Duplex event feed with automatic recovery
//!
//! ## State Machine
//!
//! ```text
//!             handshake ok              transport close/error
//! Connecting ─────────────▶ Open ─────────────────────────────▶ Reconnecting
//!     ▲  │                                                          │
//!     │  └──── handshake failed ───────────────────────────────────▶│
//!     └──────────────────────── backoff delay ──────────────────────┘
//!
//! any state ── disconnect() ──▶ Closing (terminal)
//! ```
//!
//! The heartbeat timer only exists while `Open`. Pongs are consumed here and
//! never reach subscribers.
//!
//! No pong deadline is enforced by default, so a silently half-open
//! connection stays `Open` until the transport itself reports an error. Set
//! `pong_timeout` to treat a missing pong as a transport failure.
//!
//! A handshake that outlives `connect_timeout` counts as a failed attempt
//! and goes through the same backoff as a refused one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until, timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, client::IntoClientRequest, http::Uri},
};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::ChannelConfig;
use crate::protocol::ChannelMessage;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Attempting the transport handshake
    Connecting,
    /// Handshake complete, heartbeat running
    Open,
    /// Explicit teardown requested, no reconnection will happen
    Closing,
    /// Waiting out the backoff delay before the next attempt
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Delay policy between reconnection attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every attempt
    Fixed { delay_ms: u64 },

    /// Doubles per consecutive failed attempt, capped at `max_ms`
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed { delay_ms: 3_000 }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based since the last open)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { initial_ms, max_ms } => {
                let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
                Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

/// Text transport underneath the channel
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next text payload, `None` once the peer has closed
    async fn recv_text(&mut self) -> Option<Result<String>>;

    async fn close(&mut self);
}

/// Opens transports
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>>;
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WsConnector {
    user_agent: String,
}

impl WsConnector {
    pub fn new() -> Self {
        Self {
            user_agent: format!("neoguard-monitor/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        let uri: Uri = url.parse().context("Failed to parse WebSocket URL")?;

        let host = uri
            .authority()
            .ok_or_else(|| anyhow::anyhow!("WebSocket URL missing host"))?
            .as_str();

        let scheme = uri
            .scheme_str()
            .ok_or_else(|| anyhow::anyhow!("WebSocket URL missing scheme"))?;

        let origin_scheme = if scheme == "wss" { "https" } else { "http" };
        let origin = format!("{}://{}", origin_scheme, host);

        let mut request = url
            .into_client_request()
            .context("Failed to create WebSocket request")?;

        let headers = request.headers_mut();
        headers.insert(
            "Host",
            host.parse().context("Failed to parse Host header value")?,
        );
        headers.insert(
            "Origin",
            origin
                .parse()
                .context("Failed to parse Origin header value")?,
        );
        headers.insert(
            "User-Agent",
            self.user_agent
                .parse()
                .context("Failed to parse User-Agent header value")?,
        );

        debug!("connecting to WebSocket: url={url}, host={host}, origin={origin}");

        let (stream, _) = connect_async(request)
            .await
            .with_context(|| format!("Failed to connect to WebSocket at {url}"))?;

        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .context("WebSocket send failed")
    }

    async fn recv_text(&mut self) -> Option<Result<String>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(anyhow::Error::new(e).context("WebSocket message error"))),
            };

            match msg {
                Message::Text(text) => return Some(Ok(text)),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => warn!("dropping non-UTF-8 binary frame"),
                },
                Message::Close(_) => {
                    info!("WebSocket closed by server");
                    return None;
                }
                // Control frames are answered by tungstenite itself
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            trace!("error while closing WebSocket: {e}");
        }
    }
}

/// Channel timing and endpoint
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub url: String,
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
    pub backoff: Backoff,
    pub pong_timeout: Option<Duration>,
}

impl ChannelSettings {
    pub fn from_config(url: impl Into<String>, config: &ChannelConfig) -> Self {
        Self {
            url: url.into(),
            heartbeat: config.heartbeat().max(Duration::from_millis(1)),
            connect_timeout: config.connect_timeout(),
            backoff: config.backoff.clone(),
            pong_timeout: config.pong_timeout(),
        }
    }
}

/// Subscriber registry shared between the handle and the actor
#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    senders: Mutex<HashMap<u64, mpsc::UnboundedSender<ChannelMessage>>>,
}

impl Subscribers {
    fn add(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        Subscription {
            id,
            rx,
            registry: self.clone(),
        }
    }

    fn remove(&self, id: u64) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn dispatch(&self, message: ChannelMessage) {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders.retain(|_, tx| tx.send(message.clone()).is_ok());
    }

    fn clear(&self) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Inbound message stream for one subscriber
///
/// Dropping the subscription unsubscribes. `recv` returns `None` once the
/// channel has been disconnected.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ChannelMessage>,
    registry: Arc<Subscribers>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChannelMessage> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[derive(Debug)]
enum ChannelCommand {
    Send(ChannelMessage),
    Disconnect { respond_to: oneshot::Sender<()> },
}

/// How the open phase ended
enum OpenExit {
    Lost,
    Disconnect(Option<oneshot::Sender<()>>),
}

/// Actor owning one connection lifecycle
struct ReconnectingChannel {
    settings: ChannelSettings,
    connector: Arc<dyn Connector>,
    command_rx: mpsc::UnboundedReceiver<ChannelCommand>,
    state_tx: watch::Sender<ConnectionState>,
    subscribers: Arc<Subscribers>,

    /// Consecutive failed attempts since the last successful open
    attempt: u32,
}

impl ReconnectingChannel {
    #[instrument(skip(self), fields(url = %self.settings.url))]
    async fn run(mut self) {
        debug!("starting channel");

        loop {
            self.set_state(ConnectionState::Connecting);
            info!("connecting to event feed");

            let connector = self.connector.clone();
            let url = self.settings.url.clone();
            let deadline = self.settings.connect_timeout;

            let connected = tokio::select! {
                result = timeout(deadline, connector.connect(&url)) => {
                    result.unwrap_or_else(|_| {
                        Err(anyhow::anyhow!("handshake timed out after {deadline:?}"))
                    })
                }

                ack = next_disconnect(&mut self.command_rx) => {
                    self.finish(ack);
                    return;
                }
            };

            match connected {
                Ok(transport) => {
                    info!("event feed connected");
                    self.attempt = 0;
                    self.set_state(ConnectionState::Open);

                    match self.run_open(transport).await {
                        OpenExit::Lost => {}
                        OpenExit::Disconnect(ack) => {
                            self.finish(ack);
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!("event feed connection failed: {e:#}");
                }
            }

            let delay = self.settings.backoff.delay(self.attempt);
            self.attempt = self.attempt.saturating_add(1);
            self.set_state(ConnectionState::Reconnecting);
            info!("reconnecting in {delay:?}");

            tokio::select! {
                _ = sleep(delay) => {}

                ack = next_disconnect(&mut self.command_rx) => {
                    self.finish(ack);
                    return;
                }
            }
        }
    }

    async fn run_open(&mut self, mut transport: Box<dyn Transport>) -> OpenExit {
        let period = self.settings.heartbeat.max(Duration::from_millis(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pong_deadline: Option<Instant> = None;

        loop {
            let deadline = pong_deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                inbound = transport.recv_text() => {
                    match inbound {
                        Some(Ok(text)) => self.dispatch(&text, &mut pong_deadline),
                        Some(Err(e)) => {
                            warn!("event feed transport error: {e:#}");
                            return OpenExit::Lost;
                        }
                        None => {
                            info!("event feed closed");
                            return OpenExit::Lost;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = self.send_message(&mut transport, &ChannelMessage::ping()).await {
                        warn!("heartbeat failed: {e:#}");
                        return OpenExit::Lost;
                    }
                    trace!("sent heartbeat ping");

                    if let Some(timeout) = self.settings.pong_timeout
                        && pong_deadline.is_none()
                    {
                        pong_deadline = Some(Instant::now() + timeout);
                    }
                }

                _ = sleep_until(deadline), if pong_deadline.is_some() => {
                    warn!("no pong received in time, treating event feed as lost");
                    transport.close().await;
                    return OpenExit::Lost;
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ChannelCommand::Send(message)) => {
                            if let Err(e) = self.send_message(&mut transport, &message).await {
                                warn!("event feed send failed: {e:#}");
                                return OpenExit::Lost;
                            }
                        }
                        Some(ChannelCommand::Disconnect { respond_to }) => {
                            self.set_state(ConnectionState::Closing);
                            transport.close().await;
                            return OpenExit::Disconnect(Some(respond_to));
                        }
                        None => {
                            self.set_state(ConnectionState::Closing);
                            transport.close().await;
                            return OpenExit::Disconnect(None);
                        }
                    }
                }
            }
        }
    }

    async fn send_message(
        &self,
        transport: &mut Box<dyn Transport>,
        message: &ChannelMessage,
    ) -> Result<()> {
        let text = message.encode().context("failed to encode outbound message")?;
        transport.send_text(text).await
    }

    fn dispatch(&self, text: &str, pong_deadline: &mut Option<Instant>) {
        match ChannelMessage::decode(text) {
            Ok(message) if message.is_pong() => {
                trace!("received pong");
                *pong_deadline = None;
            }
            Ok(message) => {
                trace!("received {} message", message.kind);
                self.subscribers.dispatch(message);
            }
            Err(e) => {
                warn!("dropping malformed event feed message: {e}");
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            debug!("connection state -> {state}");
        }
    }

    fn finish(&self, ack: Option<oneshot::Sender<()>>) {
        self.set_state(ConnectionState::Closing);
        self.subscribers.clear();
        if let Some(tx) = ack {
            let _ = tx.send(());
        }
        debug!("channel closed");
    }
}

/// Drain commands while not open until a disconnect is requested
///
/// Outbound messages are dropped, never queued for a later connection.
/// Returns `None` when every handle has been dropped.
async fn next_disconnect(
    command_rx: &mut mpsc::UnboundedReceiver<ChannelCommand>,
) -> Option<oneshot::Sender<()>> {
    loop {
        match command_rx.recv().await {
            Some(ChannelCommand::Send(message)) => {
                trace!("channel not open, dropping outbound {} message", message.kind);
            }
            Some(ChannelCommand::Disconnect { respond_to }) => return Some(respond_to),
            None => return None,
        }
    }
}

/// Handle for controlling a ReconnectingChannel
#[derive(Clone)]
pub struct ChannelHandle {
    sender: mpsc::UnboundedSender<ChannelCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    subscribers: Arc<Subscribers>,
}

impl ChannelHandle {
    /// Spawn the channel. It starts connecting immediately.
    pub fn spawn(settings: ChannelSettings, connector: Arc<dyn Connector>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let subscribers = Arc::new(Subscribers::default());

        let actor = ReconnectingChannel {
            settings,
            connector,
            command_rx: cmd_rx,
            state_tx,
            subscribers: subscribers.clone(),
            attempt: 0,
        };

        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            state_rx,
            subscribers,
        }
    }

    /// Receive every non-pong inbound message, in arrival order
    pub fn subscribe(&self) -> Subscription {
        self.subscribers.add()
    }

    /// Send a message if the channel is open
    ///
    /// Returns `false` (and drops the message) otherwise.
    pub fn send(&self, message: ChannelMessage) -> bool {
        if *self.state_rx.borrow() != ConnectionState::Open {
            trace!("channel not open, dropping outbound {} message", message.kind);
            return false;
        }

        self.sender.send(ChannelCommand::Send(message)).is_ok()
    }

    /// Close the channel for good
    ///
    /// Returns once the actor has cancelled its timers. Calling it again is a no-op.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ChannelCommand::Disconnect { respond_to: tx })
            .is_err()
        {
            trace!("channel already closed");
            return;
        }

        let _ = rx.await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}
