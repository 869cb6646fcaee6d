use super::messages::{decode_ticks, SubscriptionRequest};
use crate::config::{Credentials, FeedConfig};
use crate::error::FeedError;
use crate::models::Tick;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

#[derive(Debug)]
enum FeedCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Close,
}

enum SessionEnd {
    Disconnected,
    Closed,
    ReceiverGone,
}

/// Live quote stream with automatic reconnection.
///
/// The subscription set is owned here, so every reconnect subscribes to
/// exactly the instruments currently in it. Changes made while connected are
/// sent as deltas.
pub struct QuoteStreamClient {
    config: FeedConfig,
    credentials: Credentials,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
    connected: Arc<watch::Sender<bool>>,
    command_tx: mpsc::UnboundedSender<FeedCommand>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<FeedCommand>>>,
}

impl QuoteStreamClient {
    pub fn new(config: FeedConfig, credentials: Credentials) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(false);

        Self {
            config,
            credentials,
            subscriptions: Arc::new(Mutex::new(BTreeSet::new())),
            connected: Arc::new(connected),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
        }
    }

    fn subscription_set(&self) -> MutexGuard<'_, BTreeSet<String>> {
        lock_set(&self.subscriptions)
    }

    /// Spawn the connection task. Ticks are forwarded to `tick_tx` until the
    /// receiver is dropped, `close` is called or `shutdown` fires.
    pub fn start(
        &self,
        tick_tx: mpsc::Sender<Tick>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<Result<(), FeedError>>, FeedError> {
        // Fail fast on a malformed url or credentials
        build_request(&self.config.url, &self.credentials)?;

        let commands = self
            .command_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(FeedError::AlreadyStarted)?;

        let task = ConnectionTask {
            config: self.config.clone(),
            credentials: self.credentials.clone(),
            subscriptions: self.subscriptions.clone(),
            connected: self.connected.clone(),
            commands,
            tick_tx,
            shutdown,
            frames_received: 0,
        };

        Ok(tokio::spawn(task.run()))
    }

    /// Add instruments to the subscription set. Already-subscribed ids are
    /// ignored. Returns the ids that were newly added.
    pub fn subscribe<I, S>(&self, instruments: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let added: Vec<String> = {
            let mut set = self.subscription_set();
            instruments
                .into_iter()
                .map(Into::into)
                .filter(|id: &String| set.insert(id.clone()))
                .collect()
        };

        if !added.is_empty() {
            info!("📡 Subscribing to {:?}", added);
            let _ = self.command_tx.send(FeedCommand::Subscribe(added.clone()));
        }
        added
    }

    /// Remove instruments from the subscription set. Ids not in the set are a
    /// no-op and nothing is sent for them.
    pub fn unsubscribe<I, S>(&self, instruments: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let removed: Vec<String> = {
            let mut set = self.subscription_set();
            instruments
                .into_iter()
                .map(Into::into)
                .filter(|id: &String| set.remove(id))
                .collect()
        };

        if !removed.is_empty() {
            info!("Unsubscribing from {:?}", removed);
            let _ = self.command_tx.send(FeedCommand::Unsubscribe(removed.clone()));
        }
        removed
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscription_set().iter().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until a connection is open and subscribed. False on timeout.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.connected.subscribe();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|connected| *connected)).await,
            Ok(Ok(_))
        );
        ready
    }

    /// Close the connection and stop reconnecting
    pub fn close(&self) {
        let _ = self.command_tx.send(FeedCommand::Close);
    }
}

fn lock_set(set: &Mutex<BTreeSet<String>>) -> MutexGuard<'_, BTreeSet<String>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

fn build_request(url: &str, credentials: &Credentials) -> Result<Request, FeedError> {
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();

    let token = HeaderValue::from_str(&credentials.access_token)
        .map_err(|e| FeedError::InvalidHeader(format!("access-token: {e}")))?;
    let client_id = HeaderValue::from_str(&credentials.client_id)
        .map_err(|e| FeedError::InvalidHeader(format!("client-id: {e}")))?;

    headers.insert("access-token", token);
    headers.insert("client-id", client_id);
    Ok(request)
}

struct ConnectionTask {
    config: FeedConfig,
    credentials: Credentials,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
    connected: Arc<watch::Sender<bool>>,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
    tick_tx: mpsc::Sender<Tick>,
    shutdown: broadcast::Receiver<()>,
    /// Data frames seen on the current connection
    frames_received: u64,
}

impl ConnectionTask {
    async fn run(mut self) -> Result<(), FeedError> {
        let base_delay = Duration::from_secs(self.config.reconnect_delay_secs);
        let max_delay = Duration::from_secs(self.config.max_reconnect_delay_secs).max(base_delay);
        let mut delay = base_delay;
        let mut failures: u32 = 0;

        loop {
            let request = build_request(&self.config.url, &self.credentials)?;
            info!("🔌 Connecting to quote stream: {}", self.config.url);

            let conn = tokio::select! {
                result = connect_async(request) => result,
                _ = self.shutdown.recv() => {
                    info!("Quote stream shutdown");
                    return Ok(());
                }
            };

            match conn {
                Ok((ws_stream, _)) => {
                    self.frames_received = 0;
                    let end = self.session(ws_stream).await;
                    self.connected.send_replace(false);

                    match end {
                        SessionEnd::Closed => {
                            info!("Quote stream closed");
                            return Ok(());
                        }
                        SessionEnd::ReceiverGone => {
                            warn!("Tick receiver dropped, stopping quote stream");
                            return Ok(());
                        }
                        SessionEnd::Disconnected => {}
                    }

                    // A handshake alone does not prove the feed is healthy
                    if self.frames_received > 0 {
                        failures = 0;
                        delay = base_delay;
                    } else {
                        failures += 1;
                        warn!("Quote stream dropped before delivering any data");
                        self.check_attempts(failures)?;
                    }
                }
                Err(e) => {
                    failures += 1;
                    error!("❌ Quote stream connection failed: {}", e);
                    self.check_attempts(failures)?;
                }
            }

            warn!("Reconnecting in {:?}...", delay);
            if !self.wait_before_reconnect(delay).await {
                return Ok(());
            }
            delay = (delay * 2).min(max_delay);
        }
    }

    fn check_attempts(&self, failures: u32) -> Result<(), FeedError> {
        match self.config.max_reconnect_attempts {
            Some(max) if failures >= max => {
                error!("Giving up on quote stream after {} attempts", failures);
                Err(FeedError::RetriesExhausted(failures))
            }
            _ => Ok(()),
        }
    }

    /// Sleep out the backoff. False if asked to stop meanwhile.
    async fn wait_before_reconnect(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.shutdown.recv() => return false,
                cmd = self.commands.recv() => match cmd {
                    Some(FeedCommand::Close) | None => return false,
                    // Picked up by the full resubscribe on connect
                    Some(_) => {}
                },
            }
        }
    }

    async fn session(&mut self, ws_stream: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws_stream.split();

        // Queued deltas are superseded by the full resubscribe below
        while let Ok(cmd) = self.commands.try_recv() {
            if matches!(cmd, FeedCommand::Close) {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Closed;
            }
        }

        let snapshot: Vec<String> = lock_set(&self.subscriptions).iter().cloned().collect();
        if !snapshot.is_empty() {
            let request = SubscriptionRequest::subscribe(&self.config.mode, snapshot.iter().cloned());
            if let Err(e) = send_request(&mut write, &request).await {
                warn!("Failed to send subscription: {}", e);
                return SessionEnd::Disconnected;
            }
        }

        self.connected.send_replace(true);
        info!(
            "✅ Quote stream connected, subscribed to {} instruments",
            snapshot.len()
        );

        self.read_loop(&mut write, &mut read).await
    }

    async fn read_loop(&mut self, write: &mut WsWrite, read: &mut WsRead) -> SessionEnd {
        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !self.forward(&text).await {
                            return SessionEnd::ReceiverGone;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if !self.forward(&text).await {
                                return SessionEnd::ReceiverGone;
                            }
                        }
                        Err(_) => debug!("Ignoring non-UTF8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        warn!("Quote stream closed by server: {:?}", frame);
                        return SessionEnd::Disconnected;
                    }
                    Some(Ok(_)) => {} // Ping, Pong, Frame
                    Some(Err(e)) => {
                        warn!("Quote stream error: {}", e);
                        return SessionEnd::Disconnected;
                    }
                    None => {
                        warn!("Quote stream ended");
                        return SessionEnd::Disconnected;
                    }
                },
                cmd = self.commands.recv() => {
                    let request = match cmd {
                        Some(FeedCommand::Subscribe(ids)) => {
                            SubscriptionRequest::subscribe(&self.config.mode, ids)
                        }
                        Some(FeedCommand::Unsubscribe(ids)) => {
                            SubscriptionRequest::unsubscribe(&self.config.mode, ids)
                        }
                        Some(FeedCommand::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            return SessionEnd::Closed;
                        }
                    };
                    if let Err(e) = send_request(write, &request).await {
                        warn!("Failed to send subscription change: {}", e);
                        return SessionEnd::Disconnected;
                    }
                }
                _ = self.shutdown.recv() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Closed;
                }
            }
        }
    }

    /// False once the tick receiver is gone
    async fn forward(&mut self, text: &str) -> bool {
        self.frames_received += 1;
        let ticks = match decode_ticks(text, Utc::now()) {
            Ok(ticks) => ticks,
            Err(e) => {
                debug!("Ignoring undecodable frame: {}", e);
                return true;
            }
        };

        for tick in ticks {
            if self.tick_tx.send(tick).await.is_err() {
                return false;
            }
        }
        true
    }
}

async fn send_request(write: &mut WsWrite, request: &SubscriptionRequest) -> Result<(), FeedError> {
    let payload = request.to_json()?;
    write.send(Message::Text(payload)).await?;
    Ok(())
}
