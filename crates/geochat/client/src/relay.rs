//! Single relay connection management
//!
//! Each relay is driven by its own supervisor task. The task connects, replays
//! every registered subscription, pumps frames until the socket drops, then
//! waits out a capped exponential backoff and tries again. Nothing a relay does
//! can block another relay's task.

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use geochat_core::{ChatEvent, Event};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected and not trying
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and ready
    Connected,
    /// Last attempt failed, waiting to retry
    Errored,
}

/// Relay connection configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// How long to wait for an OK after publishing
    pub publish_timeout: Duration,
    /// Reconnection backoff
    pub backoff: BackoffConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Confirmation result for event publishing
#[derive(Debug, Clone)]
pub struct PublishConfirmation {
    /// Event ID that was published
    pub event_id: String,
    /// Whether the relay accepted the event
    pub accepted: bool,
    /// Message from the relay (empty if accepted, error message if rejected)
    pub message: String,
}

/// Point-in-time view of one relay.
#[derive(Debug, Clone)]
pub struct RelayStats {
    pub url: String,
    pub state: ConnectionState,
    /// Last time any frame arrived
    pub last_seen: Option<SystemTime>,
    pub connect_attempts: u64,
    /// Failures since the last successful connection
    pub consecutive_failures: u32,
    pub frames_received: u64,
    /// Frames or events dropped at ingestion
    pub malformed_frames: u64,
    pub last_error: Option<String>,
}

impl RelayStats {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            state: ConnectionState::Disconnected,
            last_seen: None,
            connect_attempts: 0,
            consecutive_failures: 0,
            frames_received: 0,
            malformed_frames: 0,
            last_error: None,
        }
    }
}

/// What a relay task reports back to the pool.
#[derive(Debug, Clone)]
pub enum RelaySignal {
    Connected,
    /// A live connection was lost
    Disconnected { error: String },
    /// REQ for this subscription went out on the current connection
    Subscribed { subscription_id: String },
    /// A validated event for a subscription
    Event {
        subscription_id: String,
        event: ChatEvent,
    },
    Eose { subscription_id: String },
    Closed {
        subscription_id: String,
        message: String,
    },
    Notice { message: String },
}

/// Sender half the pool hands every relay task.
pub type SignalSender = mpsc::UnboundedSender<(String, RelaySignal)>;

enum RelayCommand {
    Subscribe(String),
    Unsubscribe(String),
    Publish {
        event: Event,
        reply: oneshot::Sender<PublishConfirmation>,
    },
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type Registry = Arc<RwLock<HashMap<String, Vec<Filter>>>>;

/// Relay connection
pub struct RelayConnection {
    /// Relay URL as configured
    url: String,
    stats: Arc<RwLock<RelayStats>>,
    /// Subscriptions registered on this relay, replayed on every connect
    subscriptions: Registry,
    commands: mpsc::UnboundedSender<RelayCommand>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayConnection {
    /// Validate `url` and start its supervisor task.
    ///
    /// Returns immediately; connecting happens in the background. The task
    /// stops when `cancel` (or a parent of it) is cancelled.
    pub fn spawn(
        url: &str,
        config: RelayConfig,
        signals: SignalSender,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let url = url.trim().to_string();
        let parsed = Url::parse(&url)?;

        // Validate WebSocket URL
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed.scheme()
            )));
        }

        let stats = Arc::new(RwLock::new(RelayStats::new(&url)));
        let subscriptions: Registry = Arc::new(RwLock::new(HashMap::new()));
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor {
            url: url.clone(),
            backoff: ExponentialBackoff::new(config.backoff),
            config,
            stats: Arc::clone(&stats),
            subscriptions: Arc::clone(&subscriptions),
            commands: commands_rx,
            signals,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(supervisor.run());

        Ok(Self {
            url,
            stats,
            subscriptions,
            commands,
            cancel,
            task: Mutex::new(Some(handle)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get current connection state
    pub async fn state(&self) -> ConnectionState {
        self.stats.read().await.state
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Register a subscription; it is sent now if connected and on every reconnect.
    pub async fn subscribe(&self, subscription_id: &str, filters: Vec<Filter>) -> Result<()> {
        self.subscriptions
            .write()
            .await
            .insert(subscription_id.to_string(), filters);
        self.commands
            .send(RelayCommand::Subscribe(subscription_id.to_string()))
            .map_err(|_| ClientError::PoolClosed)
    }

    /// Drop a subscription. Unknown ids are ignored.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        if self
            .subscriptions
            .write()
            .await
            .remove(subscription_id)
            .is_none()
        {
            return Ok(());
        }
        self.commands
            .send(RelayCommand::Unsubscribe(subscription_id.to_string()))
            .map_err(|_| ClientError::PoolClosed)
    }

    /// Ids of subscriptions currently registered on this relay.
    pub async fn active_subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().await.keys().cloned().collect()
    }

    /// Publish an event and wait for confirmation from the relay
    pub async fn publish(
        &self,
        event: &Event,
        confirmation_timeout: Duration,
    ) -> Result<PublishConfirmation> {
        if !self.is_connected().await {
            return Err(ClientError::NotConnected);
        }

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RelayCommand::Publish {
                event: event.clone(),
                reply,
            })
            .map_err(|_| ClientError::PoolClosed)?;

        match timeout(confirmation_timeout, rx).await {
            Ok(Ok(confirmation)) => Ok(confirmation),
            // Connection dropped before the relay answered
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => Err(ClientError::Timeout(format!(
                "Event confirmation timeout after {:?}",
                confirmation_timeout
            ))),
        }
    }

    /// Stop the supervisor, aborting it if it outlives `grace`. Idempotent.
    pub async fn close(&self, grace: Duration) {
        self.cancel.cancel();
        let Some(mut handle) = self.task.lock().await.take() else {
            return;
        };
        if timeout(grace, &mut handle).await.is_err() {
            warn!("Relay task for {} did not stop in {:?}, aborting", self.url, grace);
            handle.abort();
        }
    }
}

enum DriveOutcome {
    Shutdown,
    Lost(String),
}

struct Supervisor {
    url: String,
    config: RelayConfig,
    backoff: ExponentialBackoff,
    stats: Arc<RwLock<RelayStats>>,
    subscriptions: Registry,
    commands: mpsc::UnboundedReceiver<RelayCommand>,
    signals: SignalSender,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        self.supervise().await;
        self.stats.write().await.state = ConnectionState::Disconnected;
        debug!("Relay task for {} stopped", self.url);
    }

    async fn supervise(&mut self) {
        loop {
            {
                let mut stats = self.stats.write().await;
                stats.state = ConnectionState::Connecting;
                stats.connect_attempts += 1;
            }
            debug!("Connecting to relay: {}", self.url);

            let result = {
                let connect = timeout(
                    self.config.connect_timeout,
                    connect_async(self.url.as_str()),
                );
                tokio::pin!(connect);
                loop {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        result = &mut connect => break result,
                        // Offline: the registry replays REQs and publish waiters see a dropped reply.
                        cmd = self.commands.recv() => if cmd.is_none() {
                            return;
                        },
                    }
                }
            };

            let error = match result {
                Ok(Ok((ws, _))) => {
                    self.on_connected().await;
                    match self.drive(ws).await {
                        DriveOutcome::Shutdown => return,
                        DriveOutcome::Lost(reason) => {
                            warn!("Lost connection to relay {}: {}", self.url, reason);
                            let _ = self.signals.send((
                                self.url.clone(),
                                RelaySignal::Disconnected {
                                    error: reason.clone(),
                                },
                            ));
                            reason
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!("Failed to connect to relay {}: {}", self.url, e);
                    e.to_string()
                }
                Err(_) => {
                    let reason = format!("Connection timeout after {:?}", self.config.connect_timeout);
                    warn!("Failed to connect to relay {}: {}", self.url, reason);
                    reason
                }
            };

            {
                let mut stats = self.stats.write().await;
                stats.state = ConnectionState::Errored;
                stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
                stats.last_error = Some(error);
            }

            let delay = self.backoff.next_delay();
            debug!(
                "Retrying relay {} in {:?} (attempt {})",
                self.url,
                delay,
                self.backoff.attempt()
            );
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = &mut sleep => break,
                    // Offline: the registry replays REQs and publish waiters see a dropped reply.
                    cmd = self.commands.recv() => if cmd.is_none() {
                        return;
                    },
                }
            }
        }
    }

    async fn on_connected(&mut self) {
        self.backoff.reset();
        {
            let mut stats = self.stats.write().await;
            stats.state = ConnectionState::Connected;
            stats.consecutive_failures = 0;
            stats.last_error = None;
            stats.last_seen = Some(SystemTime::now());
        }
        info!("Connected to relay: {}", self.url);
        let _ = self
            .signals
            .send((self.url.clone(), RelaySignal::Connected));
    }

    /// Pump one live connection until it drops or the task is cancelled.
    async fn drive(&mut self, ws: WsStream) -> DriveOutcome {
        let (mut sink, mut stream) = ws.split();
        // Confirmations owned by this connection; dropping them fails the waiters.
        let mut pending: HashMap<String, oneshot::Sender<PublishConfirmation>> = HashMap::new();

        let registered: Vec<(String, Vec<Filter>)> = self
            .subscriptions
            .read()
            .await
            .iter()
            .map(|(id, filters)| (id.clone(), filters.clone()))
            .collect();
        for (subscription_id, filters) in registered {
            if let Err(reason) = self.send_req(&mut sink, subscription_id, filters).await {
                return DriveOutcome::Lost(reason);
            }
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return DriveOutcome::Shutdown;
                }
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        return DriveOutcome::Shutdown;
                    };
                    if let Err(reason) = self.handle_command(&mut sink, &mut pending, cmd).await {
                        return DriveOutcome::Lost(reason);
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_text(text.as_str(), &mut pending).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            return DriveOutcome::Lost(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        return DriveOutcome::Lost("closed by relay".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return DriveOutcome::Lost(e.to_string()),
                    None => return DriveOutcome::Lost("stream ended".to_string()),
                },
            }
        }
    }

    async fn send_req(
        &self,
        sink: &mut WsSink,
        subscription_id: String,
        filters: Vec<Filter>,
    ) -> std::result::Result<(), String> {
        let msg = ClientMessage::Req {
            subscription_id: subscription_id.clone(),
            filters,
        };
        send_frame(sink, &msg).await?;
        debug!("Sent REQ {} to {}", subscription_id, self.url);
        let _ = self
            .signals
            .send((self.url.clone(), RelaySignal::Subscribed { subscription_id }));
        Ok(())
    }

    async fn handle_command(
        &self,
        sink: &mut WsSink,
        pending: &mut HashMap<String, oneshot::Sender<PublishConfirmation>>,
        cmd: RelayCommand,
    ) -> std::result::Result<(), String> {
        match cmd {
            RelayCommand::Subscribe(subscription_id) => {
                let filters = self.subscriptions.read().await.get(&subscription_id).cloned();
                // Already unsubscribed again before we got here
                let Some(filters) = filters else {
                    return Ok(());
                };
                self.send_req(sink, subscription_id, filters).await
            }
            RelayCommand::Unsubscribe(subscription_id) => {
                send_frame(sink, &ClientMessage::Close { subscription_id }).await
            }
            RelayCommand::Publish { event, reply } => {
                track_pending(pending, event.id.clone(), reply);
                send_frame(sink, &ClientMessage::Event(event)).await
            }
        }
    }

    async fn handle_text(
        &self,
        text: &str,
        pending: &mut HashMap<String, oneshot::Sender<PublishConfirmation>>,
    ) {
        {
            let mut stats = self.stats.write().await;
            stats.frames_received += 1;
            stats.last_seen = Some(SystemTime::now());
        }

        let msg = match RelayMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Dropping malformed frame from {}: {}", self.url, e);
                self.stats.write().await.malformed_frames += 1;
                return;
            }
        };

        let signal = match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => match ChatEvent::from_event(event) {
                Ok(event) => RelaySignal::Event {
                    subscription_id,
                    event,
                },
                Err(e) => {
                    debug!("Dropping invalid event from {}: {}", self.url, e);
                    self.stats.write().await.malformed_frames += 1;
                    return;
                }
            },
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                if let Some(reply) = pending.remove(&event_id) {
                    let _ = reply.send(PublishConfirmation {
                        event_id,
                        accepted: success,
                        message,
                    });
                }
                return;
            }
            RelayMessage::Eose { subscription_id } => RelaySignal::Eose { subscription_id },
            RelayMessage::Closed {
                subscription_id,
                message,
            } => RelaySignal::Closed {
                subscription_id,
                message,
            },
            RelayMessage::Notice { message } => RelaySignal::Notice { message },
        };
        let _ = self.signals.send((self.url.clone(), signal));
    }
}

async fn send_frame(sink: &mut WsSink, msg: &ClientMessage) -> std::result::Result<(), String> {
    let json = msg.to_json().map_err(|e| e.to_string())?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| e.to_string())
}

/// Register a publish waiting for OK, dropping waiters that already gave up.
fn track_pending(
    pending: &mut HashMap<String, oneshot::Sender<PublishConfirmation>>,
    event_id: String,
    reply: oneshot::Sender<PublishConfirmation>,
) {
    pending.retain(|_, waiter| !waiter.is_closed());
    pending.insert(event_id, reply);
}
