//! Relay pool for managing connections to multiple relays.
//!
//! The pool owns one supervisor task per relay plus a dispatcher task. Relay
//! tasks push everything they read into a single signal queue; the dispatcher
//! updates subscription phases and forwards events to each subscription's
//! sink. Relays fail independently: one unreachable relay never delays
//! subscribing or publishing on the others.

use crate::error::{ClientError, Result};
use crate::message::Filter;
use crate::relay::{ConnectionState, RelayConfig, RelayConnection, RelaySignal, RelayStats};
use crate::subscription::{SubscriptionPhase, SubscriptionTracker, generate_subscription_id};
use futures::future::join_all;
use geochat_core::{ChatEvent, Event};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long `close` waits for each task before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Connection-level events emitted by the relay pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A relay connected
    Connected { relay_url: String },
    /// A relay disconnected
    Disconnected { relay_url: String, error: String },
    /// Notice from a relay
    Notice { relay_url: String, message: String },
}

/// Events delivered to a subscription's sink.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// An event was received from a relay
    Event {
        relay_url: String,
        subscription_id: String,
        event: ChatEvent,
    },
    /// EOSE received for a subscription on a relay
    Eose {
        relay_url: String,
        subscription_id: String,
    },
    /// The subscription finished backfilling
    AllEose { subscription_id: String },
    /// A relay refused or dropped the subscription
    Closed {
        relay_url: String,
        subscription_id: String,
        message: String,
    },
}

impl SubscriptionEvent {
    pub fn subscription_id(&self) -> &str {
        match self {
            SubscriptionEvent::Event {
                subscription_id, ..
            }
            | SubscriptionEvent::Eose {
                subscription_id, ..
            }
            | SubscriptionEvent::AllEose { subscription_id }
            | SubscriptionEvent::Closed {
                subscription_id, ..
            } => subscription_id,
        }
    }
}

/// Per-relay outcome of a publish that at least one relay accepted.
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub event_id: String,
    /// Relays that accepted the event
    pub accepted: Vec<String>,
    /// Relays that refused or failed, with the reason
    pub rejected: Vec<(String, String)>,
}

struct SubscriptionEntry {
    tracker: SubscriptionTracker,
    sink: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl SubscriptionEntry {
    fn forward(&self, event: SubscriptionEvent) -> bool {
        self.sink.send(event).is_ok()
    }

    fn went_live(&self) -> bool {
        self.forward(SubscriptionEvent::AllEose {
            subscription_id: self.tracker.id.clone(),
        })
    }
}

struct Shared {
    /// Connections indexed by URL
    relays: RwLock<HashMap<String, Arc<RelayConnection>>>,
    /// Subscription trackers indexed by subscription ID
    subscriptions: RwLock<HashMap<String, SubscriptionEntry>>,
    /// Broadcast channel for pool events
    events_tx: broadcast::Sender<PoolEvent>,
}

/// A pool of relay connections.
///
/// Cloning is cheap and every clone drives the same pool.
#[derive(Clone)]
pub struct RelayPool {
    shared: Arc<Shared>,
    config: RelayConfig,
    signals_tx: mpsc::UnboundedSender<(String, RelaySignal)>,
    cancel: CancellationToken,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
    closed: Arc<AtomicBool>,
}

impl RelayPool {
    /// Start connecting to every endpoint and return without waiting.
    ///
    /// Must be called inside a tokio runtime. Fails only when an endpoint
    /// address is invalid.
    pub fn open<I, S>(endpoints: I, config: RelayConfig) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let cancel = CancellationToken::new();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let mut relays = HashMap::new();
        for endpoint in endpoints {
            let url = endpoint.as_ref().trim().to_string();
            if relays.contains_key(&url) {
                continue;
            }
            match RelayConnection::spawn(&url, config.clone(), signals_tx.clone(), cancel.child_token()) {
                Ok(conn) => {
                    info!("Adding relay to pool: {}", url);
                    relays.insert(url, Arc::new(conn));
                }
                Err(e) => {
                    cancel.cancel();
                    return Err(e);
                }
            }
        }

        let (events_tx, _) = broadcast::channel(1000);
        let shared = Arc::new(Shared {
            relays: RwLock::new(relays),
            subscriptions: RwLock::new(HashMap::new()),
            events_tx,
        });

        let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared), signals_rx, cancel.clone()));

        Ok(Self {
            shared,
            config,
            signals_tx,
            cancel,
            dispatcher: Arc::new(Mutex::new(Some(dispatcher))),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Subscribe to pool events.
    pub fn notifications(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Get all relay URLs in the pool.
    pub async fn relay_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.shared.relays.read().await.keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Get connection states for all relays.
    pub async fn states(&self) -> HashMap<String, ConnectionState> {
        let relays = self.shared.relays.read().await;
        let mut states = HashMap::new();
        for (url, conn) in relays.iter() {
            states.insert(url.clone(), conn.state().await);
        }
        states
    }

    /// Per-relay counters, sorted by URL.
    pub async fn stats(&self) -> Vec<RelayStats> {
        let relays: Vec<Arc<RelayConnection>> =
            self.shared.relays.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(relays.len());
        for conn in relays {
            stats.push(conn.stats().await);
        }
        stats.sort_by(|a, b| a.url.cmp(&b.url));
        stats
    }

    /// Check if a relay is connected.
    pub async fn is_connected(&self, url: &str) -> bool {
        let conn = self.shared.relays.read().await.get(url).cloned();
        match conn {
            Some(conn) => conn.is_connected().await,
            None => false,
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.states()
            .await
            .values()
            .filter(|s| **s == ConnectionState::Connected)
            .count()
    }

    /// Wait until at least one relay is connected.
    pub async fn wait_for_connection(&self, wait: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if self.connected_count().await > 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout(format!(
                    "No relay connected after {:?}",
                    wait
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Add a relay to the pool. Existing subscriptions are not extended to it.
    pub async fn add_relay(&self, url: &str) -> Result<()> {
        self.ensure_open()?;
        let url = url.trim().to_string();
        let mut relays = self.shared.relays.write().await;
        if relays.contains_key(&url) {
            return Ok(());
        }
        let conn = RelayConnection::spawn(
            &url,
            self.config.clone(),
            self.signals_tx.clone(),
            self.cancel.child_token(),
        )?;
        info!("Adding relay to pool: {}", url);
        relays.insert(url, Arc::new(conn));
        Ok(())
    }

    /// Remove a relay from the pool and stop its task.
    pub async fn remove_relay(&self, url: &str) -> Result<()> {
        let conn = self
            .shared
            .relays
            .write()
            .await
            .remove(url)
            .ok_or_else(|| ClientError::UnknownRelay(url.to_string()))?;
        info!("Removing relay from pool: {}", url);
        conn.close(CLOSE_GRACE).await;

        let mut subscriptions = self.shared.subscriptions.write().await;
        for entry in subscriptions.values_mut() {
            if entry.tracker.remove_relay(url) {
                entry.went_live();
            }
        }
        Ok(())
    }

    async fn resolve_targets(&self, targets: Option<&[String]>) -> Result<Vec<Arc<RelayConnection>>> {
        let relays = self.shared.relays.read().await;
        let resolved: Vec<Arc<RelayConnection>> = match targets {
            None => relays.values().cloned().collect(),
            Some(urls) => urls
                .iter()
                .map(|url| {
                    relays
                        .get(url.trim())
                        .cloned()
                        .ok_or_else(|| ClientError::UnknownRelay(url.clone()))
                })
                .collect::<Result<_>>()?,
        };
        if resolved.is_empty() {
            return Err(ClientError::Subscription(
                "no relays to target".to_string(),
            ));
        }
        Ok(resolved)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ClientError::PoolClosed)
        } else {
            Ok(())
        }
    }

    /// Register `filters` on `targets` (all relays if `None`), delivering into `sink`.
    ///
    /// Several subscriptions may share one sink. Relays that are down receive
    /// the REQ when they reconnect.
    pub async fn subscribe_into(
        &self,
        filters: Vec<Filter>,
        targets: Option<&[String]>,
        sink: mpsc::UnboundedSender<SubscriptionEvent>,
    ) -> Result<String> {
        self.ensure_open()?;
        let relays = self.resolve_targets(targets).await?;
        let subscription_id = generate_subscription_id();

        let tracker = SubscriptionTracker::new(
            subscription_id.clone(),
            filters.clone(),
            relays.iter().map(|r| r.url().to_string()),
        );
        self.shared
            .subscriptions
            .write()
            .await
            .insert(subscription_id.clone(), SubscriptionEntry { tracker, sink });

        for relay in &relays {
            relay.subscribe(&subscription_id, filters.clone()).await?;
        }
        debug!(
            "Subscription {} registered on {} relays",
            subscription_id,
            relays.len()
        );
        Ok(subscription_id)
    }

    /// Subscribe with a dedicated receiver.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        targets: Option<&[String]>,
    ) -> Result<(String, mpsc::UnboundedReceiver<SubscriptionEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe_into(filters, targets, tx).await?;
        Ok((id, rx))
    }

    /// Phase of a subscription. Unknown or closed ids report `Closed`.
    pub async fn phase(&self, subscription_id: &str) -> SubscriptionPhase {
        self.shared
            .subscriptions
            .read()
            .await
            .get(subscription_id)
            .map(|entry| entry.tracker.phase())
            .unwrap_or(SubscriptionPhase::Closed)
    }

    /// Relays a subscription targets.
    pub async fn subscription_relays(&self, subscription_id: &str) -> Vec<String> {
        self.shared
            .subscriptions
            .read()
            .await
            .get(subscription_id)
            .map(|entry| entry.tracker.relays().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Close a subscription on every relay. Idempotent.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let entry = self.shared.subscriptions.write().await.remove(subscription_id);
        let Some(mut entry) = entry else {
            return Ok(());
        };
        entry.tracker.close();

        let relays = self.shared.relays.read().await;
        for url in entry.tracker.relays() {
            if let Some(relay) = relays.get(url)
                && let Err(e) = relay.unsubscribe(subscription_id).await
            {
                debug!("Unsubscribe {} on {} skipped: {}", subscription_id, url, e);
            }
        }
        debug!("Subscription {} closed", subscription_id);
        Ok(())
    }

    /// Best-effort publish to `targets` (all relays if `None`).
    ///
    /// Succeeds when at least one relay accepts; every refusal is logged and
    /// listed in the report. Fails only when no relay accepted.
    pub async fn publish(&self, event: &Event, targets: Option<&[String]>) -> Result<PublishReport> {
        self.ensure_open()?;
        let relays = self.resolve_targets(targets).await?;
        let wait = self.config.publish_timeout;

        let results = join_all(relays.iter().map(|relay| async move {
            (relay.url().to_string(), relay.publish(event, wait).await)
        }))
        .await;

        let mut report = PublishReport {
            event_id: event.id.clone(),
            accepted: Vec::new(),
            rejected: Vec::new(),
        };
        for (url, result) in results {
            match result {
                Ok(confirmation) if confirmation.accepted => report.accepted.push(url),
                Ok(confirmation) => {
                    warn!("Relay {} rejected event {}: {}", url, event.id, confirmation.message);
                    report.rejected.push((url, confirmation.message));
                }
                Err(e) => {
                    warn!("Failed to publish event {} to {}: {}", event.id, url, e);
                    report.rejected.push((url, e.to_string()));
                }
            }
        }

        if report.accepted.is_empty() {
            return Err(ClientError::PublishFailed {
                event_id: report.event_id,
                reasons: report.rejected,
            });
        }
        info!(
            "Published event {} to {}/{} relays",
            event.id,
            report.accepted.len(),
            report.accepted.len() + report.rejected.len()
        );
        Ok(report)
    }

    /// Stop every relay and the dispatcher. Idempotent.
    ///
    /// Subscription sinks are dropped, which ends every subscriber's stream.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing relay pool");
        self.cancel.cancel();

        let relays: Vec<Arc<RelayConnection>> =
            self.shared.relays.write().await.drain().map(|(_, r)| r).collect();
        join_all(relays.iter().map(|relay| relay.close(CLOSE_GRACE))).await;

        if let Some(mut handle) = self.dispatcher.lock().await.take()
            && tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err()
        {
            handle.abort();
        }
        self.shared.subscriptions.write().await.clear();
    }
}

async fn dispatch(
    shared: Arc<Shared>,
    mut signals: mpsc::UnboundedReceiver<(String, RelaySignal)>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some((url, signal)) => handle_signal(&shared, url, signal).await,
                None => break,
            },
        }
    }
    debug!("Pool dispatcher stopped");
}

async fn handle_signal(shared: &Shared, relay_url: String, signal: RelaySignal) {
    match signal {
        RelaySignal::Connected => {
            let _ = shared.events_tx.send(PoolEvent::Connected { relay_url });
        }
        RelaySignal::Disconnected { error } => {
            let mut subscriptions = shared.subscriptions.write().await;
            for entry in subscriptions.values_mut() {
                if entry.tracker.mark_lost(&relay_url) {
                    entry.went_live();
                }
            }
            let _ = shared
                .events_tx
                .send(PoolEvent::Disconnected { relay_url, error });
        }
        RelaySignal::Subscribed { subscription_id } => {
            let mut subscriptions = shared.subscriptions.write().await;
            if let Some(entry) = subscriptions.get_mut(&subscription_id)
                && entry.tracker.mark_issued(&relay_url)
            {
                entry.went_live();
            }
        }
        RelaySignal::Event {
            subscription_id,
            event,
        } => {
            let subscriptions = shared.subscriptions.read().await;
            let Some(entry) = subscriptions.get(&subscription_id) else {
                debug!("Dropping event for unknown subscription {}", subscription_id);
                return;
            };
            if !entry.tracker.has_relay(&relay_url) {
                return;
            }
            if !entry.forward(SubscriptionEvent::Event {
                relay_url,
                subscription_id: subscription_id.clone(),
                event,
            }) {
                debug!("Subscription {} sink closed", subscription_id);
            }
        }
        RelaySignal::Eose { subscription_id } => {
            let mut subscriptions = shared.subscriptions.write().await;
            let Some(entry) = subscriptions.get_mut(&subscription_id) else {
                return;
            };
            let live = entry.tracker.mark_eose(&relay_url);
            entry.forward(SubscriptionEvent::Eose {
                relay_url,
                subscription_id,
            });
            if live {
                entry.went_live();
            }
        }
        RelaySignal::Closed {
            subscription_id,
            message,
        } => {
            warn!(
                "Relay {} closed subscription {}: {}",
                relay_url, subscription_id, message
            );
            let mut subscriptions = shared.subscriptions.write().await;
            let Some(entry) = subscriptions.get_mut(&subscription_id) else {
                return;
            };
            let live = entry.tracker.mark_lost(&relay_url);
            entry.forward(SubscriptionEvent::Closed {
                relay_url,
                subscription_id,
                message,
            });
            if live {
                entry.went_live();
            }
        }
        RelaySignal::Notice { message } => {
            info!("Notice from {}: {}", relay_url, message);
            let _ = shared
                .events_tx
                .send(PoolEvent::Notice { relay_url, message });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message};

    fn fast_config() -> RelayConfig {
        RelayConfig {
            connect_timeout: Duration::from_millis(300),
            publish_timeout: Duration::from_millis(300),
            backoff: BackoffConfig {
                initial: Duration::from_millis(20),
                max: Duration::from_millis(100),
                multiplier: 2.0,
            },
        }
    }

    async fn dead_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("ws://127.0.0.1:{}", listener.local_addr().unwrap().port())
    }

    /// Relay that answers every REQ with an immediate EOSE.
    async fn eose_relay() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://127.0.0.1:{}", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(socket).await else {
                        return;
                    };
                    while let Some(Ok(Message::Text(text))) = ws.next().await {
                        let Ok(frame) = serde_json::from_str::<Vec<serde_json::Value>>(text.as_str())
                        else {
                            continue;
                        };
                        if frame.first().and_then(|v| v.as_str()) == Some("REQ") {
                            let sub = frame[1].as_str().unwrap_or_default().to_string();
                            let reply = serde_json::json!(["EOSE", sub]).to_string();
                            if ws.send(Message::Text(reply.into())).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        url
    }

    /// Relay that reports each REQ and answers with EOSE only once `release` fires.
    async fn held_relay(
        seen: mpsc::UnboundedSender<String>,
        release: tokio::sync::oneshot::Receiver<()>,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://127.0.0.1:{}", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut ws) = accept_async(socket).await else {
                return;
            };
            let mut release = Some(release);
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let Ok(frame) = serde_json::from_str::<Vec<serde_json::Value>>(text.as_str()) else {
                    continue;
                };
                if frame.first().and_then(|v| v.as_str()) != Some("REQ") {
                    continue;
                }
                let sub = frame[1].as_str().unwrap_or_default().to_string();
                let _ = seen.send(sub.clone());
                if let Some(release) = release.take()
                    && release.await.is_err()
                {
                    return;
                }
                let reply = serde_json::json!(["EOSE", sub]).to_string();
                if ws.send(Message::Text(reply.into())).await.is_err() {
                    return;
                }
            }
        });
        url
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_endpoint() {
        let result = RelayPool::open(["ws://127.0.0.1:1", "http://example.com"], fast_config());
        assert!(matches!(result, Err(ClientError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_open_returns_before_connecting() {
        let dead = dead_url().await;
        let pool = RelayPool::open([dead.as_str(), dead.as_str()], fast_config()).unwrap();
        assert_eq!(pool.relay_urls().await, vec![dead.clone()]);
        assert_eq!(pool.connected_count().await, 0);
        assert!(pool.wait_for_connection(Duration::from_millis(100)).await.is_err());
        pool.close().await;
    }

    #[tokio::test]
    async fn test_unknown_target_rejected() {
        let dead = dead_url().await;
        let pool = RelayPool::open([dead.as_str()], fast_config()).unwrap();
        let targets = vec!["ws://127.0.0.1:9".to_string()];
        let err = pool
            .subscribe(vec![Filter::new()], Some(&targets))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownRelay(_)));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_goes_live_on_healthy_relay_only() {
        let dead = dead_url().await;
        let healthy = eose_relay().await;
        let pool = RelayPool::open([dead.as_str(), healthy.as_str()], fast_config()).unwrap();

        let (id, mut rx) = pool
            .subscribe(vec![Filter::new().kinds(vec![20000])], None)
            .await
            .unwrap();
        assert_eq!(pool.subscription_relays(&id).await.len(), 2);

        let mut live = false;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await {
            assert_eq!(event.subscription_id(), id);
            if matches!(event, SubscriptionEvent::AllEose { .. }) {
                live = true;
                break;
            }
        }
        assert!(live);
        assert_eq!(pool.phase(&id).await, SubscriptionPhase::Live);

        pool.unsubscribe(&id).await.unwrap();
        pool.unsubscribe(&id).await.unwrap();
        assert_eq!(pool.phase(&id).await, SubscriptionPhase::Closed);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_remove_relay_releases_backfill() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let (release_fast, fast_rx) = tokio::sync::oneshot::channel();
        let (_hold_silent, silent_rx) = tokio::sync::oneshot::channel::<()>();
        let fast = held_relay(seen_tx.clone(), fast_rx).await;
        let silent = held_relay(seen_tx, silent_rx).await;
        let pool = RelayPool::open([fast.as_str(), silent.as_str()], fast_config()).unwrap();

        let (id, mut rx) = pool
            .subscribe(vec![Filter::new().kinds(vec![20000])], None)
            .await
            .unwrap();
        for _ in 0..2 {
            let sub = tokio::time::timeout(Duration::from_secs(3), seen_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(sub, id);
        }
        // Let the dispatcher record both REQs as issued.
        tokio::time::sleep(Duration::from_millis(100)).await;

        release_fast.send(()).unwrap();
        let eose = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(eose, SubscriptionEvent::Eose { ref relay_url, .. } if *relay_url == fast));
        assert_eq!(pool.phase(&id).await, SubscriptionPhase::Backfilling);

        // The silent relay was the only one still backfilling.
        pool.remove_relay(&silent).await.unwrap();
        let live = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(live, SubscriptionEvent::AllEose { .. }));
        assert_eq!(pool.phase(&id).await, SubscriptionPhase::Live);
        assert_eq!(pool.subscription_relays(&id).await, vec![fast.clone()]);
        assert_eq!(pool.relay_urls().await, vec![fast.clone()]);

        assert!(matches!(
            pool.remove_relay(&silent).await,
            Err(ClientError::UnknownRelay(url)) if url == silent
        ));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_add_relay() {
        let first = dead_url().await;
        let second = dead_url().await;
        let pool = RelayPool::open([first.as_str()], fast_config()).unwrap();

        pool.add_relay(&second).await.unwrap();
        pool.add_relay(&second).await.unwrap();
        let mut expected = vec![first.clone(), second.clone()];
        expected.sort();
        assert_eq!(pool.relay_urls().await, expected);

        assert!(matches!(
            pool.add_relay("ftp://example.com").await,
            Err(ClientError::InvalidUrl(_))
        ));
        pool.remove_relay(&first).await.unwrap();
        assert_eq!(pool.relay_urls().await, vec![second.clone()]);

        pool.close().await;
        assert!(matches!(
            pool.add_relay(&first).await,
            Err(ClientError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn test_publish_fails_when_every_relay_down() {
        let a = dead_url().await;
        let b = dead_url().await;
        let pool = RelayPool::open([a.as_str(), b.as_str()], fast_config()).unwrap();
        let event = geochat_core::UnsignedEvent::new(
            "a".repeat(64),
            geochat_core::EventClass::Ephemeral,
            "u4pr",
            "hello",
            100,
        )
        .attach_proof("0".repeat(128))
        .unwrap();

        match pool.publish(&event, None).await {
            Err(ClientError::PublishFailed { event_id, reasons }) => {
                assert_eq!(event_id, event.id);
                assert_eq!(reasons.len(), 2);
            }
            other => panic!("expected PublishFailed, got {other:?}"),
        }
        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dead = dead_url().await;
        let pool = RelayPool::open([dead.as_str()], fast_config()).unwrap();
        let (_id, mut rx) = pool.subscribe(vec![Filter::new()], None).await.unwrap();

        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());
        assert!(pool.relay_urls().await.is_empty());
        // Sink dropped on close.
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            pool.subscribe(vec![Filter::new()], None).await,
            Err(ClientError::PoolClosed)
        ));
    }
}
