//! The geochat facade offered to the presentation layer.
//!
//! [`GeoChat`] ties the pieces together: the router picks cells, the manager
//! opens subscriptions on the shared pool, and the store merges what comes
//! back. One precision is active at a time; joining at another precision
//! leaves every channel joined at the old one.

use crate::config::{ConfigError, GeoChatConfig};
use crate::manager::{ChannelSubscriptions, SubscriptionManager};
use crate::merge::MergeStats;
use crate::router::{ChannelRoute, ChannelRouter};
use crate::store::ChatStore;
use geochat_client::{
    ClientError, ConnectionState, PublishReport, RelayPool, RelayStats, SubscriptionPhase,
};
use geochat_core::{ChatEvent, Event, EventError, GeoCell, GeohashError, label_for};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Errors surfaced to the presentation layer.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("relay error: {0}")]
    Client(#[from] ClientError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("geohash error: {0}")]
    Geohash(#[from] GeohashError),

    #[error("event error: {0}")]
    Event(#[from] EventError),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("coordinate out of range: {lat}, {lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },
}

/// What a channel looks like from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// No relay connected yet; some are still on their first attempt
    Connecting,
    /// Receiving stored results
    Backfilling,
    /// Tailing new events
    Live,
    /// Every relay the channel uses is failing
    Unavailable,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelStatus::Connecting => "connecting",
            ChannelStatus::Backfilling => "backfilling",
            ChannelStatus::Live => "live",
            ChannelStatus::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Location-based chat over a redundant relay pool.
#[derive(Clone)]
pub struct GeoChat {
    config: Arc<GeoChatConfig>,
    router: ChannelRouter,
    manager: SubscriptionManager,
    store: ChatStore,
    /// Serializes join/leave and records the active precision
    membership: Arc<Mutex<Option<usize>>>,
    cancel: CancellationToken,
}

fn not_found(key: &GeoCell) -> ChatError {
    ChatError::ChannelNotFound(key.to_string())
}

impl GeoChat {
    /// Validate `config`, open the pool and start connecting.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: GeoChatConfig) -> Result<Self, ChatError> {
        config.validate()?;
        let pool = RelayPool::open(&config.relays, config.relay_config())?;
        let store = ChatStore::new(config.merge_limits());
        let cancel = CancellationToken::new();

        tokio::spawn(forward_pool_events(
            pool.notifications(),
            store.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            router: ChannelRouter::from_config(&config),
            manager: SubscriptionManager::new(pool, &config),
            store,
            config: Arc::new(config),
            membership: Arc::new(Mutex::new(None)),
            cancel,
        })
    }

    pub fn config(&self) -> &GeoChatConfig {
        &self.config
    }

    pub fn pool(&self) -> &RelayPool {
        self.manager.pool()
    }

    /// Join the channel containing a coordinate.
    pub async fn join(
        &self,
        lat: f64,
        lon: f64,
        precision: Option<usize>,
    ) -> Result<GeoCell, ChatError> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(ChatError::InvalidCoordinate { lat, lon });
        }
        self.join_route(self.router.route(lat, lon, precision)).await
    }

    /// Join a channel by its geohash.
    pub async fn join_cell(&self, cell: &str) -> Result<GeoCell, ChatError> {
        let cell = GeoCell::parse(cell)?;
        self.join_route(self.router.route_cell(cell)).await
    }

    async fn join_route(&self, route: ChannelRoute) -> Result<GeoCell, ChatError> {
        let mut active = self.membership.lock().await;
        let key = route.key.clone();
        if self.store.contains(&key).await {
            return Ok(key);
        }

        let precision = key.precision();
        if active.is_some_and(|p| p != precision) {
            info!("Switching channel precision to {}", precision);
            for subscriptions in self.store.clear().await {
                self.manager.close(&subscriptions).await?;
            }
        }

        let (subscriptions, inbound) = self.manager.open(&route.cells).await?;
        let label = route.label();
        let cells = route.cells.len();
        if let Some(previous) = self.store.insert_channel(route, subscriptions, inbound).await {
            self.manager.close(&previous).await?;
        }
        *active = Some(precision);

        info!("Joined channel {} ({}, {} cells)", key, label, cells);
        Ok(key)
    }

    /// Leave a channel. Leaving a channel that is not joined is a no-op.
    pub async fn leave(&self, key: &GeoCell) -> Result<(), ChatError> {
        let mut active = self.membership.lock().await;
        let Some(subscriptions) = self.store.remove_channel(key).await else {
            return Ok(());
        };
        self.manager.close(&subscriptions).await?;
        if self.store.keys().await.is_empty() {
            *active = None;
        }
        info!("Left channel {}", key);
        Ok(())
    }

    /// Joined channel keys.
    pub async fn channels(&self) -> Vec<GeoCell> {
        self.store.keys().await
    }

    /// Precision shared by every joined channel, if any are joined.
    pub async fn active_precision(&self) -> Option<usize> {
        *self.membership.lock().await
    }

    pub fn label(&self, key: &GeoCell) -> &'static str {
        label_for(key)
    }

    /// Ordered, deduplicated snapshot of a channel.
    pub async fn messages(&self, key: &GeoCell) -> Result<Vec<ChatEvent>, ChatError> {
        self.store.messages(key).await.ok_or_else(|| not_found(key))
    }

    pub async fn unread(&self, key: &GeoCell) -> Result<usize, ChatError> {
        self.store.unread(key).await.ok_or_else(|| not_found(key))
    }

    pub async fn mark_read(&self, key: &GeoCell) -> Result<(), ChatError> {
        self.store.mark_read(key).await.ok_or_else(|| not_found(key))
    }

    pub async fn last_read_at(&self, key: &GeoCell) -> Result<Option<u64>, ChatError> {
        if !self.store.contains(key).await {
            return Err(not_found(key));
        }
        Ok(self.store.last_read_at(key).await)
    }

    /// Revision counter that changes whenever the channel does.
    pub async fn watch(&self, key: &GeoCell) -> Result<watch::Receiver<u64>, ChatError> {
        self.store.watch(key).await.ok_or_else(|| not_found(key))
    }

    pub async fn merge_stats(&self, key: &GeoCell) -> Result<MergeStats, ChatError> {
        self.store.merge_stats(key).await.ok_or_else(|| not_found(key))
    }

    pub async fn relay_stats(&self) -> Vec<RelayStats> {
        self.pool().stats().await
    }

    pub async fn status(&self, key: &GeoCell) -> Result<ChannelStatus, ChatError> {
        let subscriptions = self
            .store
            .subscriptions(key)
            .await
            .ok_or_else(|| not_found(key))?;
        Ok(self.status_of(&subscriptions).await)
    }

    async fn status_of(&self, subscriptions: &ChannelSubscriptions) -> ChannelStatus {
        let targets = self.pool().subscription_relays(&subscriptions.live_id).await;
        let relays: Vec<RelayStats> = self
            .pool()
            .stats()
            .await
            .into_iter()
            .filter(|s| targets.contains(&s.url))
            .collect();

        let connected = relays.iter().any(|s| s.state == ConnectionState::Connected);
        if !connected {
            if relays.iter().all(|s| s.consecutive_failures > 0) {
                return ChannelStatus::Unavailable;
            }
            return ChannelStatus::Connecting;
        }

        match self.manager.phase(subscriptions).await {
            SubscriptionPhase::Live => ChannelStatus::Live,
            _ => ChannelStatus::Backfilling,
        }
    }

    /// Publish an event signed elsewhere to every relay.
    ///
    /// Succeeds when at least one relay accepts it.
    pub async fn publish(&self, event: Event) -> Result<PublishReport, ChatError> {
        ChatEvent::from_event(event.clone())?;
        Ok(self.pool().publish(&event, None).await?)
    }

    /// Leave every channel and close the pool. Idempotent.
    pub async fn shutdown(&self) {
        let mut active = self.membership.lock().await;
        self.cancel.cancel();
        for subscriptions in self.store.clear().await {
            if let Err(e) = self.manager.close(&subscriptions).await {
                debug!("Closing subscriptions during shutdown: {}", e);
            }
        }
        *active = None;
        self.pool().close().await;
    }
}

/// Relay connects and drops change channel status, so surface them as revisions.
async fn forward_pool_events(
    mut events: broadcast::Receiver<geochat_client::PoolEvent>,
    store: ChatStore,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    for key in store.keys().await {
                        store.touch(&key).await;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
