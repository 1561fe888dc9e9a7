//! Subscription manager: turns a channel join into the live and historical
//! subscriptions and tracks their phase.

use crate::config::GeoChatConfig;
use crate::unix_now;
use geochat_client::{ClientError, Filter, RelayPool, SubscriptionEvent, SubscriptionPhase};
use geochat_core::{EventClass, GeoCell};
use tokio::sync::mpsc;
use tracing::debug;

/// The two filters issued for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFilters {
    /// Ephemeral events tagged with one of the channel's cells, from now on
    pub live: Filter,
    /// Durable events inside the history window. The `#g` query is only a
    /// hint to the relay; tags are checked again after receipt.
    pub historical: Filter,
}

/// Subscription ids held by one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscriptions {
    pub live_id: String,
    pub historical_id: String,
}

impl ChannelSubscriptions {
    pub fn ids(&self) -> [&str; 2] {
        [&self.live_id, &self.historical_id]
    }
}

/// Issues channel subscriptions against a shared pool.
#[derive(Clone)]
pub struct SubscriptionManager {
    pool: RelayPool,
    history_window_secs: u64,
    live_snapshot_limit: u64,
    history_limit: u64,
}

impl SubscriptionManager {
    pub fn new(pool: RelayPool, config: &GeoChatConfig) -> Self {
        Self {
            pool,
            history_window_secs: config.history_window_secs,
            live_snapshot_limit: config.live_snapshot_limit,
            history_limit: config.history_limit,
        }
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    /// Filters for `cells` as of unix second `now`.
    pub fn build_filters(&self, cells: &[GeoCell], now: u64) -> ChannelFilters {
        let tags: Vec<String> = cells.iter().map(|c| c.as_str().to_string()).collect();
        let live = Filter::new()
            .kinds(vec![EventClass::Ephemeral.kind()])
            .geohashes(tags.clone())
            .since(now)
            .limit(self.live_snapshot_limit);
        let historical = Filter::new()
            .kinds(vec![EventClass::Durable.kind()])
            .geohashes(tags)
            .since(now.saturating_sub(self.history_window_secs))
            .limit(self.history_limit);
        ChannelFilters { live, historical }
    }

    /// Open both subscriptions, delivering into one receiver.
    pub async fn open(
        &self,
        cells: &[GeoCell],
    ) -> Result<(ChannelSubscriptions, mpsc::UnboundedReceiver<SubscriptionEvent>), ClientError>
    {
        let filters = self.build_filters(cells, unix_now());
        let (tx, rx) = mpsc::unbounded_channel();

        let live_id = self
            .pool
            .subscribe_into(vec![filters.live], None, tx.clone())
            .await?;
        let historical_id = match self
            .pool
            .subscribe_into(vec![filters.historical], None, tx)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.pool.unsubscribe(&live_id).await?;
                return Err(e);
            }
        };
        debug!("Opened live {} and historical {}", live_id, historical_id);

        Ok((
            ChannelSubscriptions {
                live_id,
                historical_id,
            },
            rx,
        ))
    }

    /// Combined phase: live only once both subscriptions are.
    pub async fn phase(&self, subscriptions: &ChannelSubscriptions) -> SubscriptionPhase {
        let live = self.pool.phase(&subscriptions.live_id).await;
        let historical = self.pool.phase(&subscriptions.historical_id).await;
        match (live, historical) {
            (SubscriptionPhase::Closed, _) | (_, SubscriptionPhase::Closed) => {
                SubscriptionPhase::Closed
            }
            (SubscriptionPhase::Live, SubscriptionPhase::Live) => SubscriptionPhase::Live,
            _ => SubscriptionPhase::Backfilling,
        }
    }

    /// Close both subscriptions. Idempotent.
    pub async fn close(&self, subscriptions: &ChannelSubscriptions) -> Result<(), ClientError> {
        for id in subscriptions.ids() {
            self.pool.unsubscribe(id).await?;
        }
        Ok(())
    }
}
