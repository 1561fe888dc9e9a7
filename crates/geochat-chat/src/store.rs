//! Per-channel chat store.
//!
//! Each joined channel owns a [`ChannelMerger`] and a merge worker task. The
//! worker is the merger's only writer; everything else takes read snapshots.
//! Stream changes bump a `watch` revision so the presentation layer can
//! refresh on its own schedule.

use crate::manager::ChannelSubscriptions;
use crate::merge::{ChannelMerger, MergeLimits, MergeStats};
use crate::router::ChannelRoute;
use crate::unix_now;
use geochat_client::SubscriptionEvent;
use geochat_core::{ChatEvent, GeoCell};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long `remove_channel` waits for the merge worker before aborting it.
const WORKER_GRACE: Duration = Duration::from_secs(1);

/// Where the reader stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadMarker {
    /// Order key of the last event counted as read
    mark: Option<(u64, String)>,
    /// Unix second of the last `mark_read`
    last_read_at: Option<u64>,
}

impl ReadMarker {
    pub fn last_read_at(&self) -> Option<u64> {
        self.last_read_at
    }

    fn unread(&self, merger: &ChannelMerger) -> usize {
        match &self.mark {
            Some((created_at, id)) => merger.count_after((*created_at, id.as_str())),
            None => merger.len(),
        }
    }

    /// Everything ordered at or before the read time, or before the newest
    /// retained event when that is dated later, counts as read.
    fn mark(&mut self, merger: &ChannelMerger, now: u64) {
        let read_time = (now, String::new());
        self.mark = Some(match merger.newest() {
            Some(newest) if newest.order_key() > (now, "") => {
                (newest.created_at(), newest.id().to_string())
            }
            _ => read_time,
        });
        self.last_read_at = Some(now);
    }
}

struct ChannelEntry {
    route: ChannelRoute,
    subscriptions: ChannelSubscriptions,
    merger: Arc<RwLock<ChannelMerger>>,
    read: ReadMarker,
    revision: Arc<watch::Sender<u64>>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

/// In-memory store of every joined channel, keyed by the channel's cell.
#[derive(Clone)]
pub struct ChatStore {
    channels: Arc<RwLock<HashMap<GeoCell, ChannelEntry>>>,
    limits: MergeLimits,
    prune_every: Duration,
}

impl ChatStore {
    pub fn new(limits: MergeLimits) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            limits,
            prune_every: Duration::from_secs(30),
        }
    }

    /// Override how often ephemeral events are aged out.
    pub fn with_prune_interval(mut self, every: Duration) -> Self {
        self.prune_every = every;
        self
    }

    /// Register a channel and start merging `inbound` into it.
    ///
    /// Replaces any channel already stored under the same key and returns the
    /// subscriptions it held so the caller can close them.
    pub async fn insert_channel(
        &self,
        route: ChannelRoute,
        subscriptions: ChannelSubscriptions,
        inbound: mpsc::UnboundedReceiver<SubscriptionEvent>,
    ) -> Option<ChannelSubscriptions> {
        let merger = Arc::new(RwLock::new(ChannelMerger::new(&route.cells, self.limits)));
        let (revision, _) = watch::channel(0u64);
        let revision = Arc::new(revision);
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_merge_worker(
            route.key.clone(),
            Arc::clone(&merger),
            inbound,
            Arc::clone(&revision),
            cancel.clone(),
            self.prune_every,
        ));

        let entry = ChannelEntry {
            route: route.clone(),
            subscriptions,
            merger,
            read: ReadMarker::default(),
            revision,
            cancel,
            worker,
        };
        let previous = self.channels.write().await.insert(route.key, entry);
        match previous {
            Some(previous) => Some(stop_entry(previous).await),
            None => None,
        }
    }

    /// Stop a channel's worker and drop its stream. Returns its subscriptions.
    pub async fn remove_channel(&self, key: &GeoCell) -> Option<ChannelSubscriptions> {
        let entry = self.channels.write().await.remove(key)?;
        Some(stop_entry(entry).await)
    }

    /// Stop every channel, returning all subscriptions they held.
    pub async fn clear(&self) -> Vec<ChannelSubscriptions> {
        let entries: Vec<ChannelEntry> = self
            .channels
            .write()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        let mut subscriptions = Vec::with_capacity(entries.len());
        for entry in entries {
            subscriptions.push(stop_entry(entry).await);
        }
        subscriptions
    }

    pub async fn contains(&self, key: &GeoCell) -> bool {
        self.channels.read().await.contains_key(key)
    }

    /// Joined channel keys, sorted.
    pub async fn keys(&self) -> Vec<GeoCell> {
        let mut keys: Vec<GeoCell> = self.channels.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn route(&self, key: &GeoCell) -> Option<ChannelRoute> {
        self.channels.read().await.get(key).map(|e| e.route.clone())
    }

    pub async fn subscriptions(&self, key: &GeoCell) -> Option<ChannelSubscriptions> {
        self.channels
            .read()
            .await
            .get(key)
            .map(|e| e.subscriptions.clone())
    }

    /// Ordered snapshot of a channel's merged stream.
    pub async fn messages(&self, key: &GeoCell) -> Option<Vec<ChatEvent>> {
        let merger = self.merger(key).await?;
        let snapshot = merger.read().await.events().to_vec();
        Some(snapshot)
    }

    /// Events ordered after the read marker.
    pub async fn unread(&self, key: &GeoCell) -> Option<usize> {
        let channels = self.channels.read().await;
        let entry = channels.get(key)?;
        let merger = entry.merger.read().await;
        Some(entry.read.unread(&merger))
    }

    /// Everything currently in the stream becomes read.
    pub async fn mark_read(&self, key: &GeoCell) -> Option<()> {
        let mut channels = self.channels.write().await;
        let entry = channels.get_mut(key)?;
        {
            let merger = entry.merger.read().await;
            entry.read.mark(&merger, unix_now());
        }
        entry.revision.send_modify(|r| *r += 1);
        Some(())
    }

    pub async fn last_read_at(&self, key: &GeoCell) -> Option<u64> {
        self.channels
            .read()
            .await
            .get(key)
            .and_then(|e| e.read.last_read_at())
    }

    /// Revision counter bumped on every change to the channel.
    pub async fn watch(&self, key: &GeoCell) -> Option<watch::Receiver<u64>> {
        self.channels
            .read()
            .await
            .get(key)
            .map(|e| e.revision.subscribe())
    }

    /// Signal a change that is not visible in the stream itself.
    pub async fn touch(&self, key: &GeoCell) {
        if let Some(entry) = self.channels.read().await.get(key) {
            entry.revision.send_modify(|r| *r += 1);
        }
    }

    pub async fn merge_stats(&self, key: &GeoCell) -> Option<MergeStats> {
        let merger = self.merger(key).await?;
        let stats = merger.read().await.stats();
        Some(stats)
    }

    async fn merger(&self, key: &GeoCell) -> Option<Arc<RwLock<ChannelMerger>>> {
        self.channels
            .read()
            .await
            .get(key)
            .map(|e| Arc::clone(&e.merger))
    }
}

async fn stop_entry(entry: ChannelEntry) -> ChannelSubscriptions {
    entry.cancel.cancel();
    let mut worker = entry.worker;
    if tokio::time::timeout(WORKER_GRACE, &mut worker).await.is_err() {
        warn!("Merge worker for {} did not stop, aborting", entry.route.key);
        worker.abort();
    }
    entry.subscriptions
}

async fn run_merge_worker(
    key: GeoCell,
    merger: Arc<RwLock<ChannelMerger>>,
    mut inbound: mpsc::UnboundedReceiver<SubscriptionEvent>,
    revision: Arc<watch::Sender<u64>>,
    cancel: CancellationToken,
    prune_every: Duration,
) {
    let mut prune = tokio::time::interval(prune_every);
    prune.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let bump = || revision.send_modify(|r| *r += 1);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = prune.tick() => {
                let removed = merger.write().await.prune_expired(unix_now());
                if removed > 0 {
                    debug!("Aged out {} events in {}", removed, key);
                    bump();
                }
            }
            message = inbound.recv() => match message {
                Some(SubscriptionEvent::Event { relay_url, event, .. }) => {
                    let id = event.id().to_string();
                    let outcome = merger.write().await.ingest(event, unix_now());
                    debug!("{} from {} in {}: {:?}", id, relay_url, key, outcome);
                    if outcome.changed() {
                        bump();
                    }
                }
                Some(SubscriptionEvent::AllEose { subscription_id }) => {
                    debug!("Subscription {} in {} is live", subscription_id, key);
                    bump();
                }
                Some(SubscriptionEvent::Closed { .. }) => bump(),
                Some(SubscriptionEvent::Eose { .. }) => {}
                None => break,
            },
        }
    }
    debug!("Merge worker for {} stopped", key);
}
