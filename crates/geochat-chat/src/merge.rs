//! Deduplication and ordered merge for one channel.
//!
//! A [`ChannelMerger`] turns unordered, duplicated arrivals from many relays
//! and both subscriptions into one stream ordered by `(created_at, id)` with
//! no repeated identifiers. It is synchronous and has exactly one writer: the
//! channel's merge worker.

use geochat_core::{ChatEvent, EventClass, GeoCell};
use std::collections::{HashSet, VecDeque};

/// Retention ceilings for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeLimits {
    /// Identifiers remembered for deduplication
    pub seen_capacity: usize,
    /// Ephemeral events kept in the stream
    pub ephemeral_retention: usize,
    /// Ephemeral events older than this many seconds are dropped
    pub ephemeral_max_age_secs: u64,
    /// Durable events kept in the stream
    pub durable_retention: usize,
}

impl Default for MergeLimits {
    fn default() -> Self {
        Self {
            seen_capacity: 5000,
            ephemeral_retention: 400,
            ephemeral_max_age_secs: 3600,
            durable_retention: 200,
        }
    }
}

/// What happened to one arriving event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Added to the stream
    Inserted,
    /// Identifier already seen
    Duplicate,
    /// Durable event with no spatial tag in the channel
    OffChannel,
    /// Ephemeral event past its retention window
    Expired,
    /// Older than everything kept for its class once the ceiling applied
    Evicted,
}

impl IngestOutcome {
    /// Whether the visible stream changed.
    pub fn changed(self) -> bool {
        self == IngestOutcome::Inserted
    }
}

/// Counters for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub off_channel: u64,
    pub expired: u64,
    /// Events pushed out by a retention ceiling
    pub evicted: u64,
}

/// Bounded set of identifiers, forgetting the oldest first.
#[derive(Debug, Default)]
struct SeenSet {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Merged stream for one channel.
#[derive(Debug)]
pub struct ChannelMerger {
    cells: HashSet<String>,
    limits: MergeLimits,
    seen: SeenSet,
    /// Sorted by `order_key`
    events: Vec<ChatEvent>,
    ephemeral_count: usize,
    durable_count: usize,
    stats: MergeStats,
}

impl ChannelMerger {
    pub fn new<'a>(cells: impl IntoIterator<Item = &'a GeoCell>, limits: MergeLimits) -> Self {
        Self {
            cells: cells.into_iter().map(|c| c.as_str().to_string()).collect(),
            limits,
            seen: SeenSet::new(limits.seen_capacity),
            events: Vec::new(),
            ephemeral_count: 0,
            durable_count: 0,
            stats: MergeStats::default(),
        }
    }

    /// Offer one event, evaluated at wall-clock second `now`.
    pub fn ingest(&mut self, event: ChatEvent, now: u64) -> IngestOutcome {
        if self.seen.contains(event.id()) || self.retained(&event) {
            self.stats.duplicates += 1;
            return IngestOutcome::Duplicate;
        }

        // Upstream only filtered durable events by class and time.
        if event.class() == EventClass::Durable && !event.tagged_with_any(&self.cells) {
            self.stats.off_channel += 1;
            return IngestOutcome::OffChannel;
        }

        self.seen.insert(event.id());

        if event.class() == EventClass::Ephemeral && self.is_expired(&event, now) {
            self.stats.expired += 1;
            return IngestOutcome::Expired;
        }

        let class = event.class();
        let id = event.id().to_string();
        let index = self
            .events
            .partition_point(|e| e.order_key() < event.order_key());
        self.events.insert(index, event);
        match class {
            EventClass::Ephemeral => self.ephemeral_count += 1,
            EventClass::Durable => self.durable_count += 1,
        }
        self.stats.accepted += 1;

        let evicted = self.enforce_ceiling(class);
        if evicted.iter().any(|e| e.id() == id) {
            return IngestOutcome::Evicted;
        }
        IngestOutcome::Inserted
    }

    /// Still in the stream even if the seen set has forgotten it.
    fn retained(&self, event: &ChatEvent) -> bool {
        self.events
            .binary_search_by(|e| e.order_key().cmp(&event.order_key()))
            .is_ok()
    }

    fn is_expired(&self, event: &ChatEvent, now: u64) -> bool {
        event
            .created_at()
            .saturating_add(self.limits.ephemeral_max_age_secs)
            < now
    }

    fn ceiling(&self, class: EventClass) -> usize {
        match class {
            EventClass::Ephemeral => self.limits.ephemeral_retention,
            EventClass::Durable => self.limits.durable_retention,
        }
    }

    fn count(&self, class: EventClass) -> usize {
        match class {
            EventClass::Ephemeral => self.ephemeral_count,
            EventClass::Durable => self.durable_count,
        }
    }

    fn remove_at(&mut self, index: usize) -> ChatEvent {
        let removed = self.events.remove(index);
        match removed.class() {
            EventClass::Ephemeral => self.ephemeral_count -= 1,
            EventClass::Durable => self.durable_count -= 1,
        }
        removed
    }

    /// Drop the oldest events of `class` until it fits its ceiling.
    fn enforce_ceiling(&mut self, class: EventClass) -> Vec<ChatEvent> {
        let mut evicted = Vec::new();
        while self.count(class) > self.ceiling(class) {
            let Some(index) = self.events.iter().position(|e| e.class() == class) else {
                break;
            };
            evicted.push(self.remove_at(index));
            self.stats.evicted += 1;
        }
        evicted
    }

    /// Age out ephemeral events; returns how many were removed.
    pub fn prune_expired(&mut self, now: u64) -> usize {
        let max_age = self.limits.ephemeral_max_age_secs;
        let before = self.events.len();
        self.events.retain(|e| {
            e.class() != EventClass::Ephemeral || e.created_at().saturating_add(max_age) >= now
        });
        let removed = before - self.events.len();
        self.ephemeral_count -= removed;
        self.stats.expired += removed as u64;
        removed
    }

    /// The merged stream, oldest first.
    pub fn events(&self) -> &[ChatEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn newest(&self) -> Option<&ChatEvent> {
        self.events.last()
    }

    /// Number of events ordered strictly after `mark`.
    pub fn count_after(&self, mark: (u64, &str)) -> usize {
        self.events.len() - self.events.partition_point(|e| e.order_key() <= mark)
    }

    /// Whether a spatial tag belongs to this channel.
    pub fn covers(&self, cell: &str) -> bool {
        self.cells.contains(cell)
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }
}
