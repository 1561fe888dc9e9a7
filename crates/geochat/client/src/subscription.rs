//! Subscription tracking across multiple relays.
//!
//! A subscription targets a fixed set of relays. It starts out backfilling and
//! moves to live once every relay that actually received the REQ has answered
//! with EOSE. Live is terminal until the subscription is closed.

use crate::message::Filter;
use std::collections::HashSet;
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Lifecycle phase of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionPhase {
    /// Waiting for stored results to finish
    Backfilling,
    /// Stored results exhausted, tailing new events
    Live,
    /// Closed by the caller
    Closed,
}

/// Tracks which relays have a specific subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    /// Subscription ID
    pub id: String,
    /// Filters for this subscription
    pub filters: Vec<Filter>,
    /// Relays this subscription targets
    relays: HashSet<String>,
    /// Relays where the REQ has been sent on the current connection
    issued: HashSet<String>,
    /// Relays that have sent EOSE
    eose_relays: HashSet<String>,
    phase: SubscriptionPhase,
}

impl SubscriptionTracker {
    /// Create a new subscription tracker.
    pub fn new(
        id: impl Into<String>,
        filters: Vec<Filter>,
        relays: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id: id.into(),
            filters,
            relays: relays.into_iter().collect(),
            issued: HashSet::new(),
            eose_relays: HashSet::new(),
            phase: SubscriptionPhase::Backfilling,
        }
    }

    pub fn phase(&self) -> SubscriptionPhase {
        self.phase
    }

    /// Check if a relay has this subscription.
    pub fn has_relay(&self, relay_url: &str) -> bool {
        self.relays.contains(relay_url)
    }

    /// Get the number of relays with this subscription.
    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    pub fn relays(&self) -> impl Iterator<Item = &str> {
        self.relays.iter().map(String::as_str)
    }

    /// Whether every relay holding the REQ has sent EOSE.
    pub fn all_eose(&self) -> bool {
        !self.issued.is_empty() && self.issued.iter().all(|r| self.eose_relays.contains(r))
    }

    /// Record that the REQ reached a relay. Returns true if the phase became live.
    pub fn mark_issued(&mut self, relay_url: &str) -> bool {
        if !self.has_relay(relay_url) {
            return false;
        }
        self.issued.insert(relay_url.to_string());
        self.update_phase()
    }

    /// Mark EOSE received from a relay. Returns true if the phase became live.
    pub fn mark_eose(&mut self, relay_url: &str) -> bool {
        if !self.has_relay(relay_url) {
            return false;
        }
        self.issued.insert(relay_url.to_string());
        self.eose_relays.insert(relay_url.to_string());
        self.update_phase()
    }

    /// A relay dropped the subscription before finishing its backlog.
    ///
    /// Relays that already sent EOSE keep counting as finished. Returns true if
    /// the phase became live.
    pub fn mark_lost(&mut self, relay_url: &str) -> bool {
        if !self.eose_relays.contains(relay_url) {
            self.issued.remove(relay_url);
        }
        self.update_phase()
    }

    /// Remove a relay from this subscription.
    pub fn remove_relay(&mut self, relay_url: &str) -> bool {
        self.relays.remove(relay_url);
        self.issued.remove(relay_url);
        self.eose_relays.remove(relay_url);
        self.update_phase()
    }

    pub fn close(&mut self) {
        self.phase = SubscriptionPhase::Closed;
    }

    /// Backfilling moves to live exactly once; nothing moves back.
    fn update_phase(&mut self) -> bool {
        if self.phase == SubscriptionPhase::Backfilling && self.all_eose() {
            self.phase = SubscriptionPhase::Live;
            return true;
        }
        false
    }
}
