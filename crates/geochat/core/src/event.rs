//! Geochat events.
//!
//! [`Event`] is the wire shape relays hand back. [`ChatEvent`] is what the rest
//! of the system works with: an event whose shape has been checked, whose
//! canonical id has been recomputed, and whose class and spatial tags have been
//! extracted. Signatures are carried but never verified here.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;

/// Kind used for durable location notes.
pub const KIND_DURABLE_NOTE: u16 = 1;

/// Kind used for short-lived live chat in a geohash channel.
pub const KIND_EPHEMERAL_GEOCHAT: u16 = 20000;

/// Tag name carrying a geohash cell.
pub const TAG_GEOHASH: &str = "g";

/// Tag name carrying a display nickname.
pub const TAG_NICKNAME: &str = "n";

/// Errors raised when an event fails ingestion checks.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("unsupported event kind: {0}")]
    UnsupportedKind(u16),

    #[error("invalid event id: {0}")]
    InvalidId(String),

    #[error("invalid author pubkey: {0}")]
    InvalidPubkey(String),

    #[error("invalid proof: expected 128 hex characters")]
    InvalidProof,

    #[error("event id mismatch: claimed {claimed}, computed {computed}")]
    IdMismatch { claimed: String, computed: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Event class, derived from the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventClass {
    /// Live chatter, subject to short retention.
    Ephemeral,
    /// Longer-lived note, filtered by spatial tag after receipt.
    Durable,
}

impl EventClass {
    pub fn kind(self) -> u16 {
        match self {
            EventClass::Ephemeral => KIND_EPHEMERAL_GEOCHAT,
            EventClass::Durable => KIND_DURABLE_NOTE,
        }
    }

    pub fn from_kind(kind: u16) -> Option<Self> {
        match kind {
            KIND_EPHEMERAL_GEOCHAT => Some(EventClass::Ephemeral),
            KIND_DURABLE_NOTE => Some(EventClass::Durable),
            _ => None,
        }
    }
}

/// A signed event as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Lowercase hex sha256 of the canonical serialization
    pub id: String,
    /// Lowercase hex author key
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    /// Authenticity proof, opaque to this crate
    pub sig: String,
}

/// An event before the identity collaborator attaches a proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    /// Start a message of `class` in `cell`.
    pub fn new(
        pubkey: impl Into<String>,
        class: EventClass,
        cell: &str,
        content: impl Into<String>,
        created_at: u64,
    ) -> Self {
        Self {
            pubkey: pubkey.into(),
            created_at,
            kind: class.kind(),
            tags: vec![vec![TAG_GEOHASH.to_string(), cell.to_string()]],
            content: content.into(),
        }
    }

    pub fn with_tag(mut self, tag: Vec<String>) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn with_nickname(self, nickname: impl Into<String>) -> Self {
        self.with_tag(vec![TAG_NICKNAME.to_string(), nickname.into()])
    }

    /// Canonical identifier for this content.
    pub fn id(&self) -> Result<String, EventError> {
        compute_event_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Combine with a proof produced elsewhere.
    pub fn attach_proof(self, sig: impl Into<String>) -> Result<Event, EventError> {
        let id = self.id()?;
        Ok(Event {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: sig.into(),
        })
    }
}

/// Canonical identifier: sha256 over `[0, pubkey, created_at, kind, tags, content]`.
pub fn compute_event_id(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String, EventError> {
    let serialized = serde_json::to_string(&(0, pubkey, created_at, kind, tags, content))?;
    Ok(hex::encode(Sha256::digest(serialized.as_bytes())))
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// A validated chat event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    event: Event,
    class: EventClass,
    geo_tags: Vec<String>,
    nickname: Option<String>,
}

impl ChatEvent {
    /// Validate a wire event at the ingestion boundary.
    pub fn from_event(event: Event) -> Result<Self, EventError> {
        let class =
            EventClass::from_kind(event.kind).ok_or(EventError::UnsupportedKind(event.kind))?;

        if !is_lower_hex(&event.id, 64) {
            return Err(EventError::InvalidId(event.id));
        }
        if !is_lower_hex(&event.pubkey, 64) {
            return Err(EventError::InvalidPubkey(event.pubkey));
        }
        if event.sig.len() != 128 || !event.sig.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(EventError::InvalidProof);
        }

        let computed = compute_event_id(
            &event.pubkey,
            event.created_at,
            event.kind,
            &event.tags,
            &event.content,
        )?;
        if computed != event.id {
            return Err(EventError::IdMismatch {
                claimed: event.id,
                computed,
            });
        }

        let mut geo_tags = Vec::new();
        let mut nickname = None;
        for tag in &event.tags {
            match (tag.first().map(String::as_str), tag.get(1)) {
                (Some(TAG_GEOHASH), Some(value)) => geo_tags.push(value.to_ascii_lowercase()),
                (Some(TAG_NICKNAME), Some(value)) if nickname.is_none() => {
                    nickname = Some(value.clone())
                }
                _ => {}
            }
        }

        Ok(Self {
            event,
            class,
            geo_tags,
            nickname,
        })
    }

    pub fn id(&self) -> &str {
        &self.event.id
    }

    pub fn author(&self) -> &str {
        &self.event.pubkey
    }

    pub fn created_at(&self) -> u64 {
        self.event.created_at
    }

    pub fn class(&self) -> EventClass {
        self.class
    }

    pub fn content(&self) -> &str {
        &self.event.content
    }

    pub fn geo_tags(&self) -> &[String] {
        &self.geo_tags
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    /// Whether any spatial tag is one of `cells`.
    pub fn tagged_with_any(&self, cells: &HashSet<String>) -> bool {
        self.geo_tags.iter().any(|tag| cells.contains(tag))
    }

    /// Total-order key: timestamp, then identifier.
    pub fn order_key(&self) -> (u64, &str) {
        (self.event.created_at, &self.event.id)
    }

    pub fn as_event(&self) -> &Event {
        &self.event
    }

    pub fn into_event(self) -> Event {
        self.event
    }
}
