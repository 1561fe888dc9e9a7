//! Location-based chat channels merged from a redundant relay pool.
//!
//! This crate provides:
//! - Channel routing from coordinates to geohash cells
//! - Live and historical subscriptions with phase tracking
//! - Deduplicating, ordered merging of events from every relay
//! - Per-channel read/unread tracking
//!
//! # Example
//!
//! ```no_run
//! use geochat::{GeoChat, GeoChatConfig};
//!
//! # async fn example() -> Result<(), geochat::ChatError> {
//! let chat = GeoChat::new(GeoChatConfig::default())?;
//! let channel = chat.join(48.8566, 2.3522, None).await?;
//!
//! let mut changes = chat.watch(&channel).await?;
//! while changes.changed().await.is_ok() {
//!     for message in chat.messages(&channel).await? {
//!         println!("{}: {}", message.author(), message.content());
//!     }
//!     println!("{} unread", chat.unread(&channel).await?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod chat;
pub mod config;
pub mod manager;
pub mod merge;
pub mod router;
pub mod store;

pub use chat::{ChannelStatus, ChatError, GeoChat};
pub use config::{BackoffSettings, ConfigError, GeoChatConfig, load_config, save_config};
pub use manager::{ChannelFilters, ChannelSubscriptions, SubscriptionManager};
pub use merge::{ChannelMerger, IngestOutcome, MergeLimits, MergeStats};
pub use router::{ChannelRoute, ChannelRouter};
pub use store::{ChatStore, ReadMarker};

/// Current unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
