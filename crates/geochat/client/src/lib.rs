//! Relay WebSocket client for geochat.
//!
//! This crate provides:
//! - Per-relay connection supervisors with capped exponential backoff
//! - Message parsing (NIP-01 relay protocol)
//! - Subscription tracking with backfill/live phases
//! - A pool that subscribes and publishes across many relays at once
//!
//! # Example
//!
//! ```rust,no_run
//! use geochat_client::{Filter, RelayConfig, RelayPool, SubscriptionEvent};
//!
//! #[tokio::main]
//! async fn main() -> geochat_client::Result<()> {
//!     let pool = RelayPool::open(
//!         ["wss://relay.damus.io", "wss://nos.lol"],
//!         RelayConfig::default(),
//!     )?;
//!
//!     let filter = Filter::new()
//!         .kinds(vec![20000])
//!         .geohashes(vec!["u4pr".to_string()])
//!         .limit(50);
//!     let (_id, mut events) = pool.subscribe(vec![filter], None).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SubscriptionEvent::Event { event, .. } => {
//!                 println!("Received event: {}", event.id());
//!             }
//!             SubscriptionEvent::AllEose { subscription_id } => {
//!                 println!("Got all stored events for {}", subscription_id);
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     pool.close().await;
//!     Ok(())
//! }
//! ```

mod backoff;
mod error;
mod message;
mod pool;
mod relay;
mod subscription;

// Re-export main types
pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use error::{ClientError, Result};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage};
pub use pool::{PoolEvent, PublishReport, RelayPool, SubscriptionEvent};
pub use relay::{
    ConnectionState, PublishConfirmation, RelayConfig, RelayConnection, RelaySignal, RelayStats,
    SignalSender,
};
pub use subscription::{SubscriptionPhase, SubscriptionTracker, generate_subscription_id};

/// Public relays known to carry geohash chat.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.primal.net",
    "wss://offchain.pub",
];
