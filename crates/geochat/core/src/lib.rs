//! Core types for location-based chat.
//!
//! This crate provides:
//! - Geohash encoding/decoding into fixed-precision cells
//! - Region labels for cells
//! - The chat event model and ingestion validation
//!
//! # Example
//!
//! ```
//! use geochat_core::{encode, label_for};
//!
//! let cell = encode(51.5074, -0.1278, 4);
//! assert_eq!(cell.as_str(), "gcpv");
//! assert_eq!(label_for(&cell), "Europe");
//! ```

pub mod event;
pub mod geohash;
pub mod region;

pub use event::{
    ChatEvent, Event, EventClass, EventError, KIND_DURABLE_NOTE, KIND_EPHEMERAL_GEOCHAT,
    TAG_GEOHASH, TAG_NICKNAME, UnsignedEvent, compute_event_id,
};
pub use geohash::{
    BoundingBox, DEFAULT_PRECISION, GeoCell, GeohashError, MAX_PRECISION, bounds, decode,
    decode_str, encode,
};
pub use region::{GLOBAL_LABEL, Region, label_for, label_for_point};
