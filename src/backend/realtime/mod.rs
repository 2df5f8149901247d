//! # Realtime Change Notifications
//!
//! Best-effort fan-out of change events to connected workspace clients.
//! Events are advisory wake-up hints only: a dropped event costs nothing
//! but latency, because the delta pull protocol is the authoritative,
//! self-healing channel.

pub mod broadcast;
pub mod subscription;

pub use broadcast::ChangeBroadcaster;
