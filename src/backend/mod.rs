//! # Backend Server
//!
//! Axum server owning the authoritative entity store. It accepts mutation
//! submissions (idempotently, with conflict detection), serves the delta
//! pull protocol, and fans out best-effort change events over SSE.

pub mod error;
pub mod realtime;
pub mod routes;
pub mod server;
pub mod store;
pub mod sync;

pub use error::ApiError;
pub use realtime::ChangeBroadcaster;
pub use server::{create_app, AppState, ServerConfig};
pub use store::EntityStore;
pub use sync::DeltaSyncService;
