//! # Tidemark
//!
//! Offline-first synchronization engine for workspace-scoped records.
//!
//! The crate is split the same way the deployment is:
//!
//! - [`shared`] - wire types, payload schemas, and the error taxonomy used on
//!   both sides of the protocol
//! - [`client`] - the durable mutation queue, dependency-aware replay engine,
//!   optimistic cache, and delta-pull client
//! - [`backend`] - the Axum server: entity and tombstone stores, the delta
//!   sync service, and the per-workspace change broadcaster

pub mod backend;
pub mod client;
pub mod shared;
