//! # Shared Types
//!
//! Types used by both the client engine and the backend server: entity
//! payload schemas, mutation shapes, delta-sync wire types, and the shared
//! error taxonomy.

pub mod delta;
pub mod entity;
pub mod error;
pub mod mutation;

pub use delta::{ChangeEvent, ChangeKind, DeltaRequest, DeltaResult, Tombstone};
pub use entity::{EntityFields, EntityId, EntityRecord, EntityType};
pub use error::SyncError;
pub use mutation::{
    MutationOperation, MutationStatus, QueuedMutation, SubmitMutationRequest,
    SubmitMutationResponse,
};

use chrono::{SecondsFormat, Utc};

/// Current UTC time as an RFC 3339 string with fixed microsecond precision.
///
/// Fixed-width timestamps keep lexicographic order equal to chronological
/// order, which the SQLite stores and the delta window comparisons rely on.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_chronologically() {
        let a = now_rfc3339();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_rfc3339();
        assert!(a < b);
    }
}
