//! Local database schema definitions.
//!
//! All timestamps are RFC 3339 TEXT with fixed microsecond precision, so
//! SQL string comparisons order chronologically.

/// Durable mutation queue; one row per not-yet-confirmed write
pub const CREATE_MUTATION_QUEUE: &str = "
CREATE TABLE IF NOT EXISTS mutation_queue (
    id              TEXT PRIMARY KEY,
    operation       TEXT NOT NULL,
    entity_type     TEXT NOT NULL,
    entity_id       TEXT NOT NULL,
    payload         TEXT,
    depends_on      TEXT NOT NULL DEFAULT '[]',
    base_updated_at TEXT,
    enqueued_at     TEXT NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT,
    status          TEXT NOT NULL,
    fail_reason     TEXT,
    block_reason    TEXT,
    last_error      TEXT
)";

pub const CREATE_MUTATION_QUEUE_STATUS_INDEX: &str = "
CREATE INDEX IF NOT EXISTS idx_mutation_queue_status
    ON mutation_queue (status, enqueued_at)";

/// Reconciliation map: temp id -> server-assigned id
pub const CREATE_TEMP_ID_MAP: &str = "
CREATE TABLE IF NOT EXISTS temp_id_map (
    temp_id     TEXT PRIMARY KEY,
    real_id     TEXT NOT NULL,
    resolved_at TEXT NOT NULL
)";

/// Local mirror of pulled entities; reseeds the optimistic cache on restart
pub const CREATE_ENTITIES: &str = "
CREATE TABLE IF NOT EXISTS entities (
    entity_type  TEXT NOT NULL,
    entity_id    TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    fields       TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_id)
)";

/// Key/value sync state, including the per-workspace checkpoint
pub const CREATE_SYNC_METADATA: &str = "
CREATE TABLE IF NOT EXISTS sync_metadata (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

/// All statements, in creation order
pub const ALL: [&str; 5] = [
    CREATE_MUTATION_QUEUE,
    CREATE_MUTATION_QUEUE_STATUS_INDEX,
    CREATE_TEMP_ID_MAP,
    CREATE_ENTITIES,
    CREATE_SYNC_METADATA,
];
