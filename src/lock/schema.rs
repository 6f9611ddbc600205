//! SQLite schema of the advisory lock table.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

/// One row per held lock. `acquired_at` is a unix timestamp in seconds, refreshed
/// while the holder is alive and used to reclaim locks of dead sessions.
const ADVISORY_LOCKS_TABLE_V1: Table = Table {
    name: "advisory_locks",
    columns: &[
        sqlite_column!("lock_id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("holder", &SqlType::Text, non_null = true),
        sqlite_column!("acquired_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_advisory_locks_holder", "holder")],
};

pub const LOCK_SCHEMA: VersionedSchema = VersionedSchema {
    version: 1,
    tables: &[ADVISORY_LOCKS_TABLE_V1],
};
