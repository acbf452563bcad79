//! SQLite schema definitions for the server database.
//!
//! Background job bookkeeping plus the key-value option and transient tables
//! that the queue worker and token flows use as runtime state.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Job runs, schedules, options and transients
// =============================================================================

const JOB_RUNS_TABLE_V1: Table = Table {
    name: "job_runs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("job_id", &SqlType::Text, non_null = true),
        sqlite_column!("started_at", &SqlType::Text, non_null = true),
        sqlite_column!("finished_at", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("triggered_by", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_job_runs_job_id_started", "job_id, started_at DESC"),
        ("idx_job_runs_status", "status"),
    ],
};

const JOB_SCHEDULES_TABLE_V1: Table = Table {
    name: "job_schedules",
    columns: &[
        sqlite_column!("job_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("next_run_at", &SqlType::Text, non_null = true),
        sqlite_column!("last_run_at", &SqlType::Text),
    ],
    indices: &[],
};

/// Persistent runtime values (batch size, email stats).
const OPTIONS_TABLE_V1: Table = Table {
    name: "options",
    columns: &[
        sqlite_column!("key", &SqlType::Text, is_primary_key = true),
        sqlite_column!("value", &SqlType::Text, non_null = true),
        sqlite_column!(
            "updated_at",
            &SqlType::Text,
            non_null = true,
            default_value = Some("(datetime('now'))")
        ),
    ],
    indices: &[],
};

/// Values that stop existing after `expires_at` (unix seconds).
const TRANSIENTS_TABLE_V1: Table = Table {
    name: "transients",
    columns: &[
        sqlite_column!("key", &SqlType::Text, is_primary_key = true),
        sqlite_column!("value", &SqlType::Text, non_null = true),
        sqlite_column!("expires_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_transients_expires_at", "expires_at")],
};

// =============================================================================
// Version 2 - Email activity log
// =============================================================================

const EMAIL_ACTIVITY_TABLE_V2: Table = Table {
    name: "email_activity",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("email", &SqlType::Text, non_null = true),
        sqlite_column!("action", &SqlType::Text, non_null = true),
        sqlite_column!("details", &SqlType::Text),
        sqlite_column!("timestamp", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_email_activity_email", "email"),
        ("idx_email_activity_timestamp", "timestamp DESC"),
    ],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    EMAIL_ACTIVITY_TABLE_V2.create(conn)
}

/// All versioned schemas for the server database.
///
/// Version 1: job runs, schedules, options, transients
/// Version 2: email activity log
pub const SERVER_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[
            JOB_RUNS_TABLE_V1,
            JOB_SCHEDULES_TABLE_V1,
            OPTIONS_TABLE_V1,
            TRANSIENTS_TABLE_V1,
        ],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            JOB_RUNS_TABLE_V1,
            JOB_SCHEDULES_TABLE_V1,
            OPTIONS_TABLE_V1,
            TRANSIENTS_TABLE_V1,
            EMAIL_ACTIVITY_TABLE_V2,
        ],
        migration: Some(migrate_v1_to_v2),
    },
];
