//! SQLite schema definitions for the newsletter database.
//!
//! Holds subscribers, the outbound email queue and download-gate tokens.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP};

// =============================================================================
// Version 1 - Subscribers and email queue
// =============================================================================

const SUBSCRIBERS_TABLE_V1: Table = Table {
    name: "subscribers",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("email", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!(
            "verified",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_subscribers_verified", "verified")],
};

/// One row per outbound message. Headers are a JSON array of raw header lines.
const EMAIL_QUEUE_TABLE_V1: Table = Table {
    name: "email_queue",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("recipient", &SqlType::Text, non_null = true),
        sqlite_column!("subject", &SqlType::Text, non_null = true),
        sqlite_column!("body", &SqlType::Text, non_null = true),
        sqlite_column!("headers", &SqlType::Text),
        sqlite_column!("send_at", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "sent",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("sent_at", &SqlType::Integer),
    ],
    indices: &[("idx_email_queue_sent_send_at", "sent, send_at")],
};

// =============================================================================
// Version 2 - Download tokens
// =============================================================================

const DOWNLOAD_TOKENS_TABLE_V2: Table = Table {
    name: "download_tokens",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("email", &SqlType::Text, non_null = true),
        sqlite_column!("token", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("file_url", &SqlType::Text, non_null = true),
        sqlite_column!(
            "post_id",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "block_id",
            &SqlType::Text,
            non_null = true,
            default_value = Some("''")
        ),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("expires_at", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "used",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "verified",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[
        ("idx_download_tokens_email", "email"),
        ("idx_download_tokens_expires_at", "expires_at"),
    ],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    DOWNLOAD_TOKENS_TABLE_V2.create(conn)
}

/// All versioned schemas for the newsletter database.
///
/// Version 1: subscribers and email_queue
/// Version 2: download_tokens
pub const NEWSLETTER_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[SUBSCRIBERS_TABLE_V1, EMAIL_QUEUE_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            SUBSCRIBERS_TABLE_V1,
            EMAIL_QUEUE_TABLE_V1,
            DOWNLOAD_TOKENS_TABLE_V2,
        ],
        migration: Some(migrate_v1_to_v2),
    },
];
