mod versioned_schema;

pub use versioned_schema::*;

/// Binds a row count or offset as an SQLite integer, saturating at `i64::MAX`.
pub fn sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
