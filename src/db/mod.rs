//! Database layer for usenet-indexer
//!
//! Handles SQLite persistence for groups, collections, repair queues and
//! filter rules.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`groups`] - Group registry and watermarks
//! - [`collections`] - Transactional chunk apply and collection reads
//! - [`repair`] - Missing-article queues
//! - [`rules`] - Black/white list rules and multigroup posters

use crate::classifier::{RuleField, RuleKind};
use crate::types::GroupId;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};

mod collections;
mod groups;
mod migrations;
mod repair;
mod rules;

/// Group record from database
#[derive(Debug, Clone, FromRow)]
pub struct GroupRow {
    /// Unique database ID
    pub id: GroupId,
    /// Newsgroup name
    pub name: String,
    /// Included in update runs
    pub active: bool,
    /// Included in backfill runs
    pub backfill: bool,
    /// Days of history backfill should reach
    pub backfill_target: i64,
    /// Oldest article number processed (0 = never scanned)
    pub first_record: i64,
    /// Unix timestamp of the oldest processed article
    pub first_record_postdate: Option<i64>,
    /// Newest article number processed (0 = never scanned)
    pub last_record: i64,
    /// Unix timestamp of the newest processed article
    pub last_record_postdate: Option<i64>,
    /// Unix timestamp of the last update attempt
    pub last_updated: Option<i64>,
}

impl GroupRow {
    /// Oldest watermark as an article number
    pub fn first_article(&self) -> u64 {
        self.first_record.max(0) as u64
    }

    /// Newest watermark as an article number
    pub fn last_article(&self) -> u64 {
        self.last_record.max(0) as u64
    }

    /// Post date of the oldest processed article
    pub fn first_postdate(&self) -> Option<DateTime<Utc>> {
        self.first_record_postdate
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
    }
}

/// Collection record from database
#[derive(Debug, Clone, FromRow)]
pub struct CollectionRow {
    /// Unique database ID
    pub id: i64,
    /// Base subject of the first header seen
    pub subject: String,
    /// Poster
    pub fromname: String,
    /// Unix timestamp of the first header seen
    pub date: i64,
    /// Xref (multigroup collections accumulate one line per merge)
    pub xref: String,
    /// Group the collection was first seen in
    pub group_id: GroupId,
    /// Declared number of files
    pub total_files: i64,
    /// Deduplication key
    pub collection_hash: String,
    /// Random value refreshed on every merge
    pub noise: String,
    /// Unix timestamp of the last insert or merge
    pub date_added: i64,
}

/// Binary record from database
#[derive(Debug, Clone, FromRow)]
pub struct BinaryRow {
    /// Unique database ID
    pub id: i64,
    /// Identity hash
    pub binary_hash: String,
    /// Base subject
    pub name: String,
    /// Owning collection
    pub collection_id: i64,
    /// Declared number of parts
    pub total_parts: i64,
    /// Parts received so far
    pub current_parts: i64,
    /// Index of this file within its collection
    pub file_number: i64,
    /// Accumulated size in bytes
    pub size: i64,
}

/// Part record from database
#[derive(Debug, Clone, FromRow)]
pub struct PartRow {
    /// Owning binary
    pub binary_id: i64,
    /// Article number
    pub number: i64,
    /// Message-ID without angle brackets
    pub message_id: String,
    /// Part index
    pub part_number: i64,
    /// Size in bytes
    pub size: i64,
}

/// Repair queue entry from database
#[derive(Debug, Clone, FromRow)]
pub struct MissedPartRow {
    /// Unique database ID
    pub id: i64,
    /// Article number
    pub number: i64,
    /// Group the article belongs to
    pub group_id: GroupId,
    /// Times the article was requested and not assembled
    pub attempts: i64,
}

/// Black/white list rule record from database
#[derive(Debug, Clone, FromRow)]
pub struct RuleRow {
    /// Unique database ID
    pub id: i64,
    /// Regex matched against the group name
    pub group_pattern: String,
    /// Regex matched against the header field
    pub regex: String,
    /// Field tag (1 = subject, 2 = from, 3 = message-id)
    pub field: i64,
    /// Kind tag (1 = blacklist, 2 = whitelist)
    pub kind: i64,
    /// Whether the rule is applied
    pub enabled: bool,
    /// Free-form description
    pub description: Option<String>,
    /// Unix timestamp of the last header this rule decided
    pub last_activity: Option<i64>,
}

/// New black/white list rule
#[derive(Debug, Clone)]
pub struct NewRule {
    /// Regex matched against the group name
    pub group_pattern: String,
    /// Regex matched against the header field
    pub regex: String,
    /// Header field the regex applies to
    pub field: RuleField,
    /// Black or white list
    pub kind: RuleKind,
    /// Free-form description
    pub description: Option<String>,
}

/// Database handle for usenet-indexer
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
