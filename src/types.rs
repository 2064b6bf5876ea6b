//! Core types and events for usenet-indexer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unique identifier for a newsgroup
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub i64);

impl GroupId {
    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for GroupId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<GroupId> for i64 {
    fn from(id: GroupId) -> Self {
        id.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl sqlx::Type<sqlx::Sqlite> for GroupId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for GroupId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for GroupId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Which family of collection/binary/part/repair tables a row lives in
///
/// Multigroup collections are keyed without the group id, so they live in
/// their own table set and never merge with group-scoped collections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableSet {
    /// Group-scoped tables
    Standard,
    /// Group-independent multigroup poster tables (`mgr_` prefix)
    MultiGroup,
}

impl TableSet {
    /// Collections table name
    pub fn collections(self) -> &'static str {
        match self {
            TableSet::Standard => "collections",
            TableSet::MultiGroup => "mgr_collections",
        }
    }

    /// Binaries table name
    pub fn binaries(self) -> &'static str {
        match self {
            TableSet::Standard => "binaries",
            TableSet::MultiGroup => "mgr_binaries",
        }
    }

    /// Parts table name
    pub fn parts(self) -> &'static str {
        match self {
            TableSet::Standard => "parts",
            TableSet::MultiGroup => "mgr_parts",
        }
    }

    /// Part repair table name
    pub fn missed_parts(self) -> &'static str {
        match self {
            TableSet::Standard => "missed_parts",
            TableSet::MultiGroup => "mgr_missed_parts",
        }
    }
}

/// Why a range is being scanned; decides the repair-queue side effects
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanMode {
    /// Forward catch-up: missing and failed numbers are queued for repair
    Update,
    /// Backward catch-up: no repair side effects
    Backfill,
    /// Re-request queued numbers; only the listed numbers are assembled
    Repair {
        /// Table set whose repair queue is being worked
        tables: TableSet,
        /// The missing article numbers inside the requested range
        wanted: Vec<u64>,
    },
}

impl ScanMode {
    /// Short label for logs and events
    pub fn label(&self) -> &'static str {
        match self {
            ScanMode::Update => "update",
            ScanMode::Backfill => "backfill",
            ScanMode::Repair { .. } => "repair",
        }
    }
}

/// Outcome of one fetch→classify→assemble pass over an article range
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkSummary {
    /// First requested article number
    pub first: u64,
    /// Last requested article number
    pub last: u64,
    /// Lowest article number received
    pub first_article: Option<u64>,
    /// Post date of the lowest article received
    pub first_article_date: Option<DateTime<Utc>>,
    /// Highest article number received
    pub last_article: Option<u64>,
    /// Post date of the highest article received
    pub last_article_date: Option<DateTime<Utc>>,
    /// Overview records received
    pub received: usize,
    /// Records rejected by black/white lists
    pub blacklisted: usize,
    /// Records without a part descriptor
    pub not_yenc: usize,
    /// Records that failed to assemble
    pub not_inserted: usize,
    /// Requested numbers the server did not return
    pub not_received: usize,
    /// Repair-queue entries satisfied by this pass
    pub repaired: usize,
    /// Time spent fetching overview data
    #[serde(with = "millis_serde")]
    pub fetch_time: Duration,
    /// Time spent classifying headers
    #[serde(with = "millis_serde")]
    pub classify_time: Duration,
    /// Time spent writing collections/binaries/parts
    #[serde(with = "millis_serde")]
    pub insert_time: Duration,
}

impl ChunkSummary {
    /// Empty summary for a requested range
    pub fn for_range(first: u64, last: u64) -> Self {
        Self {
            first,
            last,
            ..Default::default()
        }
    }

    /// Number of article numbers requested
    pub fn requested(&self) -> u64 {
        self.last.saturating_sub(self.first) + 1
    }
}

/// How a group finished within a run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GroupOutcome {
    /// All planned chunks committed
    Completed,
    /// Nothing new on the server
    UpToDate,
    /// Backfill target already reached
    BackfillExhausted,
    /// The group was skipped for this run
    Skipped {
        /// Human-readable reason
        reason: String,
    },
    /// The server no longer carries the group; it was disabled
    Disabled,
    /// The run was cancelled while this group was in progress
    Cancelled,
}

/// Totals reported at the end of a run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Groups attempted
    pub groups_processed: usize,
    /// Articles received from the server
    pub articles_fetched: u64,
    /// Articles that could not be assembled
    pub articles_not_inserted: u64,
    /// Repair-queue entries satisfied
    pub articles_repaired: u64,
    /// Repair-queue entries abandoned after too many attempts
    pub articles_abandoned: u64,
    /// Groups skipped, disabled or cancelled, with the reason
    pub skipped: Vec<(String, String)>,
}

impl RunSummary {
    /// Fold one chunk into the totals
    pub fn record_chunk(&mut self, chunk: &ChunkSummary) {
        self.articles_fetched += chunk.received as u64;
        self.articles_not_inserted += chunk.not_inserted as u64;
        self.articles_repaired += chunk.repaired as u64;
    }

    /// Fold another (per-group) summary into this one
    pub fn merge(&mut self, other: RunSummary) {
        self.groups_processed += other.groups_processed;
        self.articles_fetched += other.articles_fetched;
        self.articles_not_inserted += other.articles_not_inserted;
        self.articles_repaired += other.articles_repaired;
        self.articles_abandoned += other.articles_abandoned;
        self.skipped.extend(other.skipped);
    }
}

/// Progress events broadcast by the indexer
///
/// Observability only; nothing in the ingestion path reads them back.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A worker picked up a group
    GroupStarted {
        /// Group name
        group: String,
        /// "update" or "backfill"
        policy: String,
    },
    /// A chunk was fetched and assembled
    ChunkProcessed {
        /// Group name
        group: String,
        /// "update", "backfill" or "repair"
        mode: String,
        /// Counts and timings
        summary: ChunkSummary,
    },
    /// A part repair pass finished
    RepairCompleted {
        /// Group name
        group: String,
        /// Table set that was repaired
        tables: TableSet,
        /// Entries attempted
        attempted: usize,
        /// Entries satisfied
        repaired: usize,
        /// Entries dropped after reaching the attempt limit
        abandoned: u64,
    },
    /// A group reached its backfill target
    BackfillExhausted {
        /// Group name
        group: String,
        /// Whether backfill was disabled for the group
        disabled: bool,
    },
    /// A group was skipped for this run
    GroupSkipped {
        /// Group name
        group: String,
        /// Human-readable reason
        reason: String,
    },
    /// A group finished
    GroupFinished {
        /// Group name
        group: String,
        /// How it finished
        outcome: GroupOutcome,
    },
}

mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
