//! Part repair: re-requesting article numbers that were expected but never
//! assembled.
//!
//! Queued numbers are coalesced into short contiguous ranges so each repair
//! request stays small. Each range is handed to a [`RangeScanner`] (the scan
//! pipeline in repair mode); afterwards every selected entry that is still
//! queued is charged one attempt and entries at the attempt limit are dropped.

use crate::config::IngestConfig;
use crate::db::Database;
use crate::error::Result;
use crate::types::{ChunkSummary, GroupId, TableSet};
use std::sync::Arc;

/// A contiguous article range covering some queued numbers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepairRange {
    /// First article number to request
    pub first: u64,
    /// Last article number to request
    pub last: u64,
    /// Queued numbers inside `first..=last`; everything else the server
    /// returns for the range is ignored
    pub wanted: Vec<u64>,
}

/// Group ascending article numbers into ranges.
///
/// A new range starts whenever a number lies more than `span` past the
/// current range's first number.
pub fn coalesce(numbers: &[u64], span: u64) -> Vec<RepairRange> {
    let mut ranges = Vec::new();
    let Some(&start) = numbers.first() else {
        return ranges;
    };

    let mut current = RepairRange {
        first: start,
        last: start,
        wanted: Vec::new(),
    };
    for &number in numbers {
        if number - current.first > span {
            let next = RepairRange {
                first: number,
                last: number,
                wanted: Vec::new(),
            };
            ranges.push(std::mem::replace(&mut current, next));
        }
        current.wanted.push(number);
        current.last = number;
    }
    ranges.push(current);

    ranges
}

/// Fetches and assembles one repair range
#[async_trait::async_trait]
pub trait RangeScanner: Send {
    /// Scan `range` in repair mode against the `tables` queue and report what
    /// happened. Fetch failures are absorbed by the scanner.
    async fn scan_range(&mut self, tables: TableSet, range: &RepairRange) -> Result<ChunkSummary>;
}

/// What one repair pass did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepairOutcome {
    /// Queue entries selected for this pass
    pub attempted: usize,
    /// Overview records received across all ranges
    pub received: usize,
    /// Entries satisfied and removed from the queue
    pub repaired: usize,
    /// Entries dropped after reaching the attempt limit
    pub abandoned: u64,
}

/// Bounded retry queue for missing articles
#[derive(Clone)]
pub struct RepairQueue {
    db: Arc<Database>,
    max_attempts: u32,
    max_entries: u32,
    span: u64,
}

impl RepairQueue {
    /// Queue limits come from the ingest configuration
    pub fn new(db: Arc<Database>, ingest: &IngestConfig) -> Self {
        Self {
            db,
            max_attempts: ingest.part_repair_max_tries,
            max_entries: ingest.max_part_repair,
            span: ingest.repair_range_span(),
        }
    }

    /// Queue `numbers` for a later repair pass
    pub async fn add_missing(&self, tables: TableSet, group: GroupId, numbers: &[u64]) -> Result<()> {
        self.db.add_missing_parts(tables, group, numbers).await
    }

    /// Select the entries due for repair and coalesce them into ranges
    pub async fn schedule(&self, tables: TableSet, group: GroupId) -> Result<Vec<RepairRange>> {
        let numbers: Vec<u64> = self
            .db
            .missing_parts(tables, group, self.max_attempts, self.max_entries)
            .await?
            .into_iter()
            .map(|row| row.number as u64)
            .collect();

        Ok(coalesce(&numbers, self.span))
    }

    /// Run one repair pass over the `tables` queue of `group`.
    pub async fn run_pass(
        &self,
        tables: TableSet,
        group: GroupId,
        scanner: &mut dyn RangeScanner,
    ) -> Result<RepairOutcome> {
        let ranges = self.schedule(tables, group).await?;
        let selected: Vec<u64> = ranges.iter().flat_map(|r| r.wanted.iter().copied()).collect();

        let mut outcome = RepairOutcome {
            attempted: selected.len(),
            ..Default::default()
        };

        if !ranges.is_empty() {
            tracing::info!(
                group_id = %group,
                tables = ?tables,
                entries = selected.len(),
                ranges = ranges.len(),
                "Attempting part repair"
            );
        }

        for range in &ranges {
            let summary = scanner.scan_range(tables, range).await?;
            outcome.received += summary.received;
            outcome.repaired += summary.repaired;
        }

        if !selected.is_empty() {
            self.db
                .increment_missing_attempts(tables, group, &selected)
                .await?;
        }
        outcome.abandoned = self
            .db
            .delete_abandoned_parts(tables, group, self.max_attempts)
            .await?;

        if outcome.attempted > 0 || outcome.abandoned > 0 {
            tracing::info!(
                group_id = %group,
                tables = ?tables,
                attempted = outcome.attempted,
                repaired = outcome.repaired,
                abandoned = outcome.abandoned,
                "Part repair finished"
            );
        }

        Ok(outcome)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    /// Pretends the server returned some of the wanted numbers
    struct FakeScanner {
        db: Arc<Database>,
        group: GroupId,
        available: Vec<u64>,
        seen: Vec<RepairRange>,
    }

    #[async_trait::async_trait]
    impl RangeScanner for FakeScanner {
        async fn scan_range(
            &mut self,
            tables: TableSet,
            range: &RepairRange,
        ) -> Result<ChunkSummary> {
            self.seen.push(range.clone());
            let repaired: Vec<u64> = range
                .wanted
                .iter()
                .copied()
                .filter(|n| self.available.contains(n))
                .collect();
            self.db
                .remove_missing_parts(tables, self.group, &repaired)
                .await?;
            Ok(ChunkSummary {
                received: repaired.len(),
                repaired: repaired.len(),
                ..ChunkSummary::for_range(range.first, range.last)
            })
        }
    }

    async fn setup(max_tries: u32) -> (Arc<Database>, RepairQueue, GroupId, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::new(temp_file.path()).await.unwrap());
        let group = db.add_group("alt.binaries.test", false, 1).await.unwrap();
        let ingest = IngestConfig {
            max_messages_per_request: 400,
            part_repair_max_tries: max_tries,
            max_part_repair: 100,
            ..Default::default()
        };
        let queue = RepairQueue::new(db.clone(), &ingest);
        (db, queue, group, temp_file)
    }

    #[test]
    fn coalesce_splits_when_span_exceeded() {
        let ranges = coalesce(&[10, 20, 110, 111, 300], 100);
        assert_eq!(
            ranges,
            vec![
                RepairRange {
                    first: 10,
                    last: 110,
                    wanted: vec![10, 20, 110]
                },
                RepairRange {
                    first: 111,
                    last: 111,
                    wanted: vec![111]
                },
                RepairRange {
                    first: 300,
                    last: 300,
                    wanted: vec![300]
                },
            ]
        );
    }

    #[test]
    fn coalesce_empty_and_single() {
        assert!(coalesce(&[], 10).is_empty());
        let ranges = coalesce(&[42], 10);
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].first, ranges[0].last), (42, 42));
    }

    #[tokio::test]
    async fn pass_removes_repaired_and_charges_the_rest() {
        let (db, queue, group, _file) = setup(3).await;
        queue
            .add_missing(TableSet::Standard, group, &[103, 150, 400])
            .await
            .unwrap();

        let mut scanner = FakeScanner {
            db: db.clone(),
            group,
            available: vec![103],
            seen: Vec::new(),
        };
        let outcome = queue
            .run_pass(TableSet::Standard, group, &mut scanner)
            .await
            .unwrap();

        assert_eq!(outcome.attempted, 3);
        assert_eq!(outcome.repaired, 1);
        assert_eq!(outcome.abandoned, 0);
        // span is 400 / 4 = 100
        assert_eq!(scanner.seen.len(), 2);
        assert_eq!(scanner.seen[0].wanted, vec![103, 150]);

        let left = db.missing_parts(TableSet::Standard, group, 3, 10).await.unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|row| row.attempts == 1));
    }

    #[tokio::test]
    async fn unfetchable_article_is_abandoned_after_max_attempts() {
        let (db, queue, group, _file) = setup(3).await;
        queue.add_missing(TableSet::Standard, group, &[77]).await.unwrap();

        let mut scanner = FakeScanner {
            db: db.clone(),
            group,
            available: Vec::new(),
            seen: Vec::new(),
        };
        let mut abandoned = 0;
        for _ in 0..3 {
            abandoned += queue
                .run_pass(TableSet::Standard, group, &mut scanner)
                .await
                .unwrap()
                .abandoned;
        }

        assert_eq!(scanner.seen.len(), 3);
        assert_eq!(abandoned, 1);
        assert_eq!(
            db.count_missing_parts(TableSet::Standard, group).await.unwrap(),
            0
        );

        // Nothing left to try
        let outcome = queue
            .run_pass(TableSet::Standard, group, &mut scanner)
            .await
            .unwrap();
        assert_eq!(outcome, RepairOutcome::default());
        assert_eq!(scanner.seen.len(), 3);
    }

    #[tokio::test]
    async fn pass_only_touches_its_table_set() {
        let (db, queue, group, _file) = setup(3).await;
        queue.add_missing(TableSet::MultiGroup, group, &[5]).await.unwrap();

        let mut scanner = FakeScanner {
            db: db.clone(),
            group,
            available: Vec::new(),
            seen: Vec::new(),
        };
        queue
            .run_pass(TableSet::Standard, group, &mut scanner)
            .await
            .unwrap();

        assert!(scanner.seen.is_empty());
        let mgr = db.missing_parts(TableSet::MultiGroup, group, 3, 10).await.unwrap();
        assert_eq!(mgr[0].attempts, 0);
    }
}
