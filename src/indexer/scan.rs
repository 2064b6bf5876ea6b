//! The fetch→classify→assemble pipeline for one article range.

use super::Indexer;
use crate::assembler::CollectionAssembler;
use crate::classifier::HeaderClassifier;
use crate::date_locator::DateLocator;
use crate::db::GroupRow;
use crate::error::{NntpError, Result};
use crate::nntp::{GroupInfo, OverviewProvider, RawHeader};
use crate::repair::{RangeScanner, RepairRange};
use crate::types::{ChunkSummary, Event, ScanMode, TableSet};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Instant;

/// Everything a worker holds while it owns a group
pub(crate) struct GroupSession {
    pub(crate) row: GroupRow,
    pub(crate) info: GroupInfo,
    pub(crate) provider: Box<dyn OverviewProvider>,
    locator: DateLocator,
    classifier: HeaderClassifier,
    assembler: CollectionAssembler,
    multigroup_active: bool,
}

impl GroupSession {
    /// Multigroup posters exist (or every poster is treated as one)
    pub(crate) fn multigroup_active(&self) -> bool {
        self.multigroup_active
    }

    /// Post date of `number`, falling back to now
    pub(crate) async fn postdate(&mut self, db: &crate::db::Database, number: u64) -> Result<DateTime<Utc>> {
        self.locator
            .postdate(self.provider.as_mut(), db, self.row.id, number, &self.info)
            .await
    }

    /// Article posted roughly `days` ago
    pub(crate) async fn daytopost(&mut self, db: &crate::db::Database, days: u32) -> Result<u64> {
        self.locator
            .daytopost(self.provider.as_mut(), db, self.row.id, &self.info, days)
            .await
    }
}

impl Indexer {
    /// Open a session, select the group and load its filters
    pub(crate) async fn open_group(&self, row: GroupRow) -> Result<GroupSession> {
        let mut provider = self.sessions.open().await?;
        let info = provider.select_group(&row.name).await?;

        let ingest = &self.config.ingest;
        let rules = self.filters.rules_for(&row.name).await?;
        let posters = self.filters.multigroup_posters().await?;
        let multigroup_active = ingest.all_as_multigroup || !posters.is_empty();

        let classifier = HeaderClassifier::new(row.name.clone(), rules, posters, ingest.all_as_multigroup)
            .with_dropped_logging(ingest.log_dropped_non_yenc);
        let assembler = CollectionAssembler::new(row.id, &row.name, &ingest.ignore_file_count)?;

        tracing::debug!(
            group = %row.name,
            server_first = info.first,
            server_last = info.last,
            local_first = row.first_record,
            local_last = row.last_record,
            "Selected group"
        );

        Ok(GroupSession {
            row,
            info,
            provider,
            locator: DateLocator::new(),
            classifier,
            assembler,
            multigroup_active,
        })
    }

    /// Fetch `first..=last`, classify, and assemble the accepted headers.
    ///
    /// Side effects on the repair queue depend on `mode`:
    /// - update: numbers the server did not return, and numbers that failed
    ///   to assemble, are queued
    /// - backfill: nothing is queued
    /// - repair: only the wanted numbers are assembled; the ones that made it
    ///   are removed from the queue, and a failed fetch charges every wanted
    ///   number one attempt
    ///
    /// A transient fetch failure outside repair mode is retried once on a
    /// fresh connection without compression; a second failure is returned so
    /// the caller can skip the group.
    pub(crate) async fn scan(
        &self,
        session: &mut GroupSession,
        first: u64,
        last: u64,
        mode: ScanMode,
    ) -> Result<ChunkSummary> {
        let mut summary = ChunkSummary::for_range(first, last);
        let group = session.row.id;

        let fetch_started = Instant::now();
        let fetched = match &mode {
            ScanMode::Repair { tables, wanted } => {
                match session.provider.fetch_overview(first, last, false).await {
                    Ok(headers) => headers,
                    Err(e) => {
                        tracing::warn!(
                            group = %session.row.name,
                            first,
                            last,
                            error = %e,
                            "Repair fetch failed"
                        );
                        self.db.increment_missing_attempts(*tables, group, wanted).await?;
                        summary.fetch_time = fetch_started.elapsed();
                        return Ok(summary);
                    }
                }
            }
            ScanMode::Update | ScanMode::Backfill => self.fetch_with_fallback(session, first, last).await?,
        };
        summary.fetch_time = fetch_started.elapsed();

        if fetched.is_empty() {
            tracing::debug!(group = %session.row.name, first, last, mode = mode.label(), "No headers returned");
            self.emit_chunk(session, &mode, &summary);
            return Ok(summary);
        }

        record_high_low(&mut summary, &fetched);
        summary.received = fetched.len();
        let received: HashSet<u64> = fetched.iter().map(|h| h.number).collect();

        let (headers, repaired): (Vec<RawHeader>, Vec<u64>) = match &mode {
            ScanMode::Repair { wanted, .. } => {
                let wanted: HashSet<u64> = wanted.iter().copied().collect();
                let headers: Vec<RawHeader> = fetched
                    .into_iter()
                    .filter(|h| wanted.contains(&h.number))
                    .collect();
                let repaired = headers.iter().map(|h| h.number).collect();
                (headers, repaired)
            }
            _ => (fetched, Vec::new()),
        };

        let classify_started = Instant::now();
        let batch = session.classifier.classify(headers);
        summary.classify_time = classify_started.elapsed();
        summary.blacklisted = batch.blacklisted;
        summary.not_yenc = batch.not_yenc;

        if !batch.used_rules.is_empty() {
            let used: Vec<i64> = batch.used_rules.iter().copied().collect();
            self.db.touch_rules(&used).await?;
        }

        let insert_started = Instant::now();
        let mut failed: Vec<(TableSet, Vec<u64>)> = Vec::new();
        for (tables, headers) in [
            (TableSet::MultiGroup, &batch.multigroup),
            (TableSet::Standard, &batch.standard),
        ] {
            if headers.is_empty() {
                continue;
            }
            let report = session.assembler.assemble(&self.db, tables, headers).await;
            if !report.not_inserted.is_empty() {
                summary.not_inserted += report.not_inserted.len();
                failed.push((tables, report.not_inserted));
            }
        }
        summary.insert_time = insert_started.elapsed();

        match &mode {
            ScanMode::Repair { tables, .. } => {
                let not_inserted: HashSet<u64> = failed.iter().flat_map(|(_, n)| n.iter().copied()).collect();
                let repaired: Vec<u64> = repaired.into_iter().filter(|n| !not_inserted.contains(n)).collect();
                if !repaired.is_empty() {
                    summary.repaired = self.db.remove_missing_parts(*tables, group, &repaired).await? as usize;
                }
            }
            ScanMode::Update if self.config.ingest.part_repair => {
                for (tables, numbers) in &failed {
                    tracing::warn!(
                        group = %session.row.name,
                        tables = ?tables,
                        articles = numbers.len(),
                        "Articles failed to insert, queueing for repair"
                    );
                    self.db.add_missing_parts(*tables, group, numbers).await?;
                }

                let not_received: Vec<u64> = (first..=last).filter(|n| !received.contains(n)).collect();
                summary.not_received = not_received.len();
                if !not_received.is_empty() {
                    tracing::debug!(
                        group = %session.row.name,
                        articles = not_received.len(),
                        "Server did not return some articles, queueing for repair"
                    );
                    self.db
                        .add_missing_parts(TableSet::Standard, group, &not_received)
                        .await?;
                }
            }
            _ => {
                summary.not_received = (first..=last).filter(|n| !received.contains(n)).count();
            }
        }

        tracing::debug!(
            group = %session.row.name,
            mode = mode.label(),
            first,
            last,
            received = summary.received,
            blacklisted = summary.blacklisted,
            not_yenc = summary.not_yenc,
            not_inserted = summary.not_inserted,
            not_received = summary.not_received,
            repaired = summary.repaired,
            fetch_ms = summary.fetch_time.as_millis() as u64,
            classify_ms = summary.classify_time.as_millis() as u64,
            insert_ms = summary.insert_time.as_millis() as u64,
            "Chunk processed"
        );
        self.emit_chunk(session, &mode, &summary);

        Ok(summary)
    }

    /// Fetch with the configured compression; on a transient failure
    /// reconnect and fetch once more uncompressed. Compression is requested
    /// again on the next chunk.
    async fn fetch_with_fallback(
        &self,
        session: &mut GroupSession,
        first: u64,
        last: u64,
    ) -> std::result::Result<Vec<RawHeader>, NntpError> {
        let compressed = self.config.ingest.compressed_headers;
        match session.provider.fetch_overview(first, last, compressed).await {
            Ok(headers) => Ok(headers),
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    group = %session.row.name,
                    first,
                    last,
                    error = %e,
                    "Overview fetch failed, retrying without compression"
                );
                session.provider.reconnect().await?;
                session.provider.fetch_overview(first, last, false).await
            }
            Err(e) => Err(e),
        }
    }

    fn emit_chunk(&self, session: &GroupSession, mode: &ScanMode, summary: &ChunkSummary) {
        self.emit(Event::ChunkProcessed {
            group: session.row.name.clone(),
            mode: mode.label().to_string(),
            summary: summary.clone(),
        });
    }
}

/// Lowest and highest received article with their dates
fn record_high_low(summary: &mut ChunkSummary, headers: &[RawHeader]) {
    if let Some(low) = headers.iter().min_by_key(|h| h.number) {
        summary.first_article = Some(low.number);
        summary.first_article_date = low.date;
    }
    if let Some(high) = headers.iter().max_by_key(|h| h.number) {
        summary.last_article = Some(high.number);
        summary.last_article_date = high.date;
    }
}

/// Runs repair ranges through [`Indexer::scan`] on a worker's session
pub(crate) struct RepairScanner<'a> {
    pub(crate) indexer: &'a Indexer,
    pub(crate) session: &'a mut GroupSession,
}

#[async_trait::async_trait]
impl RangeScanner for RepairScanner<'_> {
    async fn scan_range(&mut self, tables: TableSet, range: &RepairRange) -> Result<ChunkSummary> {
        self.indexer.check_cancelled()?;
        self.indexer
            .scan(
                self.session,
                range.first,
                range.last,
                ScanMode::Repair {
                    tables,
                    wanted: range.wanted.clone(),
                },
            )
            .await
    }
}
