//! Backward walk from the oldest local article toward a target.

use super::Indexer;
use super::scan::GroupSession;
use crate::config::BackfillTarget;
use crate::error::Result;
use crate::types::{Event, GroupOutcome, RunSummary, ScanMode};

/// Next backward chunk ending at `last`: at most `buffer` articles, never
/// below `target`.
pub(crate) fn backfill_chunk(last: u64, target: u64, buffer: u64) -> (u64, u64) {
    let first = last.saturating_sub(buffer.saturating_sub(1)).max(target);
    (first, last)
}

impl Indexer {
    /// Walk backward chunk by chunk, lowering the oldest watermark after
    /// every chunk.
    pub(crate) async fn backfill(
        &self,
        session: &mut GroupSession,
        target: Option<BackfillTarget>,
        summary: &mut RunSummary,
    ) -> Result<GroupOutcome> {
        let id = session.row.id;
        let name = session.row.name.clone();
        let buffer = self.config.ingest.max_messages_per_request.max(1);

        if session.row.first_record <= 0 {
            tracing::warn!(group = %name, "Group has never been updated, run an update first");
            return Ok(GroupOutcome::Skipped {
                reason: "group has never been updated".to_string(),
            });
        }
        let local_first = session.row.first_article();

        let target_article = if local_first <= session.info.first {
            session.info.first
        } else {
            let target = target.unwrap_or(BackfillTarget::Days {
                days: session.row.backfill_target.max(0) as u32,
            });
            match target {
                BackfillTarget::Days { days } => session.daytopost(&self.db, days).await?,
                BackfillTarget::Articles { count } => local_first.saturating_sub(count),
            }
            .max(session.info.first)
        };

        if target_article >= local_first {
            let disable = self.config.backfill.disable_group_on_exhaustion;
            if disable {
                self.db.set_group_backfill(id, false).await?;
            }
            tracing::info!(
                group = %name,
                target = target_article,
                local_first,
                server_first = session.info.first,
                backfill_disabled = disable,
                "Backfill target reached"
            );
            self.emit(Event::BackfillExhausted {
                group: name,
                disabled: disable,
            });
            return Ok(GroupOutcome::BackfillExhausted);
        }

        tracing::info!(
            group = %name,
            target = target_article,
            local_first,
            server_first = session.info.first,
            server_last = session.info.last,
            "Backfilling"
        );

        // Backfilled gaps are only queued for repair when asked to
        let mode = if self.config.backfill.part_repair_during_backfill {
            ScanMode::Update
        } else {
            ScanMode::Backfill
        };

        let mut last = local_first - 1;
        loop {
            self.check_cancelled()?;

            let (first, chunk_last) = backfill_chunk(last, target_article, buffer);
            let chunk = self.scan(session, first, chunk_last, mode.clone()).await?;
            summary.record_chunk(&chunk);

            let date = match chunk.first_article_date {
                Some(date) => date,
                None => session.postdate(&self.db, first).await?,
            };
            self.db.lower_first_record(id, first, Some(date)).await?;
            session.row.first_record = first as i64;
            session.row.first_record_postdate = Some(date.timestamp());

            tracing::debug!(
                group = %name,
                first,
                last = chunk_last,
                remaining = first - target_article,
                "Backfill chunk committed"
            );

            if first <= target_article {
                break;
            }
            last = first - 1;
        }

        Ok(GroupOutcome::Completed)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_are_buffer_sized_and_stop_at_target() {
        assert_eq!(backfill_chunk(2_999, 2_750, 100), (2_900, 2_999));
        assert_eq!(backfill_chunk(2_799, 2_750, 100), (2_750, 2_799));
        assert_eq!(backfill_chunk(50, 0, 100), (0, 50));
    }
}
