//! Forward catch-up from the newest local article toward the server's newest.

use super::Indexer;
use super::scan::GroupSession;
use crate::config::NewGroupScan;
use crate::error::Result;
use crate::nntp::GroupInfo;
use crate::types::{ChunkSummary, GroupOutcome, RunSummary, ScanMode};

/// Articles planned for one forward run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForwardWindow {
    /// Newest article already held; fetching starts right after it
    pub first: u64,
    /// Newest article this run will fetch
    pub last: u64,
    /// Articles deliberately left on the server for the next run
    pub leave_over: u64,
}

impl ForwardWindow {
    /// Articles this run will request
    pub fn total(&self) -> u64 {
        self.last.saturating_sub(self.first)
    }
}

/// Trailing margin left unfetched for a group that already has a watermark.
///
/// More than two buffers behind: the remainder plus one buffer. Otherwise
/// half of what is available, rounded down.
pub fn leave_over(available: u64, buffer: u64) -> u64 {
    if available > buffer.saturating_mul(2) {
        available % buffer + buffer
    } else {
        available / 2
    }
}

/// Plan a forward run.
///
/// `local_last` is the group's newest local article (0 for a new group) and
/// `new_group_first` the starting point chosen for a new group. `max_headers`
/// (0 = unlimited) caps the window without moving the logical target.
pub fn forward_window(
    local_last: u64,
    new_group_first: u64,
    info: &GroupInfo,
    buffer: u64,
    max_headers: u64,
) -> ForwardWindow {
    let (first, leave_over) = if local_last == 0 {
        (new_group_first, buffer)
    } else {
        (
            local_last,
            leave_over(info.last.saturating_sub(local_last), buffer),
        )
    };

    let mut last = info.last.saturating_sub(leave_over).max(first);
    if max_headers > 0 && max_headers < last - first {
        last = first + max_headers;
    }

    ForwardWindow {
        first,
        last,
        leave_over,
    }
}

/// Starting article for a new group scanned by message count: `count` plus
/// one buffer below the server's newest, never below its oldest.
pub(crate) fn new_group_start_by_messages(info: &GroupInfo, count: u64, buffer: u64) -> u64 {
    let wanted = info.last.saturating_sub(count.saturating_add(buffer));
    if info.first >= wanted { info.first } else { wanted }
}

impl Indexer {
    /// Repair, then fetch forward chunk by chunk, committing the watermark
    /// after every chunk.
    pub(crate) async fn update(
        &self,
        session: &mut GroupSession,
        summary: &mut RunSummary,
    ) -> Result<GroupOutcome> {
        let ingest = &self.config.ingest;
        let buffer = ingest.max_messages_per_request.max(1);
        let id = session.row.id;

        if session.row.last_record != 0 && ingest.part_repair {
            self.repair_group(session, summary).await?;
        }

        // Groups upgraded from an older schema carry a first record without a date
        if session.row.first_record != 0 && session.row.first_record_postdate.is_none() {
            let date = session.postdate(&self.db, session.row.first_article()).await?;
            self.db.set_first_record_postdate(id, date).await?;
            session.row.first_record_postdate = Some(date.timestamp());
        }

        let new_group = session.row.last_record == 0;
        let new_group_first = if new_group {
            match ingest.new_group_scan {
                NewGroupScan::Days { days } => session.daytopost(&self.db, days).await?,
                NewGroupScan::Messages { count } => {
                    new_group_start_by_messages(&session.info, count, buffer)
                }
            }
        } else {
            0
        };

        let window = forward_window(
            session.row.last_article(),
            new_group_first,
            &session.info,
            buffer,
            ingest.max_headers_per_run,
        );

        if window.total() == 0 {
            self.db.touch_group(id).await?;
            tracing::info!(
                group = %session.row.name,
                local_last = session.row.last_record,
                server_last = session.info.last,
                leave_over = window.leave_over,
                "No new articles"
            );
            return Ok(GroupOutcome::UpToDate);
        }

        tracing::info!(
            group = %session.row.name,
            new_group,
            first = window.first + 1,
            last = window.last,
            leave_over = window.leave_over,
            server_first = session.info.first,
            server_last = session.info.last,
            "Fetching new articles"
        );

        let mut first = window.first;
        loop {
            self.check_cancelled()?;

            let last = first.saturating_add(buffer).min(window.last);
            let chunk = self.scan(session, first + 1, last, ScanMode::Update).await?;
            summary.record_chunk(&chunk);
            self.commit_forward(session, &chunk, last).await?;

            tracing::debug!(
                group = %session.row.name,
                first = first + 1,
                last,
                remaining = window.last - last,
                "Chunk committed"
            );

            if last >= window.last {
                break;
            }
            first = last;
        }

        Ok(GroupOutcome::Completed)
    }

    /// Move the newest watermark to `last` and, on a new group's first chunk,
    /// record the oldest watermark as well.
    async fn commit_forward(
        &self,
        session: &mut GroupSession,
        chunk: &ChunkSummary,
        last: u64,
    ) -> Result<()> {
        let id = session.row.id;

        let Some(last_article) = chunk.last_article else {
            let date = session.postdate(&self.db, last).await?;
            self.db.advance_last_record(id, last, Some(date)).await?;
            session.row.last_record = session.row.last_record.max(last as i64);
            session.row.last_record_postdate = Some(date.timestamp());
            return Ok(());
        };

        if session.row.first_record == 0
            && let Some(first_article) = chunk.first_article
        {
            let date = match chunk.first_article_date {
                Some(date) => date,
                None => session.postdate(&self.db, first_article).await?,
            };
            self.db.lower_first_record(id, first_article, Some(date)).await?;
            session.row.first_record = first_article as i64;
            session.row.first_record_postdate = Some(date.timestamp());
        }

        let date = match chunk.last_article_date {
            Some(date) => date,
            None => session.postdate(&self.db, last_article).await?,
        };
        self.db.advance_last_record(id, last, Some(date)).await?;
        session.row.last_record = session.row.last_record.max(last as i64);
        session.row.last_record_postdate = Some(date.timestamp());

        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn info(first: u64, last: u64) -> GroupInfo {
        GroupInfo {
            name: "alt.binaries.test".to_string(),
            first,
            last,
            count: last - first,
        }
    }

    #[test]
    fn leave_over_far_behind_keeps_remainder_plus_buffer() {
        assert_eq!(leave_over(2_500, 1_000), 1_500);
        assert_eq!(leave_over(3_000, 1_000), 1_000);
    }

    #[test]
    fn leave_over_close_behind_keeps_half() {
        assert_eq!(leave_over(2_000, 1_000), 1_000);
        assert_eq!(leave_over(7, 1_000), 3);
        assert_eq!(leave_over(0, 1_000), 0);
    }

    #[test]
    fn new_group_by_messages_starts_count_plus_buffer_back() {
        let server = info(1_000, 5_000);
        let start = new_group_start_by_messages(&server, 2_000, 100);
        assert_eq!(start, 5_000 - (2_000 + 100));

        let window = forward_window(0, start, &server, 100, 0);
        assert_eq!(window.first, 2_900);
        assert_eq!(window.last, 4_900);
        assert_eq!(window.leave_over, 100);
    }

    #[test]
    fn new_group_start_is_clamped_to_server_oldest() {
        assert_eq!(new_group_start_by_messages(&info(1_000, 2_000), 2_000, 100), 1_000);
        assert_eq!(new_group_start_by_messages(&info(0, 50), 2_000, 100), 0);
    }

    #[test]
    fn existing_group_window_uses_adaptive_leave_over() {
        let window = forward_window(10_000, 0, &info(1, 12_500), 1_000, 0);
        assert_eq!(window.leave_over, 1_500);
        assert_eq!(window.first, 10_000);
        assert_eq!(window.last, 11_000);
    }

    #[test]
    fn nothing_new_yields_empty_window() {
        let window = forward_window(5_000, 0, &info(1, 5_000), 100, 0);
        assert_eq!(window.total(), 0);

        // Server reports fewer articles than we hold
        let window = forward_window(6_000, 0, &info(1, 5_000), 100, 0);
        assert_eq!(window.total(), 0);
    }

    #[test]
    fn max_headers_caps_the_window() {
        let window = forward_window(1_000, 0, &info(1, 100_000), 1_000, 500);
        assert_eq!(window.first, 1_000);
        assert_eq!(window.last, 1_500);

        let uncapped = forward_window(1_000, 0, &info(1, 100_000), 1_000, 0);
        assert!(uncapped.last > 1_500);
    }
}
