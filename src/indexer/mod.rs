//! Ingestion orchestration split into focused submodules.
//!
//! The [`Indexer`] owns the shared pieces (database, configuration, filter
//! caches, event channel, cancellation token) and runs a bounded pool of
//! group workers, each with its own NNTP session:
//! - [`scan`] - the fetch→classify→assemble pipeline for one article range
//! - [`update`] - forward catch-up from the newest local article
//! - [`backfill`] - backward walk toward a date or article target

mod backfill;
mod scan;
mod update;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

pub use update::{ForwardWindow, forward_window, leave_over};

use crate::classifier::FilterCache;
use crate::config::{BackfillTarget, Config};
use crate::db::{Database, GroupRow};
use crate::error::{Error, NntpError, Result};
use crate::nntp::{NntpSessionFactory, SessionFactory};
use crate::repair::RepairQueue;
use crate::types::{Event, GroupOutcome, RunSummary, TableSet};
use chrono::{TimeZone, Utc};
use futures::stream::{self, StreamExt};
use scan::GroupSession;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a worker does with its group
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Policy {
    /// Repair pass, then forward catch-up
    Update,
    /// Backward walk; `None` uses the group's own day target
    Backfill(Option<BackfillTarget>),
    /// Repair passes only
    Repair,
}

impl Policy {
    fn label(self) -> &'static str {
        match self {
            Policy::Update => "update",
            Policy::Backfill(_) => "backfill",
            Policy::Repair => "repair",
        }
    }
}

/// Header ingestion engine (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct Indexer {
    /// Database instance shared by every worker
    pub db: Arc<Database>,
    pub(crate) config: Arc<Config>,
    sessions: Arc<dyn SessionFactory>,
    filters: Arc<FilterCache>,
    event_tx: tokio::sync::broadcast::Sender<Event>,
    cancel: CancellationToken,
}

impl Indexer {
    /// Validate the configuration, open the database and prepare NNTP
    /// sessions against the primary server.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let server = config.primary_server().cloned().ok_or_else(|| Error::Config {
            message: "at least one server is required".to_string(),
            key: Some("servers".to_string()),
        })?;

        let db = Database::new(&config.persistence.database_path).await?;
        let sessions = Arc::new(NntpSessionFactory::new(server, config.retry.clone()));

        Ok(Self::with_parts(config, Arc::new(db), sessions))
    }

    /// Assemble an indexer from already-built parts
    pub fn with_parts(config: Config, db: Arc<Database>, sessions: Arc<dyn SessionFactory>) -> Self {
        let filters = Arc::new(FilterCache::new(db.clone(), config.ingest.cache_ttl));
        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);

        Self {
            db,
            config: Arc::new(config),
            sessions,
            filters,
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to progress events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Stop requesting new chunks; in-flight chunks still commit
    pub fn cancel(&self) {
        tracing::info!("Cancellation requested, finishing in-flight chunks");
        self.cancel.cancel();
    }

    /// Token that is cancelled by [`Indexer::cancel`]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shared black/white list and multigroup poster cache
    pub fn filters(&self) -> &FilterCache {
        &self.filters
    }

    /// Catch up every active group
    pub async fn update_all_groups(&self) -> Result<RunSummary> {
        let groups = self.db.list_active_groups().await?;
        self.run_groups(groups, Policy::Update).await
    }

    /// Catch up one group by name
    pub async fn update_group(&self, name: &str) -> Result<RunSummary> {
        let group = self.require_group(name).await?;
        Ok(self.run_group(group, Policy::Update).await)
    }

    /// Backfill every backfill-enabled group.
    ///
    /// With no explicit target each group walks back to its own
    /// `backfill_target` in days.
    pub async fn backfill_all_groups(&self, target: Option<BackfillTarget>) -> Result<RunSummary> {
        let groups = self.db.list_backfill_groups().await?;
        self.run_groups(groups, Policy::Backfill(target)).await
    }

    /// Backfill one group by name
    pub async fn backfill_group(&self, name: &str, target: Option<BackfillTarget>) -> Result<RunSummary> {
        let group = self.require_group(name).await?;
        Ok(self.run_group(group, Policy::Backfill(target)).await)
    }

    /// Backfill, by article count, the first group (by name) whose oldest
    /// local post is still newer than the configured safe backfill date.
    pub async fn safe_backfill(&self, articles: Option<u64>) -> Result<RunSummary> {
        let since = Utc.from_utc_datetime(
            &self
                .config
                .backfill
                .safe_backfill_date
                .and_hms_opt(0, 0, 0)
                .unwrap_or_default(),
        );

        let Some(group) = self.db.next_safe_backfill_group(since).await? else {
            tracing::info!(since = %since, "No groups left to safe backfill");
            return Ok(RunSummary::default());
        };

        let count = articles.unwrap_or(self.config.backfill.default_articles);
        tracing::info!(group = %group.name, articles = count, "Safe backfill");
        Ok(self
            .run_group(group, Policy::Backfill(Some(BackfillTarget::Articles { count })))
            .await)
    }

    /// Run a part repair pass for every active group
    pub async fn repair_all(&self) -> Result<RunSummary> {
        let groups = self.db.list_active_groups().await?;
        self.run_groups(groups, Policy::Repair).await
    }

    async fn require_group(&self, name: &str) -> Result<GroupRow> {
        self.db
            .get_group(name)
            .await?
            .ok_or_else(|| Error::GroupNotFound(name.to_string()))
    }

    /// Process `groups` with at most `connections` workers at a time
    async fn run_groups(&self, groups: Vec<GroupRow>, policy: Policy) -> Result<RunSummary> {
        let concurrency = self
            .config
            .primary_server()
            .map(|s| s.connections)
            .unwrap_or(1)
            .max(1);

        tracing::info!(
            groups = groups.len(),
            workers = concurrency,
            policy = policy.label(),
            "Starting run"
        );

        let per_group: Vec<RunSummary> = stream::iter(groups)
            .map(|group| self.run_group(group, policy))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut summary = RunSummary::default();
        for group in per_group {
            summary.merge(group);
        }

        tracing::info!(
            policy = policy.label(),
            groups = summary.groups_processed,
            fetched = summary.articles_fetched,
            not_inserted = summary.articles_not_inserted,
            repaired = summary.articles_repaired,
            abandoned = summary.articles_abandoned,
            skipped = summary.skipped.len(),
            "Run finished"
        );

        Ok(summary)
    }

    /// One worker: open a session, apply `policy`, and turn group-level
    /// failures into skip reasons so the run carries on.
    async fn run_group(&self, group: GroupRow, policy: Policy) -> RunSummary {
        let mut summary = RunSummary {
            groups_processed: 1,
            ..Default::default()
        };
        let name = group.name.clone();
        let id = group.id;

        self.emit(Event::GroupStarted {
            group: name.clone(),
            policy: policy.label().to_string(),
        });

        let result = match self.open_group(group).await {
            Ok(mut session) => match policy {
                Policy::Update => self.update(&mut session, &mut summary).await,
                Policy::Backfill(target) => self.backfill(&mut session, target, &mut summary).await,
                Policy::Repair => self
                    .repair_group(&mut session, &mut summary)
                    .await
                    .map(|()| GroupOutcome::Completed),
            },
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(Error::Cancelled) => GroupOutcome::Cancelled,
            Err(Error::Nntp(NntpError::NoSuchGroup(_))) => {
                tracing::warn!(group = %name, "Server no longer carries group, disabling it");
                if let Err(e) = self.db.disable_group(id).await {
                    tracing::error!(group = %name, error = %e, "Failed to disable group");
                }
                GroupOutcome::Disabled
            }
            Err(e) => {
                tracing::warn!(group = %name, error = %e, "Skipping group");
                GroupOutcome::Skipped {
                    reason: e.to_string(),
                }
            }
        };

        match &outcome {
            GroupOutcome::Skipped { reason } => {
                summary.skipped.push((name.clone(), reason.clone()));
                self.emit(Event::GroupSkipped {
                    group: name.clone(),
                    reason: reason.clone(),
                });
            }
            GroupOutcome::Disabled => {
                summary
                    .skipped
                    .push((name.clone(), "no such group on server; disabled".to_string()));
            }
            GroupOutcome::Cancelled => {
                summary.skipped.push((name.clone(), "cancelled".to_string()));
            }
            _ => {}
        }

        tracing::info!(group = %name, outcome = ?outcome, "Group finished");
        self.emit(Event::GroupFinished {
            group: name,
            outcome,
        });

        summary
    }

    /// Repair passes over the standard queue and, when multigroup posting is
    /// in play, the multigroup queue.
    async fn repair_group(&self, session: &mut GroupSession, summary: &mut RunSummary) -> Result<()> {
        self.check_cancelled()?;
        let queue = RepairQueue::new(self.db.clone(), &self.config.ingest);

        let mut tables = vec![TableSet::Standard];
        if session.multigroup_active() {
            tables.push(TableSet::MultiGroup);
        }

        for tables in tables {
            let id = session.row.id;
            let name = session.row.name.clone();
            let mut scanner = scan::RepairScanner {
                indexer: self,
                session: &mut *session,
            };
            let outcome = queue.run_pass(tables, id, &mut scanner).await?;

            summary.articles_fetched += outcome.received as u64;
            summary.articles_repaired += outcome.repaired as u64;
            summary.articles_abandoned += outcome.abandoned;

            if outcome.attempted > 0 || outcome.abandoned > 0 {
                self.emit(Event::RepairCompleted {
                    group: name,
                    tables,
                    attempted: outcome.attempted,
                    repaired: outcome.repaired,
                    abandoned: outcome.abandoned,
                });
            }
        }

        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine
        self.event_tx.send(event).ok();
    }
}
