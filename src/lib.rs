//! # usenet-indexer
//!
//! Usenet header ingestion engine. Scans newsgroup overview data over NNTP,
//! groups multi-part posts into collections and binaries in SQLite, and
//! keeps per-group watermarks moving forward (update) and backward
//! (backfill), with a bounded repair queue for articles the server missed.
//!
//! ## Components
//!
//! - [`nntp`] - sessions, compressed `XOVER`, overview parsing
//! - [`classifier`] - part descriptors, black/white lists, multigroup routing
//! - [`assembler`] - collection/binary/part staging and transactional apply
//! - [`repair`] - missing-article queue with bounded attempts
//! - [`date_locator`] - article number ⇄ post date search
//! - [`indexer`] - the worker pool tying it together
//!
//! ## Quick Start
//!
//! ```no_run
//! use usenet_indexer::{Config, Indexer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         servers: vec![ServerConfig {
//!             host: "news.example.com".to_string(),
//!             port: 563,
//!             tls: true,
//!             allow_insecure_tls: false,
//!             username: Some("user".to_string()),
//!             password: Some("pass".to_string()),
//!             connections: 4,
//!             timeout: std::time::Duration::from_secs(60),
//!         }],
//!         ..Default::default()
//!     };
//!
//!     let indexer = Indexer::new(config).await?;
//!     indexer.db.add_group("alt.binaries.test", false, 1).await?;
//!
//!     let mut events = indexer.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let summary = indexer.update_all_groups().await?;
//!     println!("fetched {} headers", summary.articles_fetched);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Collection, binary and part assembly
pub mod assembler;
/// Header classification and filter rules
pub mod classifier;
/// Configuration types
pub mod config;
/// Article number / post date search
pub mod date_locator;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Ingestion orchestration (update, backfill, repair)
pub mod indexer;
/// NNTP protocol client
pub mod nntp;
/// Part repair queue
pub mod repair;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{BackfillTarget, Config, NewGroupScan, ServerConfig};
pub use db::Database;
pub use error::{DatabaseError, Error, NntpError, Result};
pub use indexer::Indexer;
pub use types::{ChunkSummary, Event, GroupId, GroupOutcome, RunSummary, ScanMode, TableSet};

use std::future::Future;

/// Drive `run` to completion, cancelling the indexer when a termination
/// signal arrives.
///
/// Cancellation stops new chunks from being requested; chunks already in
/// flight still commit, so `run` returns normally with the affected groups
/// reported as cancelled.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use usenet_indexer::{Config, Indexer, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let indexer = Indexer::new(Config::default()).await?;
///     let summary = run_with_shutdown(&indexer, indexer.update_all_groups()).await?;
///     println!("{} groups", summary.groups_processed);
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown<F, T>(indexer: &Indexer, run: F) -> T
where
    F: Future<Output = T>,
{
    let watcher = indexer.clone();
    let token = indexer.cancellation_token();
    let signal_task = tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => watcher.cancel(),
            _ = token.cancelled() => {}
        }
    });

    let output = run.await;
    signal_task.abort();
    output
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
