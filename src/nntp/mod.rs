//! NNTP protocol boundary.
//!
//! - [`OverviewProvider`] is the seam the rest of the crate talks to: group
//!   selection and overview-range fetches against one persistent session
//! - [`SessionFactory`] hands every worker its own session
//! - [`overview`] maps `XOVER` and `HDR Xref` records into [`RawHeader`]s
//! - [`session`] wraps an [`nntp_rs::NntpClient`] per worker

pub mod overview;
pub mod session;

use crate::error::NntpError;
use chrono::{DateTime, Utc};

pub use session::{NntpSession, NntpSessionFactory};

/// Group state as reported by the server's `GROUP` response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupInfo {
    /// Group name as echoed by the server
    pub name: String,
    /// Oldest available article number
    pub first: u64,
    /// Newest available article number
    pub last: u64,
    /// Server's estimate of available articles
    pub count: u64,
}

/// One overview record
#[derive(Clone, Debug, PartialEq)]
pub struct RawHeader {
    /// Article number within the selected group
    pub number: u64,
    /// Subject header
    pub subject: String,
    /// From header (poster identity)
    pub from: String,
    /// Parsed Date header, if it could be parsed
    pub date: Option<DateTime<Utc>>,
    /// Message-ID including angle brackets
    pub message_id: String,
    /// Article size in bytes
    pub bytes: u64,
    /// Raw Xref value without the `Xref:` prefix
    pub xref: String,
}

/// A persistent NNTP session owned by a single worker.
///
/// Implementations reconnect transparently when the underlying connection
/// drops; callers only see [`NntpError::Transient`] when a request could not
/// be completed.
#[async_trait::async_trait]
pub trait OverviewProvider: Send {
    /// Select a group and return its current article range
    async fn select_group(&mut self, name: &str) -> Result<GroupInfo, NntpError>;

    /// Fetch overview records for `first..=last` of the selected group.
    ///
    /// Articles the server does not have are simply absent from the result.
    async fn fetch_overview(
        &mut self,
        first: u64,
        last: u64,
        compressed: bool,
    ) -> Result<Vec<RawHeader>, NntpError>;

    /// Drop the current connection and establish a fresh one, re-selecting
    /// the previously selected group.
    async fn reconnect(&mut self) -> Result<(), NntpError>;
}

/// Opens one [`OverviewProvider`] per worker
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a new, independent session
    async fn open(&self) -> Result<Box<dyn OverviewProvider>, NntpError>;
}
