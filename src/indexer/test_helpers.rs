//! In-memory NNTP server and shared fixtures for pipeline tests.

use crate::config::{Config, IngestConfig, NewGroupScan, ServerConfig};
use crate::db::Database;
use crate::error::NntpError;
use crate::indexer::Indexer;
use crate::nntp::{GroupInfo, OverviewProvider, RawHeader, SessionFactory};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;

/// One recorded `fetch_overview` call
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct FetchCall {
    pub(crate) group: String,
    pub(crate) first: u64,
    pub(crate) last: u64,
    pub(crate) compressed: bool,
}

/// Groups and articles shared by every session opened against it
#[derive(Default)]
pub(crate) struct MockServer {
    groups: Mutex<HashMap<String, GroupInfo>>,
    articles: Mutex<HashMap<String, BTreeMap<u64, RawHeader>>>,
    failures: Mutex<VecDeque<NntpError>>,
    fetches: Mutex<Vec<FetchCall>>,
    reconnects: AtomicUsize,
    sessions: AtomicUsize,
}

impl MockServer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a group with the article range the server advertises
    pub(crate) fn add_group(&self, name: &str, first: u64, last: u64) {
        self.groups.lock().unwrap().insert(
            name.to_string(),
            GroupInfo {
                name: name.to_string(),
                first,
                last,
                count: last.saturating_sub(first) + 1,
            },
        );
    }

    pub(crate) fn add_articles(&self, group: &str, headers: impl IntoIterator<Item = RawHeader>) {
        let mut articles = self.articles.lock().unwrap();
        let stored = articles.entry(group.to_string()).or_default();
        for header in headers {
            stored.insert(header.number, header);
        }
    }

    /// The next fetch fails with `err` (queued failures are consumed in order)
    pub(crate) fn fail_next(&self, err: NntpError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub(crate) fn fetches(&self) -> Vec<FetchCall> {
        self.fetches.lock().unwrap().clone()
    }

    pub(crate) fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn sessions_opened(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub(crate) fn provider(self: &Arc<Self>) -> MockOverviewProvider {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        MockOverviewProvider {
            server: self.clone(),
            selected: None,
        }
    }
}

/// One session against a [`MockServer`]
pub(crate) struct MockOverviewProvider {
    server: Arc<MockServer>,
    selected: Option<String>,
}

#[async_trait::async_trait]
impl OverviewProvider for MockOverviewProvider {
    async fn select_group(&mut self, name: &str) -> Result<GroupInfo, NntpError> {
        let info = self
            .server
            .groups
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| NntpError::NoSuchGroup(name.to_string()))?;
        self.selected = Some(name.to_string());
        Ok(info)
    }

    async fn fetch_overview(
        &mut self,
        first: u64,
        last: u64,
        compressed: bool,
    ) -> Result<Vec<RawHeader>, NntpError> {
        let group = self
            .selected
            .clone()
            .ok_or_else(|| NntpError::Protocol {
                code: 412,
                message: "No newsgroup selected".to_string(),
            })?;
        self.server.fetches.lock().unwrap().push(FetchCall {
            group: group.clone(),
            first,
            last,
            compressed,
        });

        if let Some(err) = self.server.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        Ok(self
            .server
            .articles
            .lock()
            .unwrap()
            .get(&group)
            .map(|articles| articles.range(first..=last).map(|(_, h)| h.clone()).collect())
            .unwrap_or_default())
    }

    async fn reconnect(&mut self) -> Result<(), NntpError> {
        self.server.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`MockOverviewProvider`]s
pub(crate) struct MockSessionFactory(pub(crate) Arc<MockServer>);

#[async_trait::async_trait]
impl SessionFactory for MockSessionFactory {
    async fn open(&self) -> Result<Box<dyn OverviewProvider>, NntpError> {
        Ok(Box::new(self.0.provider()))
    }
}

/// Overview record for article `number` posted at unix time `posted`
pub(crate) fn article(number: u64, subject: &str, from: &str, posted: i64) -> RawHeader {
    RawHeader {
        number,
        subject: subject.to_string(),
        from: from.to_string(),
        date: chrono::DateTime::from_timestamp(posted, 0),
        message_id: format!("<{number}@example.com>"),
        bytes: 1_000,
        xref: format!("news.example.com alt.binaries.test:{number}"),
    }
}

/// Configuration with a small request buffer so tests stay fast
pub(crate) fn test_config(buffer: u64) -> Config {
    Config {
        servers: vec![ServerConfig {
            host: "news.invalid".to_string(),
            port: 563,
            tls: true,
            allow_insecure_tls: false,
            username: None,
            password: None,
            connections: 2,
            timeout: Duration::from_secs(5),
        }],
        ingest: IngestConfig {
            max_messages_per_request: buffer,
            new_group_scan: NewGroupScan::Messages { count: 2_000 },
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Temp database wrapped for sharing
pub(crate) async fn test_db() -> (Arc<Database>, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (Arc::new(db), temp_file)
}

/// Indexer wired to a mock server
pub(crate) async fn test_indexer(
    config: Config,
) -> (Indexer, Arc<MockServer>, NamedTempFile) {
    let (db, temp_file) = test_db().await;
    let server = MockServer::new();
    let indexer = Indexer::with_parts(
        config,
        db,
        Arc::new(MockSessionFactory(server.clone())),
    );
    (indexer, server, temp_file)
}
