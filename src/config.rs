//! Configuration types for usenet-indexer

use crate::error::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};

/// Main configuration for the [`Indexer`](crate::Indexer)
///
/// Every section has defaults, so an empty TOML file plus one `[[servers]]`
/// entry is a valid configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// NNTP server configurations (the first one is used for scanning)
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Connect/reconnect backoff
    #[serde(default)]
    pub retry: RetryConfig,

    /// Header ingestion behavior (chunk sizes, compression, part repair)
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Backfill policy
    #[serde(default)]
    pub backfill: BackfillConfig,

    /// Data storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Load and validate a configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the indexer cannot run with
    pub fn validate(&self) -> Result<()> {
        let server = self.servers.first().ok_or_else(|| Error::Config {
            message: "at least one server is required".to_string(),
            key: Some("servers".to_string()),
        })?;
        if !server.tls {
            return Err(Error::Config {
                message: format!(
                    "server {} requests a plain connection; only NNTP over TLS is supported",
                    server.host
                ),
                key: Some("servers.tls".to_string()),
            });
        }
        if server.connections == 0 {
            return Err(Error::Config {
                message: "connections must be at least 1".to_string(),
                key: Some("servers.connections".to_string()),
            });
        }
        if self.ingest.max_messages_per_request < 4 {
            return Err(Error::Config {
                message: "max_messages_per_request must be at least 4".to_string(),
                key: Some("ingest.max_messages_per_request".to_string()),
            });
        }
        if self.ingest.part_repair_max_tries == 0 {
            return Err(Error::Config {
                message: "part_repair_max_tries must be at least 1".to_string(),
                key: Some("ingest.part_repair_max_tries".to_string()),
            });
        }
        for exception in &self.ingest.ignore_file_count {
            regex::Regex::new(&exception.subject_regex).map_err(|e| Error::Config {
                message: format!("invalid ignore_file_count regex: {e}"),
                key: Some("ingest.ignore_file_count".to_string()),
            })?;
        }
        Ok(())
    }

    /// The server used for scanning
    pub fn primary_server(&self) -> Option<&ServerConfig> {
        self.servers.first()
    }
}

/// NNTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server hostname
    pub host: String,

    /// Server port (typically 563)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Use TLS (default: true; plain connections are rejected by [`Config::validate`])
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Accept any server certificate (default: false)
    #[serde(default)]
    pub allow_insecure_tls: bool,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Number of scanning workers, one session each (default: 4)
    #[serde(default = "default_connections")]
    pub connections: usize,

    /// Upper bound for a single request/response exchange (default: 60 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl From<ServerConfig> for nntp_rs::ServerConfig {
    fn from(config: ServerConfig) -> Self {
        nntp_rs::ServerConfig {
            host: config.host,
            port: config.port,
            tls: config.tls,
            allow_insecure_tls: config.allow_insecure_tls,
            username: config.username.unwrap_or_default(),
            password: config.password.unwrap_or_default(),
        }
    }
}

/// Retry configuration for connection establishment
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// How far back a never-scanned group starts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum NewGroupScan {
    /// Start at the article posted roughly `days` ago
    Days {
        /// Days back from now
        days: u32,
    },
    /// Start `count` (+ one request buffer) articles below the server's newest
    Messages {
        /// Articles to take from the head of the group
        count: u64,
    },
}

impl Default for NewGroupScan {
    fn default() -> Self {
        NewGroupScan::Messages { count: 50_000 }
    }
}

/// How far back a backfill run should reach
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum BackfillTarget {
    /// Reach the article posted roughly `days` ago
    Days {
        /// Days back from now
        days: u32,
    },
    /// Reach `count` articles below the group's oldest local article
    Articles {
        /// Articles to add below the current oldest watermark
        count: u64,
    },
}

/// A group/subject pair whose declared file count must be ignored
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileCountException {
    /// Exact group name the exception applies to
    pub group: String,
    /// Regex matched against the base subject
    pub subject_regex: String,
}

/// Header ingestion configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Request compressed overview data (default: true)
    #[serde(default = "default_true")]
    pub compressed_headers: bool,

    /// Maximum articles requested per XOVER chunk (default: 20000)
    #[serde(default = "default_max_messages")]
    pub max_messages_per_request: u64,

    /// Starting point for never-scanned groups
    #[serde(default)]
    pub new_group_scan: NewGroupScan,

    /// Queue and retry missing articles (default: true)
    #[serde(default = "default_true")]
    pub part_repair: bool,

    /// Maximum queued articles retried per group per run (default: 15000)
    #[serde(default = "default_max_part_repair")]
    pub max_part_repair: u32,

    /// Attempts before a missing article is abandoned (default: 3)
    #[serde(default = "default_part_repair_max_tries")]
    pub part_repair_max_tries: u32,

    /// Route every poster to the multigroup table set (default: false)
    #[serde(default)]
    pub all_as_multigroup: bool,

    /// Log subjects dropped as non-yEnc (default: false)
    #[serde(default)]
    pub log_dropped_non_yenc: bool,

    /// Cap on articles fetched per group per update run; 0 = unlimited
    #[serde(default)]
    pub max_headers_per_run: u64,

    /// Groups/subjects whose declared file count is forced to 0
    #[serde(default = "default_ignore_file_count")]
    pub ignore_file_count: Vec<FileCountException>,

    /// Lifetime of the black/white list and multigroup poster caches (default: 600 seconds)
    #[serde(default = "default_cache_ttl", with = "duration_serde")]
    pub cache_ttl: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            compressed_headers: true,
            max_messages_per_request: default_max_messages(),
            new_group_scan: NewGroupScan::default(),
            part_repair: true,
            max_part_repair: default_max_part_repair(),
            part_repair_max_tries: default_part_repair_max_tries(),
            all_as_multigroup: false,
            log_dropped_non_yenc: false,
            max_headers_per_run: 0,
            ignore_file_count: default_ignore_file_count(),
            cache_ttl: default_cache_ttl(),
        }
    }
}

impl IngestConfig {
    /// Largest span of article numbers merged into one repair request
    pub fn repair_range_span(&self) -> u64 {
        (self.max_messages_per_request / 4).max(1)
    }
}

/// Backfill configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Turn backfill off for a group once its target is reached (default: false)
    #[serde(default)]
    pub disable_group_on_exhaustion: bool,

    /// Safe backfill walks groups whose oldest post is newer than this date
    #[serde(default = "default_safe_backfill_date")]
    pub safe_backfill_date: NaiveDate,

    /// Feed missing backfill articles to part repair as well (default: false)
    #[serde(default)]
    pub part_repair_during_backfill: bool,

    /// Article count used by safe backfill (default: 20000)
    #[serde(default = "default_backfill_articles")]
    pub default_articles: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            disable_group_on_exhaustion: false,
            safe_backfill_date: default_safe_backfill_date(),
            part_repair_during_backfill: false,
            default_articles: default_backfill_articles(),
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./usenet-indexer.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

// Default value functions
fn default_port() -> u16 {
    563
}

fn default_connections() -> usize {
    4
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_messages() -> u64 {
    20_000
}

fn default_max_part_repair() -> u32 {
    15_000
}

fn default_part_repair_max_tries() -> u32 {
    3
}

fn default_ignore_file_count() -> Vec<FileCountException> {
    vec![FileCountException {
        group: "alt.binaries.erotica".to_string(),
        subject_regex: r"^\[\d+\]-\[FULL\]-\[#a\.b\.erotica@EFNet\]-\[ \d{2,3}_".to_string(),
    }]
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(600)
}

fn default_safe_backfill_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2008, 8, 14).unwrap_or_default()
}

fn default_backfill_articles() -> u64 {
    20_000
}

fn default_database_path() -> PathBuf {
    PathBuf::from("usenet-indexer.db")
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerConfig {
        ServerConfig {
            host: "news.example.com".to_string(),
            port: 563,
            tls: true,
            allow_insecure_tls: false,
            username: None,
            password: None,
            connections: 2,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn minimal_toml_fills_every_default() {
        let config: Config = toml::from_str(
            r#"
            [[servers]]
            host = "news.example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.servers[0].port, 563);
        assert!(config.servers[0].tls);
        assert!(!config.servers[0].allow_insecure_tls);
        assert_eq!(config.servers[0].connections, 4);
        assert_eq!(config.servers[0].timeout, Duration::from_secs(60));
        assert!(config.ingest.compressed_headers);
        assert_eq!(config.ingest.max_messages_per_request, 20_000);
        assert_eq!(
            config.ingest.new_group_scan,
            NewGroupScan::Messages { count: 50_000 }
        );
        assert_eq!(config.ingest.part_repair_max_tries, 3);
        assert_eq!(config.ingest.ignore_file_count.len(), 1);
        assert_eq!(
            config.backfill.safe_backfill_date,
            NaiveDate::from_ymd_opt(2008, 8, 14).unwrap()
        );
        config.validate().unwrap();
    }

    #[test]
    fn new_group_scan_by_days_parses_from_tagged_table() {
        let config: Config = toml::from_str(
            r#"
            [[servers]]
            host = "news.example.com"

            [ingest]
            new_group_scan = { method = "days", days = 3 }
            cache_ttl = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.ingest.new_group_scan, NewGroupScan::Days { days: 3 });
        assert_eq!(config.ingest.cache_ttl, Duration::from_secs(30));
    }

    #[test]
    fn validate_requires_a_server() {
        let err = Config::default().validate().unwrap_err();
        assert!(matches!(err, Error::Config { key: Some(k), .. } if k == "servers"));
    }

    #[test]
    fn validate_rejects_plain_servers() {
        let config = Config {
            servers: vec![ServerConfig {
                tls: false,
                ..server()
            }],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config { key: Some(k), .. } if k == "servers.tls"));
    }

    #[test]
    fn server_converts_to_client_config() {
        let client: nntp_rs::ServerConfig = ServerConfig {
            username: Some("user".to_string()),
            allow_insecure_tls: true,
            ..server()
        }
        .into();
        assert_eq!(client.host, "news.example.com");
        assert_eq!(client.port, 563);
        assert!(client.tls);
        assert!(client.allow_insecure_tls);
        assert_eq!(client.username, "user");
        assert_eq!(client.password, "");
    }

    #[test]
    fn validate_rejects_bad_file_count_regex() {
        let mut config = Config {
            servers: vec![server()],
            ..Default::default()
        };
        config.ingest.ignore_file_count.push(FileCountException {
            group: "alt.binaries.test".to_string(),
            subject_regex: "([unclosed".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn repair_range_span_is_a_quarter_of_the_chunk() {
        let ingest = IngestConfig {
            max_messages_per_request: 20_000,
            ..Default::default()
        };
        assert_eq!(ingest.repair_range_span(), 5_000);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Config {
            servers: vec![server()],
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.servers[0].host, "news.example.com");
        assert_eq!(back.servers[0].timeout, Duration::from_secs(5));
        assert_eq!(back.ingest.cache_ttl, Duration::from_secs(600));
    }
}
