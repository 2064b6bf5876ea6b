//! Error types for usenet-indexer
//!
//! The taxonomy mirrors how failures propagate through an ingestion run:
//! - [`NntpError`] separates transient protocol failures (retried once with
//!   compression disabled) from fatal ones (the group no longer exists)
//! - [`DatabaseError`] flags unique-constraint and lock conflicts so the
//!   assembler can retry a chunk once before queueing it for repair
//! - everything else surfaces through [`Error`]

use thiserror::Error;

/// Result type alias for usenet-indexer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for usenet-indexer
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "servers")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// NNTP protocol or connection error
    #[error("NNTP error: {0}")]
    Nntp(#[from] NntpError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    /// A black/white list rule could not be loaded
    #[error("invalid filter rule {id}: {reason}")]
    InvalidRule {
        /// Database id of the offending rule
        id: i64,
        /// Why the rule was rejected
        reason: String,
    },

    /// Group is not registered locally
    #[error("group not found: {0}")]
    GroupNotFound(String),

    /// The run was cancelled between chunks
    #[error("run cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Unique-constraint race or lock contention while writing a chunk
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

impl DatabaseError {
    /// Classify a raw sqlx error raised while writing a chunk.
    ///
    /// Unique violations and `SQLITE_BUSY`/`SQLITE_LOCKED` become
    /// [`DatabaseError::ConstraintViolation`]; everything else is a plain
    /// query failure.
    pub fn from_write(context: &str, err: sqlx::Error) -> Self {
        let conflict = match &err {
            sqlx::Error::Database(db) => {
                db.is_unique_violation()
                    || matches!(db.code().as_deref(), Some("5") | Some("6") | Some("517"))
            }
            _ => false,
        };
        if conflict {
            DatabaseError::ConstraintViolation(format!("{context}: {err}"))
        } else {
            DatabaseError::QueryFailed(format!("{context}: {err}"))
        }
    }

    /// True for errors worth one more attempt against an empty transaction
    pub fn is_conflict(&self) -> bool {
        matches!(self, DatabaseError::ConstraintViolation(_))
    }
}

/// NNTP protocol errors
#[derive(Debug, Error)]
pub enum NntpError {
    /// Timeout, dropped connection, TLS failure, a corrupt compressed block or a busy server
    #[error("transient failure: {0}")]
    Transient(String),

    /// Server answered 411: the group does not exist (any more)
    #[error("no such newsgroup: {0}")]
    NoSuchGroup(String),

    /// Unexpected response code
    #[error("unexpected response {code}: {message}")]
    Protocol {
        /// NNTP response code
        code: u16,
        /// Response text after the code
        message: String,
    },

    /// Authentication was rejected
    #[error("authentication failed: {0}")]
    AuthFailed(String),
}

impl NntpError {
    /// Build an error from a status line that did not match the expected code.
    ///
    /// 4xx codes that signal a temporary condition are mapped to
    /// [`NntpError::Transient`] so the caller can apply its fallback policy.
    pub fn from_status(code: u16, message: &str) -> Self {
        match code {
            411 => NntpError::NoSuchGroup(message.to_string()),
            400 | 403 | 503 => NntpError::Transient(format!("{code} {message}")),
            481 | 482 | 502 => NntpError::AuthFailed(format!("{code} {message}")),
            _ => NntpError::Protocol {
                code,
                message: message.to_string(),
            },
        }
    }

    /// True when retrying the same request (possibly without compression) may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, NntpError::Transient(_))
    }
}

impl From<nntp_rs::NntpError> for NntpError {
    fn from(err: nntp_rs::NntpError) -> Self {
        use nntp_rs::NntpError as Client;

        let text = err.to_string();
        match err {
            Client::NoSuchGroup(name) => NntpError::NoSuchGroup(name),
            Client::AuthFailed(message) => NntpError::AuthFailed(message),
            Client::Protocol { code, message } => NntpError::from_status(code, &message),
            Client::Io(_)
            | Client::Tls(_)
            | Client::Timeout
            | Client::ConnectionClosed
            | Client::InvalidResponse(_) => NntpError::Transient(text),
            _ => NntpError::Protocol {
                code: 0,
                message: text,
            },
        }
    }
}
