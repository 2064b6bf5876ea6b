//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::types::TableSet;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqlitePool;
use std::path::Path;

use super::Database;

impl Database {
    /// Create a new database connection
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                )))
            })?;
        }

        // Connect to database with foreign key enforcement and WAL mode
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use std::str::FromStr;
        use std::time::Duration;

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse database path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let db = Self { pool };

        // Run migrations
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        // Create schema version table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        // Check current version
        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?
                .flatten();

        let current_version = current_version.unwrap_or(0);

        // Apply migrations
        if current_version < 1 {
            Self::migrate_v1(&mut conn).await?;
        }
        if current_version < 2 {
            Self::migrate_v2(&mut conn).await?;
        }

        Ok(())
    }

    /// Migration v1: groups and the group-scoped table set
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("Applying database migration v1");

        // Wrap migration in a transaction so partial failures don't leave the DB in a broken state
        Self::begin_migration(conn).await?;

        let result = async {
            Self::create_groups_schema(conn).await?;
            Self::create_table_set(conn, TableSet::Standard).await?;
            Self::record_migration(conn, 1).await?;
            Ok::<(), Error>(())
        }
        .await;

        Self::finish_migration(conn, 1, result).await
    }

    /// Migration v2: multigroup table set, filter rules and multigroup posters
    async fn migrate_v2(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("Applying database migration v2");

        Self::begin_migration(conn).await?;

        let result = async {
            Self::create_table_set(conn, TableSet::MultiGroup).await?;
            Self::create_rules_schema(conn).await?;
            Self::record_migration(conn, 2).await?;
            Ok::<(), Error>(())
        }
        .await;

        Self::finish_migration(conn, 2, result).await
    }

    async fn begin_migration(conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;
        Ok(())
    }

    async fn finish_migration(
        conn: &mut SqliteConnection,
        version: i32,
        result: Result<()>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::MigrationFailed(format!(
                            "Failed to commit migration v{}: {}",
                            version, e
                        )))
                    })?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!("Database migration v{} complete", version);
        Ok(())
    }

    /// Execute one DDL statement, naming `what` on failure
    async fn execute_ddl(conn: &mut SqliteConnection, sql: &str, what: &str) -> Result<()> {
        sqlx::query(sql).execute(&mut *conn).await.map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create {}: {}",
                what, e
            )))
        })?;
        Ok(())
    }

    /// Create groups table
    async fn create_groups_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::execute_ddl(
            conn,
            r#"
            CREATE TABLE groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                active INTEGER NOT NULL DEFAULT 1,
                backfill INTEGER NOT NULL DEFAULT 0,
                backfill_target INTEGER NOT NULL DEFAULT 1,
                first_record INTEGER NOT NULL DEFAULT 0,
                first_record_postdate INTEGER,
                last_record INTEGER NOT NULL DEFAULT 0,
                last_record_postdate INTEGER,
                last_updated INTEGER
            )
            "#,
            "groups table",
        )
        .await?;

        Self::execute_ddl(
            conn,
            "CREATE INDEX idx_groups_active ON groups(active)",
            "groups active index",
        )
        .await
    }

    /// Create the collections/binaries/parts/missed_parts tables of one set
    async fn create_table_set(conn: &mut SqliteConnection, tables: TableSet) -> Result<()> {
        let c = tables.collections();
        let b = tables.binaries();
        let p = tables.parts();
        let m = tables.missed_parts();

        Self::execute_ddl(
            conn,
            &format!(
                r#"
                CREATE TABLE {c} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    subject TEXT NOT NULL,
                    fromname TEXT NOT NULL,
                    date INTEGER NOT NULL,
                    xref TEXT NOT NULL DEFAULT '',
                    group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                    total_files INTEGER NOT NULL DEFAULT 0,
                    collection_hash TEXT NOT NULL UNIQUE,
                    noise TEXT NOT NULL DEFAULT '',
                    date_added INTEGER NOT NULL
                )
                "#
            ),
            &format!("{c} table"),
        )
        .await?;
        Self::execute_ddl(
            conn,
            &format!("CREATE INDEX idx_{c}_group ON {c}(group_id)"),
            &format!("{c} group index"),
        )
        .await?;

        Self::execute_ddl(
            conn,
            &format!(
                r#"
                CREATE TABLE {b} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    binary_hash TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    collection_id INTEGER NOT NULL REFERENCES {c}(id) ON DELETE CASCADE,
                    total_parts INTEGER NOT NULL DEFAULT 0,
                    current_parts INTEGER NOT NULL DEFAULT 0,
                    file_number INTEGER NOT NULL DEFAULT 0,
                    size INTEGER NOT NULL DEFAULT 0
                )
                "#
            ),
            &format!("{b} table"),
        )
        .await?;
        Self::execute_ddl(
            conn,
            &format!("CREATE INDEX idx_{b}_collection ON {b}(collection_id)"),
            &format!("{b} collection index"),
        )
        .await?;

        Self::execute_ddl(
            conn,
            &format!(
                r#"
                CREATE TABLE {p} (
                    binary_id INTEGER NOT NULL REFERENCES {b}(id) ON DELETE CASCADE,
                    number INTEGER NOT NULL,
                    message_id TEXT NOT NULL,
                    part_number INTEGER NOT NULL,
                    size INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (binary_id, number)
                )
                "#
            ),
            &format!("{p} table"),
        )
        .await?;
        Self::execute_ddl(
            conn,
            &format!("CREATE INDEX idx_{p}_number ON {p}(number)"),
            &format!("{p} number index"),
        )
        .await?;

        Self::execute_ddl(
            conn,
            &format!(
                r#"
                CREATE TABLE {m} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    number INTEGER NOT NULL,
                    group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    UNIQUE (group_id, number)
                )
                "#
            ),
            &format!("{m} table"),
        )
        .await
    }

    /// Create filter rule and multigroup poster tables
    async fn create_rules_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::execute_ddl(
            conn,
            r#"
            CREATE TABLE binary_blacklist (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_pattern TEXT NOT NULL,
                regex TEXT NOT NULL,
                field INTEGER NOT NULL DEFAULT 1,
                kind INTEGER NOT NULL DEFAULT 1,
                enabled INTEGER NOT NULL DEFAULT 1,
                description TEXT,
                last_activity INTEGER
            )
            "#,
            "binary_blacklist table",
        )
        .await?;

        Self::execute_ddl(
            conn,
            r#"
            CREATE TABLE multigroup_posters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                poster TEXT NOT NULL UNIQUE
            )
            "#,
            "multigroup_posters table",
        )
        .await
    }

    /// Record a migration version as applied
    async fn record_migration(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to record migration: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Close the database connection
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
