//! Missing-article (part repair) queue operations.

use crate::error::DatabaseError;
use crate::types::{GroupId, TableSet};
use crate::{Error, Result};

use super::{Database, MissedPartRow};

// Two bind variables per queued article.
const MAX_MISSING_PER_BATCH: usize = 499;
// One bind variable per number plus the group id.
const MAX_NUMBERS_PER_STATEMENT: usize = 900;

impl Database {
    /// Queue article numbers for repair.
    ///
    /// New entries start at zero attempts; numbers already queued have their
    /// attempt count incremented instead of being duplicated.
    pub async fn add_missing_parts(
        &self,
        tables: TableSet,
        group: GroupId,
        numbers: &[u64],
    ) -> Result<()> {
        if numbers.is_empty() {
            return Ok(());
        }

        for chunk in numbers.chunks(MAX_MISSING_PER_BATCH) {
            let mut query_builder = sqlx::QueryBuilder::new(format!(
                "INSERT INTO {} (number, group_id) ",
                tables.missed_parts()
            ));
            query_builder.push_values(chunk, |mut b, number| {
                b.push_bind(*number as i64).push_bind(group);
            });
            query_builder
                .push(" ON CONFLICT(group_id, number) DO UPDATE SET attempts = attempts + 1");

            query_builder.build().execute(&self.pool).await.map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to queue missing parts: {}",
                    e
                )))
            })?;
        }

        Ok(())
    }

    /// Up to `limit` queued entries below `max_attempts`, lowest number first
    pub async fn missing_parts(
        &self,
        tables: TableSet,
        group: GroupId,
        max_attempts: u32,
        limit: u32,
    ) -> Result<Vec<MissedPartRow>> {
        let rows = sqlx::query_as::<_, MissedPartRow>(&format!(
            r#"
            SELECT id, number, group_id, attempts
            FROM {}
            WHERE group_id = ? AND attempts < ?
            ORDER BY number ASC
            LIMIT ?
            "#,
            tables.missed_parts()
        ))
        .bind(group)
        .bind(max_attempts as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to select missing parts: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Number of queued entries for a group
    pub async fn count_missing_parts(&self, tables: TableSet, group: GroupId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE group_id = ?",
            tables.missed_parts()
        ))
        .bind(group)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to count missing parts: {}",
                e
            )))
        })?;

        Ok(count as u64)
    }

    /// Remove repaired numbers from the queue
    pub async fn remove_missing_parts(
        &self,
        tables: TableSet,
        group: GroupId,
        numbers: &[u64],
    ) -> Result<u64> {
        self.for_numbers(
            &format!("DELETE FROM {} WHERE group_id = ", tables.missed_parts()),
            group,
            numbers,
            "remove repaired parts",
        )
        .await
    }

    /// Count one more attempt for each of `numbers` still queued
    pub async fn increment_missing_attempts(
        &self,
        tables: TableSet,
        group: GroupId,
        numbers: &[u64],
    ) -> Result<u64> {
        self.for_numbers(
            &format!(
                "UPDATE {} SET attempts = attempts + 1 WHERE group_id = ",
                tables.missed_parts()
            ),
            group,
            numbers,
            "increment repair attempts",
        )
        .await
    }

    /// Drop entries that reached `max_attempts`; returns how many were abandoned
    pub async fn delete_abandoned_parts(
        &self,
        tables: TableSet,
        group: GroupId,
        max_attempts: u32,
    ) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE group_id = ? AND attempts >= ?",
            tables.missed_parts()
        ))
        .bind(group)
        .bind(max_attempts as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to delete abandoned parts: {}",
                e
            )))
        })?;

        Ok(result.rows_affected())
    }

    /// Run `<prefix> ? AND number IN (...)` over `numbers` in bind-limited chunks
    async fn for_numbers(
        &self,
        prefix: &str,
        group: GroupId,
        numbers: &[u64],
        what: &str,
    ) -> Result<u64> {
        let mut affected = 0;
        for chunk in numbers.chunks(MAX_NUMBERS_PER_STATEMENT) {
            let mut query_builder = sqlx::QueryBuilder::new(prefix);
            query_builder.push_bind(group);
            query_builder.push(" AND number IN (");
            let mut separated = query_builder.separated(", ");
            for number in chunk {
                separated.push_bind(*number as i64);
            }
            separated.push_unseparated(")");

            let result = query_builder.build().execute(&self.pool).await.map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to {}: {}",
                    what, e
                )))
            })?;
            affected += result.rows_affected();
        }

        Ok(affected)
    }
}
