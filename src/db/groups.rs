//! Group registry and watermark operations.

use crate::error::DatabaseError;
use crate::types::GroupId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};

use super::{Database, GroupRow};

const GROUP_COLUMNS: &str = "id, name, active, backfill, backfill_target, first_record, \
     first_record_postdate, last_record, last_record_postdate, last_updated";

impl Database {
    /// Register a group, or re-activate it if it already exists
    pub async fn add_group(&self, name: &str, backfill: bool, backfill_target: u32) -> Result<GroupId> {
        let id: GroupId = sqlx::query_scalar(
            r#"
            INSERT INTO groups (name, active, backfill, backfill_target)
            VALUES (?, 1, ?, ?)
            ON CONFLICT(name) DO UPDATE SET active = 1
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(backfill)
        .bind(backfill_target as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to add group: {}",
                e
            )))
        })?;

        Ok(id)
    }

    /// Get a group by name
    pub async fn get_group(&self, name: &str) -> Result<Option<GroupRow>> {
        let row = sqlx::query_as::<_, GroupRow>(&format!(
            "SELECT {GROUP_COLUMNS} FROM groups WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get group: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Get a group by id
    pub async fn get_group_by_id(&self, id: GroupId) -> Result<Option<GroupRow>> {
        let row = sqlx::query_as::<_, GroupRow>(&format!(
            "SELECT {GROUP_COLUMNS} FROM groups WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get group: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// List every registered group, ordered by name
    pub async fn list_groups(&self) -> Result<Vec<GroupRow>> {
        self.query_groups("1 = 1").await
    }

    /// Groups included in update runs, ordered by name
    pub async fn list_active_groups(&self) -> Result<Vec<GroupRow>> {
        self.query_groups("active = 1").await
    }

    /// Groups included in backfill runs, ordered by name
    pub async fn list_backfill_groups(&self) -> Result<Vec<GroupRow>> {
        self.query_groups("backfill = 1").await
    }

    async fn query_groups(&self, condition: &str) -> Result<Vec<GroupRow>> {
        let rows = sqlx::query_as::<_, GroupRow>(&format!(
            "SELECT {GROUP_COLUMNS} FROM groups WHERE {condition} ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list groups: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// First backfill-enabled group (by name) whose oldest post lies between
    /// `since` and now
    pub async fn next_safe_backfill_group(&self, since: DateTime<Utc>) -> Result<Option<GroupRow>> {
        let row = sqlx::query_as::<_, GroupRow>(&format!(
            r#"
            SELECT {GROUP_COLUMNS} FROM groups
            WHERE backfill = 1
              AND first_record_postdate BETWEEN ? AND ?
            ORDER BY name
            LIMIT 1
            "#
        ))
        .bind(since.timestamp())
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to find safe backfill group: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Move the newest watermark forward.
    ///
    /// The watermark never moves backward; `last_updated` is refreshed either way.
    pub async fn advance_last_record(
        &self,
        id: GroupId,
        last_record: u64,
        postdate: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let last_record = last_record as i64;
        sqlx::query(
            r#"
            UPDATE groups SET
                last_record_postdate = CASE
                    WHEN ? >= last_record THEN COALESCE(?, last_record_postdate)
                    ELSE last_record_postdate
                END,
                last_record = MAX(last_record, ?),
                last_updated = ?
            WHERE id = ?
            "#,
        )
        .bind(last_record)
        .bind(postdate.map(|d| d.timestamp()))
        .bind(last_record)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update last record: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Move the oldest watermark backward (or set it on a never-scanned group).
    ///
    /// The watermark never moves forward.
    pub async fn lower_first_record(
        &self,
        id: GroupId,
        first_record: u64,
        postdate: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let first_record = first_record as i64;
        sqlx::query(
            r#"
            UPDATE groups SET
                first_record_postdate = CASE
                    WHEN first_record = 0 OR ? <= first_record
                        THEN COALESCE(?, first_record_postdate)
                    ELSE first_record_postdate
                END,
                first_record = CASE
                    WHEN first_record = 0 OR ? < first_record THEN ?
                    ELSE first_record
                END,
                last_updated = ?
            WHERE id = ?
            "#,
        )
        .bind(first_record)
        .bind(postdate.map(|d| d.timestamp()))
        .bind(first_record)
        .bind(first_record)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update first record: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Store the post date of the oldest watermark
    pub async fn set_first_record_postdate(&self, id: GroupId, postdate: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE groups SET first_record_postdate = ? WHERE id = ?")
            .bind(postdate.timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to set first record postdate: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Record that the group was looked at without moving any watermark
    pub async fn touch_group(&self, id: GroupId) -> Result<()> {
        sqlx::query("UPDATE groups SET last_updated = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to touch group: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Take a group out of update and backfill runs
    pub async fn disable_group(&self, id: GroupId) -> Result<()> {
        sqlx::query("UPDATE groups SET active = 0, backfill = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to disable group: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Include or exclude a group from update runs
    pub async fn set_group_active(&self, id: GroupId, active: bool) -> Result<()> {
        sqlx::query("UPDATE groups SET active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update group: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Include or exclude a group from backfill runs
    pub async fn set_group_backfill(&self, id: GroupId, backfill: bool) -> Result<()> {
        sqlx::query("UPDATE groups SET backfill = ? WHERE id = ?")
            .bind(backfill)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update group backfill: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Forget both watermarks so the next update starts like a new group
    pub async fn reset_group(&self, id: GroupId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE groups SET
                first_record = 0, first_record_postdate = NULL,
                last_record = 0, last_record_postdate = NULL,
                last_updated = NULL
            WHERE id = ?
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to reset group: {}",
                e
            )))
        })?;

        Ok(())
    }
}
