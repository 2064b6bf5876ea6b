//! Black/white list rules and the multigroup poster registry.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{Database, NewRule, RuleRow};

impl Database {
    /// Insert a rule; returns its id
    pub async fn add_rule(&self, rule: &NewRule) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO binary_blacklist (group_pattern, regex, field, kind, enabled, description)
            VALUES (?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(&rule.group_pattern)
        .bind(&rule.regex)
        .bind(rule.field.tag())
        .bind(rule.kind.tag())
        .bind(&rule.description)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to add rule: {}",
                e
            )))
        })?;

        Ok(result.last_insert_rowid())
    }

    /// List rules ordered by id
    pub async fn list_rules(&self, enabled_only: bool) -> Result<Vec<RuleRow>> {
        let rows = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT id, group_pattern, regex, field, kind, enabled, description, last_activity
            FROM binary_blacklist
            WHERE enabled = 1 OR ? = 0
            ORDER BY id
            "#,
        )
        .bind(enabled_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list rules: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Enable or disable a rule
    pub async fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE binary_blacklist SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update rule: {}",
                    e
                )))
            })?;

        if result.rows_affected() == 0 {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "rule {}",
                id
            ))));
        }

        Ok(())
    }

    /// Delete a rule
    pub async fn delete_rule(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM binary_blacklist WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete rule: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Stamp `last_activity` on every rule in `ids` with one statement
    pub async fn touch_rules(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut query_builder = sqlx::QueryBuilder::new("UPDATE binary_blacklist SET last_activity = ");
        query_builder.push_bind(chrono::Utc::now().timestamp());
        query_builder.push(" WHERE id IN (");
        let mut separated = query_builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        query_builder.build().execute(&self.pool).await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update rule activity: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Posters routed to the multigroup table set
    pub async fn list_multigroup_posters(&self) -> Result<Vec<String>> {
        let posters = sqlx::query_scalar("SELECT poster FROM multigroup_posters ORDER BY poster")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list multigroup posters: {}",
                    e
                )))
            })?;

        Ok(posters)
    }

    /// Register a multigroup poster (no-op if already present)
    pub async fn add_multigroup_poster(&self, poster: &str) -> Result<()> {
        sqlx::query("INSERT INTO multigroup_posters (poster) VALUES (?) ON CONFLICT(poster) DO NOTHING")
            .bind(poster)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to add multigroup poster: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Remove a multigroup poster; returns whether it existed
    pub async fn remove_multigroup_poster(&self, poster: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM multigroup_posters WHERE poster = ?")
            .bind(poster)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to remove multigroup poster: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }
}
