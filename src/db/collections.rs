//! Collection/binary/part writes and reads.

use crate::assembler::{ApplyOutcome, StagedChunk};
use crate::error::DatabaseError;
use crate::types::{GroupId, TableSet};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::{Sqlite, Transaction};
use std::collections::HashMap;

use super::{BinaryRow, CollectionRow, Database, PartRow};

// SQLite default SQLITE_MAX_VARIABLE_NUMBER is 999.
// Collections bind 9 variables per row, binaries 7, parts 5.
const MAX_COLLECTIONS_PER_BATCH: usize = 110;
const MAX_BINARIES_PER_BATCH: usize = 142;
const MAX_PARTS_PER_BATCH: usize = 199;

fn noise() -> String {
    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl Database {
    /// Apply one staged chunk in a single transaction.
    ///
    /// Collections are upserted (a merge refreshes `date_added` and `noise`,
    /// and appends the xref for multigroup collections), binaries are created
    /// on first sight, parts are inserted with duplicates ignored, and binary
    /// `current_parts`/`size` grow only by the parts that were actually
    /// inserted. Re-applying the same chunk therefore changes nothing but the
    /// merge bookkeeping.
    ///
    /// Nothing is committed on error; conflicts are reported as
    /// [`DatabaseError::ConstraintViolation`].
    pub async fn apply_chunk(&self, chunk: &StagedChunk) -> Result<ApplyOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(DatabaseError::from_write("begin chunk", e)))?;

        let outcome = Self::write_chunk(&mut tx, chunk).await?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(DatabaseError::from_write("commit chunk", e)))?;

        Ok(outcome)
    }

    async fn write_chunk(
        tx: &mut Transaction<'_, Sqlite>,
        chunk: &StagedChunk,
    ) -> Result<ApplyOutcome> {
        let tables = chunk.tables;
        let now = Utc::now().timestamp();

        // Collections
        let merge_xref = match tables {
            TableSet::MultiGroup => "xref = xref || char(10) || excluded.xref,",
            TableSet::Standard => "",
        };
        let mut collection_ids: HashMap<String, i64> = HashMap::new();
        for batch in chunk.collections.chunks(MAX_COLLECTIONS_PER_BATCH) {
            let mut query_builder = sqlx::QueryBuilder::<Sqlite>::new(format!(
                "INSERT INTO {} (subject, fromname, date, xref, group_id, total_files, \
                 collection_hash, noise, date_added) ",
                tables.collections()
            ));
            query_builder.push_values(batch, |mut b, c| {
                b.push_bind(&c.subject)
                    .push_bind(&c.from)
                    .push_bind(c.date.timestamp())
                    .push_bind(&c.xref)
                    .push_bind(c.group_id)
                    .push_bind(c.total_files as i64)
                    .push_bind(&c.hash)
                    .push_bind(noise())
                    .push_bind(now);
            });
            query_builder.push(format!(
                " ON CONFLICT(collection_hash) DO UPDATE SET {merge_xref} \
                 date_added = excluded.date_added, noise = excluded.noise \
                 RETURNING id, collection_hash"
            ));

            let rows: Vec<(i64, String)> = query_builder
                .build_query_as()
                .fetch_all(&mut **tx)
                .await
                .map_err(|e| Error::Database(DatabaseError::from_write("upsert collections", e)))?;
            collection_ids.extend(rows.into_iter().map(|(id, hash)| (hash, id)));
        }

        // Binaries: make sure every row exists and learn its id. The no-op
        // update lets RETURNING report rows that were already there.
        let mut binary_ids: HashMap<String, i64> = HashMap::new();
        for batch in chunk.binaries.chunks(MAX_BINARIES_PER_BATCH) {
            let mut query_builder = sqlx::QueryBuilder::<Sqlite>::new(format!(
                "INSERT INTO {} (binary_hash, name, collection_id, total_parts, current_parts, \
                 file_number, size) ",
                tables.binaries()
            ));
            let mut missing_collection = None;
            query_builder.push_values(batch, |mut b, binary| {
                let collection_id = match collection_ids.get(&binary.collection_hash) {
                    Some(id) => *id,
                    None => {
                        missing_collection = Some(binary.collection_hash.clone());
                        0
                    }
                };
                b.push_bind(&binary.hash)
                    .push_bind(&binary.name)
                    .push_bind(collection_id)
                    .push_bind(binary.total_parts as i64)
                    .push_bind(0_i64)
                    .push_bind(binary.file_number as i64)
                    .push_bind(0_i64);
            });
            if let Some(hash) = missing_collection {
                return Err(Error::Database(DatabaseError::QueryFailed(format!(
                    "Staged binary references unknown collection {hash}"
                ))));
            }
            query_builder.push(
                " ON CONFLICT(binary_hash) DO UPDATE SET binary_hash = excluded.binary_hash \
                 RETURNING id, binary_hash",
            );

            let rows: Vec<(i64, String)> = query_builder
                .build_query_as()
                .fetch_all(&mut **tx)
                .await
                .map_err(|e| Error::Database(DatabaseError::from_write("upsert binaries", e)))?;
            binary_ids.extend(rows.into_iter().map(|(id, hash)| (hash, id)));
        }

        // Parts: duplicates are ignored; RETURNING yields only new rows.
        let mut deltas: HashMap<i64, (i64, i64)> = HashMap::new();
        let mut parts_inserted = 0;
        for batch in chunk.parts.chunks(MAX_PARTS_PER_BATCH) {
            let mut query_builder = sqlx::QueryBuilder::<Sqlite>::new(format!(
                "INSERT INTO {} (binary_id, number, message_id, part_number, size) ",
                tables.parts()
            ));
            let mut missing_binary = None;
            query_builder.push_values(batch, |mut b, part| {
                let binary_id = match binary_ids.get(&part.binary_hash) {
                    Some(id) => *id,
                    None => {
                        missing_binary = Some(part.binary_hash.clone());
                        0
                    }
                };
                b.push_bind(binary_id)
                    .push_bind(part.number as i64)
                    .push_bind(&part.message_id)
                    .push_bind(part.part_number as i64)
                    .push_bind(part.size as i64);
            });
            if let Some(hash) = missing_binary {
                return Err(Error::Database(DatabaseError::QueryFailed(format!(
                    "Staged part references unknown binary {hash}"
                ))));
            }
            query_builder.push(" ON CONFLICT(binary_id, number) DO NOTHING RETURNING binary_id, size");

            let rows: Vec<(i64, i64)> = query_builder
                .build_query_as()
                .fetch_all(&mut **tx)
                .await
                .map_err(|e| Error::Database(DatabaseError::from_write("insert parts", e)))?;
            parts_inserted += rows.len();
            for (binary_id, size) in rows {
                let entry = deltas.entry(binary_id).or_default();
                entry.0 += 1;
                entry.1 += size;
            }
        }

        // Binary counters: one atomic add per binary, never read-modify-write.
        let updates: Vec<_> = chunk
            .binaries
            .iter()
            .filter_map(|binary| {
                let id = binary_ids.get(&binary.hash)?;
                let (parts, size) = deltas.get(id)?;
                let collection_id = collection_ids.get(&binary.collection_hash)?;
                Some((binary, *collection_id, *parts, *size))
            })
            .collect();
        for batch in updates.chunks(MAX_BINARIES_PER_BATCH) {
            let mut query_builder = sqlx::QueryBuilder::<Sqlite>::new(format!(
                "INSERT INTO {} (binary_hash, name, collection_id, total_parts, current_parts, \
                 file_number, size) ",
                tables.binaries()
            ));
            query_builder.push_values(batch, |mut b, (binary, collection_id, parts, size)| {
                b.push_bind(&binary.hash)
                    .push_bind(&binary.name)
                    .push_bind(*collection_id)
                    .push_bind(binary.total_parts as i64)
                    .push_bind(*parts)
                    .push_bind(binary.file_number as i64)
                    .push_bind(*size);
            });
            query_builder.push(
                " ON CONFLICT(binary_hash) DO UPDATE SET \
                 current_parts = current_parts + excluded.current_parts, \
                 size = size + excluded.size",
            );

            query_builder
                .build()
                .execute(&mut **tx)
                .await
                .map_err(|e| Error::Database(DatabaseError::from_write("update binaries", e)))?;
        }

        Ok(ApplyOutcome {
            collections: collection_ids.len(),
            binaries: binary_ids.len(),
            parts_inserted,
        })
    }

    /// Post date of an already ingested article of `group`, if any
    pub async fn local_postdate(&self, group: GroupId, number: u64) -> Result<Option<DateTime<Utc>>> {
        let date: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT c.date
            FROM collections c
            INNER JOIN binaries b ON b.collection_id = c.id
            INNER JOIN parts p ON p.binary_id = b.id
            WHERE c.group_id = ? AND p.number = ?
            LIMIT 1
            "#,
        )
        .bind(group)
        .bind(number as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to look up local postdate: {}",
                e
            )))
        })?;

        Ok(date.and_then(|ts| DateTime::from_timestamp(ts, 0)))
    }

    /// Collections first seen in `group`, newest first
    pub async fn list_collections(&self, tables: TableSet, group: GroupId) -> Result<Vec<CollectionRow>> {
        let rows = sqlx::query_as::<_, CollectionRow>(&format!(
            r#"
            SELECT id, subject, fromname, date, xref, group_id, total_files,
                   collection_hash, noise, date_added
            FROM {}
            WHERE group_id = ?
            ORDER BY date DESC, id DESC
            "#,
            tables.collections()
        ))
        .bind(group)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list collections: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Binaries of a collection, by file number
    pub async fn list_binaries(&self, tables: TableSet, collection_id: i64) -> Result<Vec<BinaryRow>> {
        let rows = sqlx::query_as::<_, BinaryRow>(&format!(
            r#"
            SELECT id, binary_hash, name, collection_id, total_parts, current_parts,
                   file_number, size
            FROM {}
            WHERE collection_id = ?
            ORDER BY file_number, id
            "#,
            tables.binaries()
        ))
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list binaries: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Look a binary up by its identity hash
    pub async fn get_binary(&self, tables: TableSet, binary_hash: &str) -> Result<Option<BinaryRow>> {
        let row = sqlx::query_as::<_, BinaryRow>(&format!(
            r#"
            SELECT id, binary_hash, name, collection_id, total_parts, current_parts,
                   file_number, size
            FROM {}
            WHERE binary_hash = ?
            "#,
            tables.binaries()
        ))
        .bind(binary_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get binary: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Parts of a binary, by article number
    pub async fn list_parts(&self, tables: TableSet, binary_id: i64) -> Result<Vec<PartRow>> {
        let rows = sqlx::query_as::<_, PartRow>(&format!(
            r#"
            SELECT binary_id, number, message_id, part_number, size
            FROM {}
            WHERE binary_id = ?
            ORDER BY number
            "#,
            tables.parts()
        ))
        .bind(binary_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list parts: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Delete a collection; its binaries and parts go with it
    pub async fn delete_collection(&self, tables: TableSet, collection_id: i64) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE id = ?", tables.collections()))
            .bind(collection_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete collection: {}",
                    e
                )))
            })?;

        Ok(())
    }
}
