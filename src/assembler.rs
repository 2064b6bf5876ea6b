//! Collection assembly: turns classified headers into staged
//! collection/binary/part rows and applies them as one transaction.
//!
//! Staging is pure and happens entirely in memory; [`CollectionAssembler::assemble`]
//! then commits the staged chunk once. A conflicting commit is retried once
//! against a fresh transaction; if that fails too, every article number of
//! the chunk is reported as not inserted so the caller can queue it for
//! repair.

use crate::classifier::ClassifiedHeader;
use crate::config::FileCountException;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{GroupId, TableSet};
use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::LazyLock;

/// `[01/10]`, `(1 of 10)`, ` 1-10 ` style file counters inside a subject
static FILE_COUNT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)[\[(\s](\d{1,5})(/|[\s_]of[\s_]|-)(\d{1,5})[\])\s$:]").ok()
});

/// Quoted file names, which differ between files of one collection
static QUOTED_NAME: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r#""[^"]*""#).ok());

/// Stored subject/xref columns are capped at this many characters
const MAX_TEXT_LEN: usize = 255;

/// Name shared by every file of one posting: the base subject with its file
/// counter and quoted file name removed.
pub fn collection_name(base_subject: &str) -> String {
    let mut name = base_subject.to_string();
    if let Some(caps) = FILE_COUNT.as_ref().and_then(|r| r.captures(base_subject))
        && let (Some(file), Some(total)) = (caps.get(1), caps.get(3))
    {
        name.replace_range(file.start()..total.end(), "");
    }
    if let Some(quoted) = QUOTED_NAME.as_ref() {
        name = quoted.replace_all(&name, "").into_owned();
    }
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deduplication key of a collection: sha256 over collection name, owning group
/// (omitted for multigroup collections) and declared file count.
pub fn collection_key(name: &str, group: Option<GroupId>, total_files: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    if let Some(group) = group {
        hasher.update(group.to_string().as_bytes());
    }
    hasher.update(total_files.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Identity of a binary: md5 over base subject, poster and group
pub fn binary_hash(base_subject: &str, from: &str, group: GroupId) -> String {
    let digest = md5::compute(format!("{base_subject}{from}{group}"));
    format!("{digest:x}")
}

fn truncate(text: &str) -> String {
    text.chars().take(MAX_TEXT_LEN).collect()
}

/// A collection row ready to be upserted
#[derive(Clone, Debug, PartialEq)]
pub struct StagedCollection {
    /// [`collection_key`] of the collection
    pub hash: String,
    /// Base subject of the first header seen
    pub subject: String,
    /// Poster of the first header seen
    pub from: String,
    /// Post date of the first header seen (now if unknown)
    pub date: DateTime<Utc>,
    /// Xref of the first header seen
    pub xref: String,
    /// Group the chunk was fetched from
    pub group_id: GroupId,
    /// Declared number of files, 0 if unknown
    pub total_files: u32,
}

/// A binary row ready to be upserted
#[derive(Clone, Debug, PartialEq)]
pub struct StagedBinary {
    /// [`binary_hash`] of the binary
    pub hash: String,
    /// Hash of the owning collection
    pub collection_hash: String,
    /// Base subject
    pub name: String,
    /// Declared number of parts
    pub total_parts: u32,
    /// Index of this file within its collection, 0 if unknown
    pub file_number: u32,
}

/// A part row ready to be inserted
#[derive(Clone, Debug, PartialEq)]
pub struct StagedPart {
    /// Hash of the owning binary
    pub binary_hash: String,
    /// Article number
    pub number: u64,
    /// Message-ID without angle brackets
    pub message_id: String,
    /// Part index from the subject
    pub part_number: u32,
    /// Article size in bytes
    pub size: u64,
}

/// All rows derived from one chunk's headers for one table set
#[derive(Clone, Debug)]
pub struct StagedChunk {
    /// Table set the rows are written to
    pub tables: TableSet,
    /// Distinct collections in first-seen order
    pub collections: Vec<StagedCollection>,
    /// Distinct binaries in first-seen order
    pub binaries: Vec<StagedBinary>,
    /// One part per header, in arrival order
    pub parts: Vec<StagedPart>,
}

impl StagedChunk {
    /// True when nothing was staged
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Article numbers carried by the staged parts
    pub fn article_numbers(&self) -> Vec<u64> {
        self.parts.iter().map(|p| p.number).collect()
    }
}

/// Counts reported by a committed chunk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Collections created or refreshed
    pub collections: usize,
    /// Binaries created or touched
    pub binaries: usize,
    /// Part rows actually inserted (duplicates excluded)
    pub parts_inserted: usize,
}

/// Result of [`CollectionAssembler::assemble`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    /// Counts from the committed transaction
    pub applied: ApplyOutcome,
    /// Article numbers whose rows could not be committed
    pub not_inserted: Vec<u64>,
    /// Commit attempts made: 1, or 2 after a conflict
    pub attempts: u32,
}

/// Builds and commits collection/binary/part rows for one group
pub struct CollectionAssembler {
    group_id: GroupId,
    ignore_file_count: Vec<Regex>,
}

impl CollectionAssembler {
    /// Create an assembler for `group`, keeping only the file-count
    /// exceptions that name this group.
    pub fn new(group_id: GroupId, group: &str, exceptions: &[FileCountException]) -> Result<Self> {
        let ignore_file_count = exceptions
            .iter()
            .filter(|e| e.group == group)
            .map(|e| {
                Regex::new(&e.subject_regex).map_err(|err| Error::Config {
                    message: format!("invalid ignore_file_count regex: {err}"),
                    key: Some("ingest.ignore_file_count".to_string()),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            group_id,
            ignore_file_count,
        })
    }

    /// `(file number, total files)` declared in a base subject, `(0, 0)` when
    /// absent or when the group ignores file counts for this subject.
    pub fn file_count(&self, base_subject: &str) -> (u32, u32) {
        if self.ignore_file_count.iter().any(|r| r.is_match(base_subject)) {
            return (0, 0);
        }
        let Some(caps) = FILE_COUNT.as_ref().and_then(|r| r.captures(base_subject)) else {
            return (0, 0);
        };
        let file = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let total = caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        (file, total)
    }

    /// Derive collection, binary and part rows for `headers`, in arrival order.
    ///
    /// Multigroup collections are keyed without the group id; binaries are
    /// always group-scoped.
    pub fn stage(&self, tables: TableSet, headers: &[ClassifiedHeader]) -> StagedChunk {
        let mut chunk = StagedChunk {
            tables,
            collections: Vec::new(),
            binaries: Vec::new(),
            parts: Vec::with_capacity(headers.len()),
        };
        let mut collections: HashMap<String, usize> = HashMap::new();
        // base subject -> binary hash, per poster
        let mut binaries: HashMap<(String, String), String> = HashMap::new();

        for header in headers {
            let binary_key = (header.base_subject.clone(), header.raw.from.clone());
            let hash = match binaries.get(&binary_key) {
                Some(hash) => hash.clone(),
                None => {
                    let (file_number, total_files) = self.file_count(&header.base_subject);
                    let scope = match tables {
                        TableSet::Standard => Some(self.group_id),
                        TableSet::MultiGroup => None,
                    };
                    let collection_hash =
                        collection_key(&collection_name(&header.base_subject), scope, total_files);
                    if !collections.contains_key(&collection_hash) {
                        collections.insert(collection_hash.clone(), chunk.collections.len());
                        chunk.collections.push(StagedCollection {
                            hash: collection_hash.clone(),
                            subject: truncate(&header.base_subject),
                            from: header.raw.from.clone(),
                            date: header.raw.date.unwrap_or_else(Utc::now),
                            xref: truncate(&header.raw.xref),
                            group_id: self.group_id,
                            total_files,
                        });
                    }

                    let hash = binary_hash(&header.base_subject, &header.raw.from, self.group_id);
                    chunk.binaries.push(StagedBinary {
                        hash: hash.clone(),
                        collection_hash,
                        name: header.base_subject.clone(),
                        total_parts: header.total_parts,
                        file_number,
                    });
                    binaries.insert(binary_key, hash.clone());
                    hash
                }
            };

            chunk.parts.push(StagedPart {
                binary_hash: hash,
                number: header.raw.number,
                message_id: header
                    .raw
                    .message_id
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string(),
                part_number: header.part_number,
                size: header.raw.bytes,
            });
        }

        chunk
    }

    /// Stage and commit `headers` into `tables`.
    ///
    /// Conflicts get exactly one more attempt. Any remaining failure rolls
    /// the whole chunk back and lists every article number in
    /// [`AssemblyReport::not_inserted`]; no error is returned for it.
    pub async fn assemble(
        &self,
        db: &Database,
        tables: TableSet,
        headers: &[ClassifiedHeader],
    ) -> AssemblyReport {
        let chunk = self.stage(tables, headers);
        if chunk.is_empty() {
            return AssemblyReport::default();
        }

        let mut attempts = 1;
        let mut result = db.apply_chunk(&chunk).await;
        if let Err(Error::Database(e)) = &result
            && e.is_conflict()
        {
            tracing::debug!(
                group_id = %self.group_id,
                error = %e,
                "Chunk commit conflicted, retrying once"
            );
            attempts += 1;
            result = db.apply_chunk(&chunk).await;
        }

        match result {
            Ok(applied) => AssemblyReport {
                applied,
                not_inserted: Vec::new(),
                attempts,
            },
            Err(e) => {
                let not_inserted = chunk.article_numbers();
                tracing::warn!(
                    group_id = %self.group_id,
                    tables = ?tables,
                    articles = not_inserted.len(),
                    error = %e,
                    "Failed to commit chunk, articles will be queued for repair"
                );
                AssemblyReport {
                    applied: ApplyOutcome::default(),
                    not_inserted,
                    attempts,
                }
            }
        }
    }
}
