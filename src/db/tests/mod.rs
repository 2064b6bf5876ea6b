
use crate::assembler::{CollectionAssembler, StagedChunk};
use crate::classifier::ClassifiedHeader;
use crate::db::Database;
use crate::nntp::RawHeader;
use crate::types::{GroupId, TableSet};
use tempfile::NamedTempFile;

/// Fresh database in a temp file; keep the file alive for the test's duration
pub(super) async fn test_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}

pub(super) fn header(number: u64, base: &str, part: u32, total: u32, from: &str) -> ClassifiedHeader {
    ClassifiedHeader {
        raw: RawHeader {
            number,
            subject: format!("{base} ({part}/{total})"),
            from: from.to_string(),
            date: chrono::DateTime::from_timestamp(1_400_000_000 + number as i64, 0),
            message_id: format!("<{number}@example.com>"),
            bytes: 1_000,
            xref: format!("news.example.com alt.binaries.test:{number}"),
        },
        base_subject: base.to_string(),
        part_number: part,
        total_parts: total,
        destination: TableSet::Standard,
    }
}

pub(super) fn stage(group: GroupId, tables: TableSet, headers: &[ClassifiedHeader]) -> StagedChunk {
    CollectionAssembler::new(group, "alt.binaries.test", &[])
        .unwrap()
        .stage(tables, headers)
}
