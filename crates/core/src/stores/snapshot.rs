//! JSON Lines snapshot of the exact index. One record per line, each carrying
//! the schema version so a reader can reject files it does not understand.

use crate::error::IndexError;
use crate::models::{Metadata, VectorIndexEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    schema_version: u32,
    chunk_id: String,
    document_id: String,
    sequence_index: u64,
    text: String,
    token_count: usize,
    vector: Vec<f32>,
    #[serde(default)]
    metadata: Metadata,
}

impl SnapshotRecord {
    fn from_entry(entry: &VectorIndexEntry) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            chunk_id: entry.chunk_id.clone(),
            document_id: entry.document_id.clone(),
            sequence_index: entry.sequence_index,
            text: entry.text.clone(),
            token_count: entry.token_count,
            vector: entry.vector.clone(),
            metadata: entry.metadata.clone(),
        }
    }

    fn into_entry(self) -> VectorIndexEntry {
        VectorIndexEntry {
            chunk_id: self.chunk_id,
            document_id: self.document_id,
            sequence_index: self.sequence_index,
            text: self.text,
            token_count: self.token_count,
            vector: self.vector,
            metadata: self.metadata,
        }
    }
}

/// Reads every entry in `path`. A missing file is an empty snapshot.
///
/// Fails on the first record whose version is not [`SNAPSHOT_SCHEMA_VERSION`]
/// or whose vector length differs from `dimension`.
pub fn read_snapshot(path: &Path, dimension: usize) -> Result<Vec<VectorIndexEntry>, IndexError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(snapshot_io(path, source)),
    };

    let mut entries = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| snapshot_io(path, source))?;
        if line.trim().is_empty() {
            continue;
        }
        let line_number = index + 1;

        let raw: Value = serde_json::from_str(&line).map_err(|source| IndexError::SnapshotRecord {
            path: path.to_path_buf(),
            line: line_number,
            source,
        })?;
        let found = raw
            .get("schema_version")
            .and_then(Value::as_u64)
            .and_then(|version| u32::try_from(version).ok())
            .unwrap_or(0);
        if found != SNAPSHOT_SCHEMA_VERSION {
            return Err(IndexError::SnapshotVersion {
                expected: SNAPSHOT_SCHEMA_VERSION,
                found,
            });
        }

        let record: SnapshotRecord =
            serde_json::from_value(raw).map_err(|source| IndexError::SnapshotRecord {
                path: path.to_path_buf(),
                line: line_number,
                source,
            })?;
        if record.vector.len() != dimension {
            return Err(IndexError::DimensionMismatch {
                expected: dimension,
                actual: record.vector.len(),
            });
        }
        entries.push(record.into_entry());
    }

    Ok(entries)
}

/// Replaces the snapshot at `path` with `entries`, ordered by chunk id.
///
/// Written to a sibling temp file first and renamed over the target, so a
/// reader never sees a half-written snapshot.
pub fn write_snapshot<'a, I>(path: &Path, entries: I) -> Result<(), IndexError>
where
    I: IntoIterator<Item = &'a VectorIndexEntry>,
{
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| snapshot_io(parent, source))?;
    }

    let mut records: Vec<SnapshotRecord> = entries.into_iter().map(SnapshotRecord::from_entry).collect();
    records.sort_by(|left, right| left.chunk_id.cmp(&right.chunk_id));

    let temp_path = temp_path_for(path);
    {
        let file = fs::File::create(&temp_path).map_err(|source| snapshot_io(&temp_path, source))?;
        let mut writer = BufWriter::new(file);
        for record in &records {
            serde_json::to_writer(&mut writer, record)?;
            writer
                .write_all(b"\n")
                .map_err(|source| snapshot_io(&temp_path, source))?;
        }
        writer
            .flush()
            .map_err(|source| snapshot_io(&temp_path, source))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|source| snapshot_io(&temp_path, source))?;
    }

    fs::rename(&temp_path, path).map_err(|source| snapshot_io(path, source))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn snapshot_io(path: &Path, source: std::io::Error) -> IndexError {
    IndexError::Snapshot {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(chunk_id: &str, vector: Vec<f32>) -> VectorIndexEntry {
        let mut metadata = Metadata::new();
        metadata.insert("lang".to_string(), "en".into());
        VectorIndexEntry {
            chunk_id: chunk_id.to_string(),
            document_id: "doc".to_string(),
            sequence_index: 0,
            text: format!("text of {chunk_id}"),
            token_count: 3,
            vector,
            metadata,
        }
    }

    #[test]
    fn missing_snapshot_reads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entries = read_snapshot(&dir.path().join("absent.jsonl"), 2).expect("empty snapshot");
        assert!(entries.is_empty());
    }

    #[test]
    fn written_snapshot_is_sorted_and_readable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("index.jsonl");
        let entries = vec![entry("b", vec![0.0, 1.0]), entry("a", vec![1.0, 0.0])];

        write_snapshot(&path, &entries).expect("write");
        let loaded = read_snapshot(&path, 2).expect("read");

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].chunk_id, "a");
        assert_eq!(loaded[1], entries[0]);
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("index.jsonl");
        fs::write(
            &path,
            r#"{"schema_version":7,"chunk_id":"a","document_id":"d","sequence_index":0,"text":"t","token_count":1,"vector":[1.0]}"#,
        )
        .expect("write fixture");

        let error = read_snapshot(&path, 1).expect_err("future version");
        assert!(matches!(
            error,
            IndexError::SnapshotVersion { expected: 1, found: 7 }
        ));
    }

    #[test]
    fn dimension_is_checked_on_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("index.jsonl");
        write_snapshot(&path, &[entry("a", vec![1.0, 0.0, 0.0])]).expect("write");

        let error = read_snapshot(&path, 2).expect_err("wrong dimension");
        assert!(matches!(
            error,
            IndexError::DimensionMismatch { expected: 2, actual: 3 }
        ));
    }

    #[test]
    fn malformed_line_reports_its_position() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("index.jsonl");
        fs::write(&path, "\n{not json}\n").expect("write fixture");

        let error = read_snapshot(&path, 1).expect_err("malformed");
        assert!(matches!(error, IndexError::SnapshotRecord { line: 2, .. }));
    }
}
