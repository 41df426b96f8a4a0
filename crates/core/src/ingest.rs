use crate::error::IngestError;
use crate::models::{DocumentFormat, IngestOutcome};
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Every file under `folder` (recursively) with a loadable extension, sorted.
pub fn discover_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(DocumentFormat::from_extension)
            .is_some();

        if supported {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedSource {
    pub source_uri: String,
    pub reason: String,
}

/// Result of ingesting many sources where one failure does not stop the rest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionReport {
    pub completed: Vec<IngestOutcome>,
    pub skipped: Vec<SkippedSource>,
}

impl IngestionReport {
    pub fn record(&mut self, source_uri: &str, result: Result<IngestOutcome, IngestError>) {
        match result {
            Ok(outcome) => self.completed.push(outcome),
            Err(error) => self.skipped.push(SkippedSource {
                source_uri: source_uri.to_string(),
                reason: error.to_string(),
            }),
        }
    }

    pub fn unchanged(&self) -> usize {
        self.completed.iter().filter(|outcome| outcome.unchanged).count()
    }

    pub fn chunk_count(&self) -> usize {
        self.completed.iter().map(|outcome| outcome.chunk_count).sum()
    }
}
