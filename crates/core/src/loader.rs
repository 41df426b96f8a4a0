use crate::error::LoaderError;
use crate::models::{DocumentFormat, Metadata};
use crate::traits::{LoadedDocument, Loader};
use async_trait::async_trait;
use lopdf::Document as PdfDocument;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Stable document id for a source: the hex SHA-256 of its URI.
pub fn generate_document_id(source_uri: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_uri.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Text of every readable page, pages separated by a blank line.
pub fn extract_pdf_text(path: &Path) -> Result<(String, usize), LoaderError> {
    let document =
        PdfDocument::load(path).map_err(|error| LoaderError::Parse(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| LoaderError::Parse(error.to_string()))?;

        if !text.trim().is_empty() {
            pages.push(text);
        }
    }

    if pages.is_empty() {
        return Err(LoaderError::Parse(format!(
            "pdf had no readable page text: {}",
            path.display()
        )));
    }

    let page_count = pages.len();
    Ok((pages.join("\n\n"), page_count))
}

fn source_path(source_uri: &str) -> PathBuf {
    PathBuf::from(source_uri.strip_prefix("file://").unwrap_or(source_uri))
}

fn format_of(path: &Path) -> Result<DocumentFormat, LoaderError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    DocumentFormat::from_extension(extension)
        .ok_or_else(|| LoaderError::UnsupportedFormat(path.display().to_string()))
}

/// Loads local `.txt`, `.md`, and `.pdf` files. `file://` URIs are accepted.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLoader;

impl FileLoader {
    async fn read_text(path: &Path) -> Result<String, LoaderError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| read_error(path, source))?;
        String::from_utf8(bytes)
            .map_err(|error| LoaderError::Parse(format!("{} is not utf-8: {error}", path.display())))
    }

    async fn read_pdf(path: &Path) -> Result<(String, usize), LoaderError> {
        if let Err(source) = tokio::fs::metadata(path).await {
            return Err(read_error(path, source));
        }
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || extract_pdf_text(&owned))
            .await
            .map_err(|error| LoaderError::Parse(format!("pdf extraction task failed: {error}")))?
    }
}

fn read_error(path: &Path, source: std::io::Error) -> LoaderError {
    if source.kind() == std::io::ErrorKind::NotFound {
        LoaderError::NotFound(path.display().to_string())
    } else {
        LoaderError::Read {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl Loader for FileLoader {
    async fn load(&self, source_uri: &str) -> Result<LoadedDocument, LoaderError> {
        let path = source_path(source_uri);
        let format = format_of(&path)?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| LoaderError::MissingFileName(path.display().to_string()))?
            .to_string();

        let mut metadata = Metadata::new();
        metadata.insert("file_name".to_string(), file_name.into());

        let text = match format {
            DocumentFormat::Text | DocumentFormat::Markdown => Self::read_text(&path).await?,
            DocumentFormat::Pdf => {
                let (text, page_count) = Self::read_pdf(&path).await?;
                metadata.insert("page_count".to_string(), (page_count as u64).into());
                text
            }
        };
        debug!(source_uri, %format, bytes = text.len(), "loaded document");

        Ok(LoadedDocument {
            document_id: generate_document_id(source_uri),
            source_uri: source_uri.to_string(),
            format,
            text,
            metadata,
        })
    }
}

/// In-process sources keyed by URI. Useful for embedding the engine and for tests.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    sources: RwLock<HashMap<String, String>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the text behind `source_uri`.
    pub async fn insert(&self, source_uri: impl Into<String>, text: impl Into<String>) {
        self.sources
            .write()
            .await
            .insert(source_uri.into(), text.into());
    }

    pub async fn remove(&self, source_uri: &str) -> bool {
        self.sources.write().await.remove(source_uri).is_some()
    }
}

#[async_trait]
impl Loader for MemoryLoader {
    async fn load(&self, source_uri: &str) -> Result<LoadedDocument, LoaderError> {
        let text = self
            .sources
            .read()
            .await
            .get(source_uri)
            .cloned()
            .ok_or_else(|| LoaderError::NotFound(source_uri.to_string()))?;

        let format = Path::new(source_uri)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(DocumentFormat::from_extension)
            .unwrap_or(DocumentFormat::Text);

        Ok(LoadedDocument {
            document_id: generate_document_id(source_uri),
            source_uri: source_uri.to_string(),
            format,
            text,
            metadata: Metadata::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetadataValue;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn text_and_markdown_files_load() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let notes = dir.path().join("notes.md");
        fs::write(&notes, "# Title\n\nBody text.")?;

        let uri = notes.to_string_lossy().to_string();
        let loaded = FileLoader.load(&uri).await?;

        assert_eq!(loaded.format, DocumentFormat::Markdown);
        assert_eq!(loaded.text, "# Title\n\nBody text.");
        assert_eq!(loaded.document_id, generate_document_id(&uri));
        assert_eq!(
            loaded.metadata.get("file_name"),
            Some(&MetadataValue::Text("notes.md".to_string()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn file_uris_are_accepted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("a.txt");
        fs::write(&path, "plain")?;

        let loaded = FileLoader.load(&format!("file://{}", path.display())).await?;
        assert_eq!(loaded.text, "plain");
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_and_missing_sources_fail() {
        let unsupported = FileLoader.load("/tmp/report.docx").await;
        assert!(matches!(unsupported, Err(LoaderError::UnsupportedFormat(_))));

        let missing = FileLoader.load("/definitely/not/here.txt").await;
        assert!(matches!(missing, Err(LoaderError::NotFound(_))));
    }

    #[tokio::test]
    async fn unreadable_pdf_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        let result = FileLoader.load(&path.to_string_lossy()).await;
        assert!(matches!(result, Err(LoaderError::Parse(_))));
        Ok(())
    }

    #[tokio::test]
    async fn memory_loader_serves_inserted_text() {
        let loader = MemoryLoader::new();
        loader.insert("mem://guide.md", "hello").await;

        let loaded = loader.load("mem://guide.md").await.expect("inserted source");
        assert_eq!(loaded.format, DocumentFormat::Markdown);
        assert_eq!(loaded.text, "hello");

        assert!(loader.remove("mem://guide.md").await);
        assert!(matches!(
            loader.load("mem://guide.md").await,
            Err(LoaderError::NotFound(_))
        ));
    }
}
