use crate::config::EngineConfig;
use crate::error::IngestError;
use crate::models::{Chunk, Document, Metadata, MetadataValue};
use crate::tokens::token_spans;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::ops::Range;

/// Chunk metadata key holding the content hash of the owning document.
pub const CONTENT_HASH_KEY: &str = "content_hash";

const SENTENCE_END: &str = r#"[.!?]["'”’)\]]*$"#;

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
    /// Fraction of the window searched backwards for a sentence or paragraph break.
    pub boundary_lookback_ratio: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            overlap: 50,
            boundary_lookback_ratio: 0.2,
        }
    }
}

impl From<&EngineConfig> for ChunkingConfig {
    fn from(value: &EngineConfig) -> Self {
        Self {
            chunk_size: value.chunk_size,
            overlap: value.chunk_overlap,
            boundary_lookback_ratio: value.boundary_lookback_ratio,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than chunk_size {}",
                self.overlap, self.chunk_size
            )));
        }
        if !(0.0..1.0).contains(&self.boundary_lookback_ratio) {
            return Err(IngestError::InvalidChunkConfig(format!(
                "boundary_lookback_ratio {} must be in [0, 1)",
                self.boundary_lookback_ratio
            )));
        }
        Ok(())
    }

    fn lookback_tokens(&self) -> usize {
        (self.chunk_size as f64 * self.boundary_lookback_ratio).floor() as usize
    }
}

/// A window of the source text, before it is bound to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextWindow {
    pub bytes: Range<usize>,
    pub token_count: usize,
    pub overlap_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
    sentence_end: Regex,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self {
            config,
            sentence_end: Regex::new(SENTENCE_END)?,
        })
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    /// Splits `text` into overlapping token windows.
    pub fn windows(&self, text: &str) -> Vec<TextWindow> {
        let spans = token_spans(text);
        let total = spans.len();
        let size = self.config.chunk_size;
        let overlap = self.config.overlap;
        let mut windows = Vec::new();

        if total == 0 {
            return windows;
        }

        let mut start = 0usize;
        let mut previous_end = 0usize;

        loop {
            let limit = (start + size).min(total);
            let end = if limit < total {
                self.boundary_end(text, &spans, start, limit).unwrap_or(limit)
            } else {
                total
            };

            windows.push(TextWindow {
                bytes: spans[start].start..spans[end - 1].end,
                token_count: end - start,
                overlap_tokens: previous_end.saturating_sub(start),
            });

            if end == total {
                break;
            }

            previous_end = end;
            start = end - overlap;
        }

        windows
    }

    pub fn chunk(&self, document: &Document, text: &str) -> Vec<Chunk> {
        let mut base = document.metadata.clone();
        base.insert(
            "source_uri".to_string(),
            MetadataValue::Text(document.source_uri.clone()),
        );
        base.insert(
            "format".to_string(),
            MetadataValue::Text(document.format.as_str().to_string()),
        );
        base.insert(
            CONTENT_HASH_KEY.to_string(),
            MetadataValue::Text(document.content_hash.clone()),
        );
        self.build_chunks(&document.id, &base, text)
    }

    fn build_chunks(&self, document_id: &str, base: &Metadata, text: &str) -> Vec<Chunk> {
        self.windows(text)
            .into_iter()
            .enumerate()
            .map(|(index, window)| {
                let sequence_index = index as u64;
                let chunk_text = text[window.bytes.clone()].to_string();
                let mut metadata = base.clone();
                metadata.insert(
                    "document_id".to_string(),
                    MetadataValue::Text(document_id.to_string()),
                );
                metadata.insert("sequence_index".to_string(), sequence_index.into());

                Chunk {
                    id: make_chunk_id(document_id, sequence_index, &chunk_text),
                    document_id: document_id.to_string(),
                    sequence_index,
                    token_count: window.token_count,
                    start_offset: window.bytes.start,
                    end_offset: window.bytes.end,
                    overlap_tokens: window.overlap_tokens,
                    text: chunk_text,
                    metadata,
                }
            })
            .collect()
    }

    /// Latest token boundary in the look-back zone that still lets the next
    /// window advance past the overlap.
    fn boundary_end(
        &self,
        text: &str,
        spans: &[Range<usize>],
        start: usize,
        limit: usize,
    ) -> Option<usize> {
        let lookback = self.config.lookback_tokens();
        let lowest = limit
            .saturating_sub(lookback)
            .max(start + self.config.overlap + 1);

        (lowest..=limit)
            .rev()
            .find(|&end| self.ends_at_boundary(&text[spans[end - 1].clone()]))
    }

    fn ends_at_boundary(&self, token: &str) -> bool {
        let word = token.trim_end();
        let trailing = &token[word.len()..];
        trailing.matches('\n').count() >= 2 || self.sentence_end.is_match(word)
    }
}

/// Splits `text` with the given window settings and default look-back.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, IngestError> {
    let chunker = Chunker::new(ChunkingConfig {
        chunk_size,
        overlap,
        ..ChunkingConfig::default()
    })?;
    Ok(chunker.build_chunks(document_id, &Metadata::new(), text))
}

/// Rebuilds the source text from one document's chunks, dropping each
/// chunk's overlapping prefix.
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|chunk| chunk.sequence_index);

    let mut text = String::new();
    let mut covered_until = 0usize;

    for chunk in ordered {
        let skip = covered_until.saturating_sub(chunk.start_offset);
        if let Some(fresh) = chunk.text.get(skip..) {
            text.push_str(fresh);
        }
        covered_until = covered_until.max(chunk.end_offset);
    }

    text
}

/// Line-ending and non-breaking-space cleanup applied before hashing and
/// chunking. Paragraph breaks are preserved.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\u{a0}', " ")
        .chars()
        .filter(|ch| !ch.is_control() || *ch == '\n' || *ch == '\t')
        .collect()
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk_id(document_id: &str, sequence_index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(sequence_index.to_le_bytes());
    hasher.update(content_hash(text).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::count_tokens;

    fn words(count: usize) -> String {
        (0..count)
            .map(|index| format!("w{index}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn five_hundred_tokens_make_three_overlapping_chunks() {
        let text = words(500);
        let chunks = chunk_text("doc-1", &text, 200, 50).expect("valid config");

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].token_count, 200);
        assert_eq!(chunks[1].overlap_tokens, 50);

        let first_tail: Vec<&str> = chunks[0].text.split_whitespace().skip(150).collect();
        let second_head: Vec<&str> = chunks[1].text.split_whitespace().take(50).collect();
        assert_eq!(first_tail, second_head);
        assert_eq!(second_head[0], "w150");
    }

    #[test]
    fn chunks_inherit_document_metadata_and_hash() {
        let text = words(30);
        let document = Document {
            id: "doc-9".to_string(),
            source_uri: "mem://doc-9.txt".to_string(),
            format: crate::models::DocumentFormat::Text,
            content_hash: content_hash(&text),
            metadata: Metadata::from([("lang".to_string(), MetadataValue::from("en"))]),
            ingested_at: chrono::Utc::now(),
        };
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 10,
            overlap: 2,
            boundary_lookback_ratio: 0.2,
        })
        .expect("valid config");

        let chunks = chunker.chunk(&document, &text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(
                chunk.metadata[CONTENT_HASH_KEY],
                MetadataValue::Text(document.content_hash.clone())
            );
            assert_eq!(chunk.metadata["lang"], MetadataValue::from("en"));
            assert_eq!(
                chunk.metadata["source_uri"],
                MetadataValue::from("mem://doc-9.txt")
            );
        }
    }

    #[test]
    fn chunks_reassemble_to_the_original_text() {
        let text = "Pumps move fluid. They need priming!\n\nValves regulate flow; \
                    some are manual, others automatic. Seals wear out over time? \
                    Inspect them often. Replace worn gaskets promptly and log it.\n"
            .repeat(7);
        let chunks = chunk_text("doc-2", &text, 24, 6).expect("valid config");

        assert!(chunks.len() > 3);
        assert_eq!(reassemble(&chunks), text);
        for chunk in &chunks {
            assert!(chunk.token_count <= 24);
            assert_eq!(count_tokens(&chunk.text), chunk.token_count);
        }
    }

    #[test]
    fn window_prefers_sentence_boundary_in_lookback() {
        let mut text = words(17);
        text.push_str(" end. ");
        text.push_str(&words(30));
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 20,
            overlap: 2,
            boundary_lookback_ratio: 0.2,
        })
        .expect("valid config");

        let windows = chunker.windows(&text);
        assert_eq!(windows[0].token_count, 18);
        assert!(text[windows[0].bytes.clone()].trim_end().ends_with("end."));
    }

    #[test]
    fn window_hard_cuts_without_boundary() {
        let text = words(45);
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 20,
            overlap: 0,
            boundary_lookback_ratio: 0.2,
        })
        .expect("valid config");

        let counts: Vec<usize> = chunker.windows(&text).iter().map(|w| w.token_count).collect();
        assert_eq!(counts, vec![20, 20, 5]);
    }

    #[test]
    fn paragraph_break_counts_as_boundary() {
        let text = format!("{}\n\n{}", words(9), words(20));
        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: 10,
            overlap: 0,
            boundary_lookback_ratio: 0.2,
        })
        .expect("valid config");

        let windows = chunker.windows(&text);
        assert_eq!(windows[0].token_count, 9);
        assert_eq!(reassemble_windows(&text, &windows), text);
    }

    #[test]
    fn heavy_overlap_still_makes_progress() {
        let text = "a. b. c. d. e. f. g. h. i. j. k. l. m. n. o. p.";
        let chunks = chunk_text("doc-3", text, 5, 4).expect("valid config");
        assert_eq!(reassemble(&chunks), text);
        assert!(chunks.windows(2).all(|pair| pair[1].start_offset > pair[0].start_offset));
    }

    #[test]
    fn chunk_ids_are_content_derived() {
        let first = chunk_text("doc-1", "alpha beta gamma", 10, 0).expect("valid config");
        let again = chunk_text("doc-1", "alpha beta gamma", 10, 0).expect("valid config");
        let changed = chunk_text("doc-1", "alpha beta delta", 10, 0).expect("valid config");
        let other_doc = chunk_text("doc-2", "alpha beta gamma", 10, 0).expect("valid config");

        assert_eq!(first[0].id, again[0].id);
        assert_ne!(first[0].id, changed[0].id);
        assert_ne!(first[0].id, other_doc[0].id);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(matches!(
            chunk_text("doc", "text", 0, 0),
            Err(IngestError::InvalidChunkConfig(_))
        ));
        assert!(matches!(
            chunk_text("doc", "text", 10, 10),
            Err(IngestError::InvalidChunkConfig(_))
        ));
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("doc", "", 10, 2).expect("valid config").is_empty());
        assert!(chunk_text("doc", "  \n ", 10, 2).expect("valid config").is_empty());
    }

    #[test]
    fn normalization_keeps_paragraphs() {
        let normalized = normalize_text("one\r\ntwo\u{a0}three\r\n\r\nfour\u{0}");
        assert_eq!(normalized, "one\ntwo three\n\nfour");
    }

    fn reassemble_windows(text: &str, windows: &[TextWindow]) -> String {
        let mut rebuilt = String::new();
        let mut covered = 0usize;
        for window in windows {
            let from = covered.max(window.bytes.start);
            rebuilt.push_str(&text[from..window.bytes.end]);
            covered = window.bytes.end;
        }
        rebuilt
    }
}
