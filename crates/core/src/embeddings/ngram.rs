use super::EmbeddingProvider;
use crate::error::EmbeddingError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;
pub const DEFAULT_NGRAM_SIZE: usize = 3;

/// Hashed character n-gram embedder. Deterministic and offline, which makes
/// it the default provider and the reference provider in tests.
///
/// Text is lowercased and whitespace-collapsed, and each word is padded with
/// a space on both sides so n-grams at word edges differ from inner ones.
/// Words shorter than the n-gram size contribute a single feature.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    dimensions: usize,
    ngram_size: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            ngram_size: DEFAULT_NGRAM_SIZE,
        }
    }

    pub fn with_ngram_size(mut self, ngram_size: usize) -> Self {
        self.ngram_size = ngram_size.max(1);
        self
    }

    pub fn ngram_size(&self) -> usize {
        self.ngram_size
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];

        for word in text.split_whitespace() {
            let padded: Vec<char> = std::iter::once(' ')
                .chain(word.chars().flat_map(char::to_lowercase))
                .chain(std::iter::once(' '))
                .collect();

            if padded.len() <= self.ngram_size {
                self.add_feature(&mut vector, &padded);
                continue;
            }
            for gram in padded.windows(self.ngram_size) {
                self.add_feature(&mut vector, gram);
            }
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            vector.iter_mut().for_each(|value| *value /= magnitude);
        }
        vector
    }

    /// Adds `gram` to a bucket picked from its digest, with a digest-derived
    /// sign so unrelated collisions tend to cancel.
    fn add_feature(&self, vector: &mut [f32], gram: &[char]) {
        let mut hasher = Sha256::new();
        for ch in gram {
            let mut buffer = [0u8; 4];
            hasher.update(ch.encode_utf8(&mut buffer).as_bytes());
        }
        let digest = hasher.finalize();

        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(head) % vector.len() as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
}

#[async_trait]
impl EmbeddingProvider for CharacterNgramEmbedder {
    fn name(&self) -> &str {
        "ngram"
    }

    fn dimension(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{CharacterNgramEmbedder, EmbeddingProvider};
    use crate::embeddings::cosine_similarity;

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("Hydraulic pressure and flow");
        let second = embedder.embed("Hydraulic pressure and flow");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let vector = CharacterNgramEmbedder::new(32).embed("abc");
        assert_eq!(vector.len(), 32);
        assert!(CharacterNgramEmbedder::new(8).embed("   ").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn case_and_spacing_do_not_change_the_vector() {
        let embedder = CharacterNgramEmbedder::new(64);
        assert_eq!(embedder.embed("Pump  Seal\n"), embedder.embed("pump seal"));
    }

    #[test]
    fn related_text_scores_higher_than_unrelated() {
        for size in [3, 4] {
            let embedder = CharacterNgramEmbedder::default().with_ngram_size(size);
            let query = embedder.embed("replacing a lost car key");
            let related = embedder.embed("Lost car keys are replaced by the locksmith.");
            let unrelated = embedder.embed("Quarterly revenue grew in the northern region.");
            assert!(
                cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated),
                "ngram size {size}"
            );
        }
    }

    #[test]
    fn ngram_size_changes_the_features() {
        let trigrams = CharacterNgramEmbedder::new(64);
        let bigrams = CharacterNgramEmbedder::new(64).with_ngram_size(2);
        assert_eq!(bigrams.ngram_size(), 2);
        assert_ne!(trigrams.embed("gasket"), bigrams.embed("gasket"));
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let embedder = CharacterNgramEmbedder::new(16);
        let texts = vec!["first text".to_string(), "second text".to_string()];
        let vectors = embedder.embed_batch(&texts).await.expect("local embedding");
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1], embedder.embed("second text"));
    }
}
