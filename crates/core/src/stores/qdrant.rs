use crate::error::IndexError;
use crate::models::{IndexHit, Metadata, MetadataFilter, StoredChunk, VectorIndexEntry};
use crate::traits::VectorIndex;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

const SCROLL_PAGE_SIZE: usize = 256;

/// Qdrant collection accessed over its REST API.
pub struct QdrantIndex {
    endpoint: Url,
    collection: String,
    client: Client,
    vector_size: usize,
}

impl QdrantIndex {
    pub fn new(
        endpoint: &str,
        collection: impl Into<String>,
        vector_size: usize,
    ) -> Result<Self, IndexError> {
        let mut endpoint = Url::parse(endpoint)?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        Ok(Self {
            endpoint,
            collection: collection.into(),
            client: Client::new(),
            vector_size,
        })
    }

    /// Creates the collection with cosine distance if it does not exist and
    /// checks the vector size of an existing one.
    pub async fn ensure_collection(&self) -> Result<(), IndexError> {
        let url = self.collection_url("")?;
        let response = self.client.get(url.clone()).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            let response = self
                .client
                .put(url)
                .json(&json!({
                    "vectors": { "size": self.vector_size, "distance": "Cosine" }
                }))
                .send()
                .await?;
            check_status(response.status())?;
            info!(collection = %self.collection, size = self.vector_size, "created qdrant collection");
            return Ok(());
        }

        check_status(response.status())?;
        let parsed: Value = response.json().await?;
        let existing = parsed
            .pointer("/result/config/params/vectors/size")
            .and_then(Value::as_u64)
            .and_then(|size| usize::try_from(size).ok());
        match existing {
            Some(size) if size == self.vector_size => Ok(()),
            Some(size) => Err(IndexError::DimensionMismatch {
                expected: self.vector_size,
                actual: size,
            }),
            None => Err(IndexError::BackendResponse {
                backend: "qdrant".to_string(),
                details: "collection info has no vector size".to_string(),
            }),
        }
    }

    fn collection_url(&self, suffix: &str) -> Result<Url, IndexError> {
        let path = format!("collections/{}{}", self.collection, suffix);
        Ok(self.endpoint.join(&path)?)
    }

    fn check_dimension(&self, actual: usize) -> Result<(), IndexError> {
        if actual != self.vector_size {
            return Err(IndexError::DimensionMismatch {
                expected: self.vector_size,
                actual,
            });
        }
        Ok(())
    }

    async fn post(&self, suffix: &str, body: Value) -> Result<Value, IndexError> {
        let response = self
            .client
            .post(self.collection_url(suffix)?)
            .json(&body)
            .send()
            .await?;
        check_status(response.status())?;
        Ok(response.json().await?)
    }
}

fn check_status(status: StatusCode) -> Result<(), IndexError> {
    if status.is_success() {
        return Ok(());
    }
    Err(IndexError::BackendResponse {
        backend: "qdrant".to_string(),
        details: status.to_string(),
    })
}

/// Qdrant only accepts integer or UUID point ids, so chunk ids are hashed
/// into a stable UUID and the original id travels in the payload.
pub fn point_id(chunk_id: &str) -> Uuid {
    let digest = Sha256::digest(chunk_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

fn point(entry: &VectorIndexEntry) -> Value {
    json!({
        "id": point_id(&entry.chunk_id).to_string(),
        "vector": entry.vector,
        "payload": {
            "chunk_id": entry.chunk_id,
            "document_id": entry.document_id,
            "sequence_index": entry.sequence_index,
            "text": entry.text,
            "token_count": entry.token_count,
            "metadata": entry.metadata,
        },
    })
}

fn filter_body(filter: &MetadataFilter) -> Value {
    let must: Vec<Value> = filter
        .equals
        .iter()
        .map(|(key, value)| {
            json!({
                "key": format!("metadata.{key}"),
                "match": { "value": value },
            })
        })
        .collect();
    json!({ "must": must })
}

fn parse_hit(hit: &Value) -> Result<IndexHit, IndexError> {
    let payload = hit
        .get("payload")
        .ok_or_else(|| IndexError::BackendResponse {
            backend: "qdrant".to_string(),
            details: "search hit without payload".to_string(),
        })?;
    let text_field = |name: &str| {
        payload
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let metadata: Metadata = match payload.get("metadata") {
        Some(value) => serde_json::from_value(value.clone())?,
        None => Metadata::new(),
    };

    Ok(IndexHit {
        chunk_id: text_field("chunk_id"),
        document_id: text_field("document_id"),
        sequence_index: payload
            .get("sequence_index")
            .and_then(Value::as_u64)
            .unwrap_or_default(),
        score: hit.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32,
        text: text_field("text"),
        token_count: payload
            .get("token_count")
            .and_then(Value::as_u64)
            .and_then(|count| usize::try_from(count).ok())
            .unwrap_or_default(),
        metadata,
    })
}

fn parse_stored(point: &Value) -> Result<StoredChunk, IndexError> {
    let chunk_id = point
        .pointer("/payload/chunk_id")
        .and_then(Value::as_str)
        .ok_or_else(|| IndexError::BackendResponse {
            backend: "qdrant".to_string(),
            details: "scrolled point without chunk_id".to_string(),
        })?;
    let metadata: Metadata = match point.pointer("/payload/metadata") {
        Some(value) => serde_json::from_value(value.clone())?,
        None => Metadata::new(),
    };
    Ok(StoredChunk {
        chunk_id: chunk_id.to_string(),
        metadata,
    })
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn backend(&self) -> &str {
        "qdrant"
    }

    fn dimension(&self) -> usize {
        self.vector_size
    }

    async fn upsert(&self, entries: Vec<VectorIndexEntry>) -> Result<(), IndexError> {
        if entries.is_empty() {
            return Ok(());
        }
        for entry in &entries {
            self.check_dimension(entry.vector.len())?;
        }

        let points: Vec<Value> = entries.iter().map(point).collect();
        let response = self
            .client
            .put(self.collection_url("/points?wait=true")?)
            .json(&json!({ "points": points }))
            .send()
            .await?;
        check_status(response.status())?;
        debug!(collection = %self.collection, count = entries.len(), "upserted qdrant points");
        Ok(())
    }

    async fn delete(&self, chunk_ids: &[String]) -> Result<(), IndexError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let points: Vec<String> = chunk_ids
            .iter()
            .map(|chunk_id| point_id(chunk_id).to_string())
            .collect();
        self.post("/points/delete?wait=true", json!({ "points": points }))
            .await?;
        debug!(collection = %self.collection, count = chunk_ids.len(), "deleted qdrant points");
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>, IndexError> {
        self.check_dimension(vector.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut body = json!({
            "vector": vector,
            "limit": k,
            "with_payload": true,
        });
        if let Some(filter) = filter.filter(|filter| !filter.is_empty()) {
            body["filter"] = filter_body(filter);
        }

        let parsed = self.post("/points/search", body).await?;
        let mut hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .map(|hits| hits.iter().map(parse_hit).collect::<Result<Vec<_>, _>>())
            .transpose()?
            .unwrap_or_default();

        hits.sort_by(IndexHit::ranking_cmp);
        hits.truncate(k);
        Ok(hits)
    }

    async fn len(&self) -> Result<usize, IndexError> {
        let parsed = self.post("/points/count", json!({ "exact": true })).await?;
        parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .and_then(|count| usize::try_from(count).ok())
            .ok_or_else(|| IndexError::BackendResponse {
                backend: "qdrant".to_string(),
                details: "count response without result".to_string(),
            })
    }

    async fn document_entries(&self, document_id: &str) -> Result<Vec<StoredChunk>, IndexError> {
        let mut stored = Vec::new();
        let mut offset = Value::Null;

        loop {
            let mut body = json!({
                "filter": { "must": [{ "key": "document_id", "match": { "value": document_id } }] },
                "limit": SCROLL_PAGE_SIZE,
                "with_payload": ["chunk_id", "metadata"],
                "with_vector": false,
            });
            if !offset.is_null() {
                body["offset"] = offset.clone();
            }

            let parsed = self.post("/points/scroll", body).await?;
            if let Some(points) = parsed.pointer("/result/points").and_then(Value::as_array) {
                for point in points {
                    stored.push(parse_stored(point)?);
                }
            }

            offset = parsed
                .pointer("/result/next_page_offset")
                .cloned()
                .unwrap_or(Value::Null);
            if offset.is_null() {
                break;
            }
        }

        stored.sort_by(|left, right| left.chunk_id.cmp(&right.chunk_id));
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetadataValue;

    #[test]
    fn point_ids_are_stable_uuids() {
        assert_eq!(point_id("chunk-a"), point_id("chunk-a"));
        assert_ne!(point_id("chunk-a"), point_id("chunk-b"));
    }

    #[test]
    fn filter_targets_nested_metadata() {
        let body = filter_body(&MetadataFilter::new().with("lang", "en"));
        assert_eq!(body["must"][0]["key"], "metadata.lang");
        assert_eq!(body["must"][0]["match"]["value"], "en");
    }

    #[test]
    fn hit_payload_round_trips_entry_fields() {
        let mut metadata = Metadata::new();
        metadata.insert("lang".to_string(), "en".into());
        let entry = VectorIndexEntry {
            chunk_id: "c1".to_string(),
            document_id: "d1".to_string(),
            sequence_index: 4,
            text: "hello".to_string(),
            token_count: 1,
            vector: vec![1.0, 0.0],
            metadata,
        };
        let mut hit = point(&entry);
        hit["score"] = json!(0.75);

        let parsed = parse_hit(&hit).expect("hit");
        assert_eq!(parsed.chunk_id, "c1");
        assert_eq!(parsed.sequence_index, 4);
        assert_eq!(parsed.metadata, entry.metadata);
        assert!((parsed.score - 0.75).abs() < 1e-6);
    }

    #[test]
    fn scrolled_points_keep_chunk_id_and_metadata() {
        let point = json!({
            "id": point_id("c9").to_string(),
            "payload": { "chunk_id": "c9", "metadata": { "content_hash": "abc", "sequence_index": 2 } },
        });
        let stored = parse_stored(&point).expect("stored");
        assert_eq!(stored.chunk_id, "c9");
        assert_eq!(
            stored.metadata["content_hash"],
            MetadataValue::Text("abc".to_string())
        );
        assert_eq!(stored.metadata["sequence_index"], MetadataValue::Integer(2));

        assert!(parse_stored(&json!({ "payload": {} })).is_err());
    }

    #[test]
    fn collection_urls_join_onto_endpoint() {
        let index = QdrantIndex::new("http://localhost:6333/", "docs", 4).expect("index");
        let url = index.collection_url("/points/search").expect("url");
        assert_eq!(url.as_str(), "http://localhost:6333/collections/docs/points/search");
    }

    #[tokio::test]
    async fn mismatched_query_vector_is_rejected_locally() {
        let index = QdrantIndex::new("http://127.0.0.1:9/", "docs", 4).expect("index");
        let error = index.query(&[1.0], 3, None).await.expect_err("dimension");
        assert!(matches!(
            error,
            IndexError::DimensionMismatch { expected: 4, actual: 1 }
        ));
    }
}
