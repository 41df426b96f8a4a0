pub mod memory;
pub mod qdrant;
pub mod snapshot;

pub use memory::ExactIndex;
pub use qdrant::QdrantIndex;
pub use snapshot::SNAPSHOT_SCHEMA_VERSION;

use crate::config::IndexSettings;
use crate::error::IndexError;
use crate::traits::VectorIndex;
use std::sync::Arc;
use tracing::info;

/// Opens the index backend named in config for vectors of `dimension`.
pub async fn build_index(
    settings: &IndexSettings,
    dimension: usize,
) -> Result<Arc<dyn VectorIndex>, IndexError> {
    let index: Arc<dyn VectorIndex> = match settings {
        IndexSettings::Memory => Arc::new(ExactIndex::new(dimension)),
        IndexSettings::Snapshot { path } => {
            let path = path.clone();
            let opened = tokio::task::spawn_blocking(move || ExactIndex::open(path, dimension))
                .await
                .map_err(|error| IndexError::BackendResponse {
                    backend: "snapshot".to_string(),
                    details: format!("snapshot loader task failed: {error}"),
                })??;
            Arc::new(opened)
        }
        IndexSettings::Qdrant { url, collection } => {
            let index = QdrantIndex::new(url, collection.clone(), dimension)?;
            index.ensure_collection().await?;
            Arc::new(index)
        }
    };
    info!(backend = index.backend(), dimension, "vector index ready");
    Ok(index)
}
