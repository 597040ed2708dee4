//! `PreprocessService`: validate, call a collaborator, fire a background
//! unit of work, return immediately. The background parse job is launched
//! with `crate::task::spawn_named`, the same helper used to name every
//! spawned background task.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::PreprocessError;
use crate::model::{PreprocessResponse, Shape, chunk_descriptors};
use crate::server::field_parser::FieldParser;
use crate::server::task_registry::TaskRegistry;
use crate::task::spawn_named;

/// File extensions the server knows how to hand to `FieldParser`.
const SUPPORTED_EXTENSIONS: &[&str] = &["rawgrid", "bin"];

fn mtime_unix(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct PreprocessService {
    data_root: PathBuf,
    registry: Arc<TaskRegistry>,
    parser: Arc<dyn FieldParser>,
    task_ttl: Duration,
}

impl PreprocessService {
    pub fn new(
        data_root: PathBuf,
        registry: Arc<TaskRegistry>,
        parser: Arc<dyn FieldParser>,
        task_ttl: Duration,
    ) -> Self {
        Self {
            data_root,
            registry,
            parser,
            task_ttl,
        }
    }

    /// Resolves `file` under `data_root`, guarding against escaping it via
    /// `..` components.
    fn resolve(&self, file: &str) -> Result<PathBuf, PreprocessError> {
        if file.is_empty() {
            return Err(PreprocessError::Validation("file must not be empty".into()));
        }
        let requested = Path::new(file);
        if requested.is_absolute() || requested.components().any(|c| c.as_os_str() == "..") {
            return Err(PreprocessError::Validation(format!(
                "file path must be relative and within the data root: {file}"
            )));
        }
        let extension = requested
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match extension {
            Some(ext) if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) => {}
            _ => return Err(PreprocessError::UnknownFile(file.to_string())),
        }
        Ok(self.data_root.join(requested))
    }

    /// Cheap `(file_size, file_mtime_unix)` lookup with no task registry
    /// side effect, for `DataSource::revalidate`'s `StalenessPolicy::Strict`
    /// check — a `HEAD`-style metadata check rather than a full reprocess.
    pub async fn stat(&self, file: &str) -> Result<(u64, u64), PreprocessError> {
        let path = self.resolve(file)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| PreprocessError::UnknownFile(format!("{file}: {e}")))?;
        Ok((metadata.len(), mtime_unix(&metadata)))
    }

    /// `preprocess(file, chunk_size)`. Returns as soon as the shape is
    /// known; the payload parse continues in the background.
    pub async fn preprocess(
        &self,
        file: &str,
        chunk_size: u64,
    ) -> Result<PreprocessResponse, PreprocessError> {
        if chunk_size == 0 {
            return Err(PreprocessError::Validation(
                "chunk_size must be >= 1".into(),
            ));
        }
        let path = self.resolve(file)?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| PreprocessError::UnknownFile(format!("{file}: {e}")))?;
        let file_size = metadata.len();
        let file_mtime_unix = mtime_unix(&metadata);

        let shape = self.parser.shape_only(&path).await?;
        let data_length = shape.data_length();
        let chunks = chunk_descriptors(data_length, chunk_size);

        let task_id = self.registry.create(
            shape,
            data_length,
            chunk_size,
            chunks.clone(),
            self.task_ttl,
        );

        info!(
            task_id,
            file,
            data_length,
            chunk_count = chunks.len(),
            "preprocess accepted, spawning background parse"
        );
        self.spawn_parse_job(task_id.clone(), path, shape);

        Ok(PreprocessResponse {
            task_id,
            file: file.to_string(),
            file_size,
            file_mtime_unix,
            shape,
            data_length,
            chunk_size,
            chunks,
        })
    }

    /// Fire-and-forget background job: parses the whole file,
    /// slices/encodes each chunk, and fills the registry. Chunk encoding
    /// may run in any order; the registry doesn't need them ordered.
    fn spawn_parse_job(&self, task_id: String, path: PathBuf, expected_shape: Shape) {
        let registry = Arc::clone(&self.registry);
        let parser = Arc::clone(&self.parser);
        spawn_named("voxel-grid-parse", async move {
            let (shape, doubles) = match parser.full(&path).await {
                Ok(v) => v,
                Err(e) => {
                    error!(task_id, error = %e, "background parse failed");
                    registry.fail(&task_id, e.to_string()).await;
                    return;
                }
            };
            if shape != expected_shape {
                let message = format!(
                    "shape changed between preprocess and parse: {expected_shape:?} -> {shape:?}"
                );
                warn!(task_id, message);
                registry.fail(&task_id, message).await;
                return;
            }
            let Some(chunks) = registry.chunks_of(&task_id) else {
                // Task already reaped (TTL or all-consumed) before the parse
                // finished; nothing left to fill.
                return;
            };
            for chunk in chunks {
                let slice = &doubles[chunk.start as usize..chunk.end as usize];
                let mut bytes = Vec::with_capacity(slice.len() * 8);
                for v in slice {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                registry.set_chunk(&task_id, chunk.index as usize, bytes).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::field_parser::RawGridParser;

    async fn write_grid(dir: &Path, name: &str, shape: Shape, values: &[f64]) -> PathBuf {
        let mut bytes = Vec::with_capacity(24 + values.len() * 8);
        bytes.extend_from_slice(&shape.nx.to_le_bytes());
        bytes.extend_from_slice(&shape.ny.to_le_bytes());
        bytes.extend_from_slice(&shape.nz.to_le_bytes());
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let path = dir.join(name);
        tokio::fs::write(&path, bytes).await.unwrap();
        path
    }

    #[tokio::test]
    async fn preprocess_returns_partitioned_chunks_and_fills_registry() {
        let dir = tempfile::tempdir().unwrap();
        let shape = Shape::new(4, 4, 4);
        let values: Vec<f64> = (0..64).map(|i| i as f64).collect();
        write_grid(dir.path(), "grid.rawgrid", shape, &values).await;

        let registry = TaskRegistry::new();
        let service = PreprocessService::new(
            dir.path().to_path_buf(),
            Arc::clone(&registry),
            Arc::new(RawGridParser),
            Duration::from_secs(60),
        );

        let response = service.preprocess("grid.rawgrid", 20).await.unwrap();
        assert_eq!(response.data_length, 64);
        assert_eq!(response.chunks.len(), 4);
        assert_eq!(response.chunks[0].start, 0);
        assert_eq!(response.chunks.last().unwrap().end, 64);

        // Background job needs a beat to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for chunk in &response.chunks {
            match registry.take_chunk(&response.task_id, chunk.index as usize).await {
                crate::server::task_registry::TakeResult::Ready(bytes) => {
                    assert_eq!(bytes.len(), chunk.byte_len() as usize);
                }
                other => panic!("expected Ready, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TaskRegistry::new();
        let service = PreprocessService::new(
            dir.path().to_path_buf(),
            registry,
            Arc::new(RawGridParser),
            Duration::from_secs(60),
        );
        let err = service.preprocess("../etc/passwd.rawgrid", 10).await.unwrap_err();
        assert!(matches!(err, PreprocessError::Validation(_)));
    }

    #[tokio::test]
    async fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TaskRegistry::new();
        let service = PreprocessService::new(
            dir.path().to_path_buf(),
            registry,
            Arc::new(RawGridParser),
            Duration::from_secs(60),
        );
        let err = service.preprocess("grid.exe", 10).await.unwrap_err();
        assert!(matches!(err, PreprocessError::UnknownFile(_)));
    }
}
