//! The `FieldParser` external collaborator: the contract for turning an
//! on-disk file into a flat array of doubles. `RawGridParser` is the one
//! concrete implementation that ships so the server is runnable
//! end-to-end; it stays a thin adapter, not a feature to build out.

use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use crate::model::Shape;

/// Converts a file on disk into `(shape, doubles)`, plus a cheap
/// shape-only mode that avoids reading the payload.
#[async_trait]
pub trait FieldParser: Send + Sync {
    /// Reads just enough of `path` to recover the grid's shape.
    async fn shape_only(&self, path: &Path) -> Result<Shape>;

    /// Reads the full file and decodes it into row-major `f64`s.
    async fn full(&self, path: &Path) -> Result<(Shape, Vec<f64>)>;
}

/// A self-describing little-endian container: a 24-byte header of three
/// `u64`s (`nx`, `ny`, `nz`) followed by `nx*ny*nz` `f64`s in flat
/// `k*nx*ny + j*nx + i` order.
#[derive(Debug, Default)]
pub struct RawGridParser;

const HEADER_LEN: usize = 24;

impl RawGridParser {
    fn decode_header(header: &[u8]) -> Result<Shape> {
        if header.len() < HEADER_LEN {
            bail!("file too short to contain a {HEADER_LEN}-byte shape header");
        }
        let nx = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let ny = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let nz = u64::from_le_bytes(header[16..24].try_into().unwrap());
        if nx == 0 || ny == 0 || nz == 0 {
            bail!("shape dimensions must be non-zero, got ({nx}, {ny}, {nz})");
        }
        Ok(Shape::new(nx, ny, nz))
    }
}

#[async_trait]
impl FieldParser for RawGridParser {
    async fn shape_only(&self, path: &Path) -> Result<Shape> {
        use tokio::io::AsyncReadExt;

        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)
            .await
            .with_context(|| format!("failed to read shape header from {}", path.display()))?;
        Self::decode_header(&header)
    }

    async fn full(&self, path: &Path) -> Result<(Shape, Vec<f64>)> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let shape = Self::decode_header(&bytes)?;
        let expected_len = HEADER_LEN + (shape.data_length() as usize) * 8;
        if bytes.len() != expected_len {
            bail!(
                "file {} has {} bytes, expected {expected_len} for shape {:?}",
                path.display(),
                bytes.len(),
                shape
            );
        }
        let mut doubles = Vec::with_capacity(shape.data_length() as usize);
        for chunk in bytes[HEADER_LEN..].chunks_exact(8) {
            doubles.push(f64::from_le_bytes(chunk.try_into().unwrap()));
        }
        Ok((shape, doubles))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_grid(shape: Shape, values: &[f64]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + values.len() * 8);
        bytes.extend_from_slice(&shape.nx.to_le_bytes());
        bytes.extend_from_slice(&shape.ny.to_le_bytes());
        bytes.extend_from_slice(&shape.nz.to_le_bytes());
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    #[tokio::test]
    async fn round_trips_shape_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.rawgrid");
        let shape = Shape::new(2, 2, 2);
        let values: Vec<f64> = (0..8).map(|i| i as f64 * 1.5).collect();
        tokio::fs::write(&path, encode_grid(shape, &values))
            .await
            .unwrap();

        let parser = RawGridParser;
        assert_eq!(parser.shape_only(&path).await.unwrap(), shape);
        let (got_shape, got_values) = parser.full(&path).await.unwrap();
        assert_eq!(got_shape, shape);
        assert_eq!(got_values, values);
    }

    #[tokio::test]
    async fn rejects_truncated_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.rawgrid");
        let shape = Shape::new(2, 2, 2);
        let mut bytes = encode_grid(shape, &vec![0.0; 8]);
        bytes.truncate(bytes.len() - 8);
        tokio::fs::write(&path, bytes).await.unwrap();

        let parser = RawGridParser;
        assert!(parser.full(&path).await.is_err());
    }
}
