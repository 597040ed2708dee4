//! `LayoutCache` — small synchronous `(file, chunkSize) -> LayoutRecord`
//! map.
//!
//! `get`/`put` must be O(1) and never touch the network; a `sled::Tree`
//! read is a local mmap'd lookup, satisfying that without pulling in a
//! second storage mechanism for what is otherwise a `localStorage`-shaped
//! map.

use std::sync::Arc;

use tracing::warn;

use crate::model::LayoutRecord;

fn key(file: &str, chunk_size: u64) -> String {
    format!("voxel-grid-shape_{file}_{chunk_size}")
}

pub struct LayoutCache {
    tree: sled::Tree,
}

impl LayoutCache {
    pub fn open(db: &sled::Db) -> sled::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            tree: db.open_tree("layout")?,
        }))
    }

    /// O(1), no network.
    pub fn get(&self, file: &str, chunk_size: u64) -> Option<LayoutRecord> {
        match self.tree.get(key(file, chunk_size)) {
            Ok(Some(raw)) => serde_json::from_slice(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, file, "layout cache read failed, treating as miss");
                None
            }
        }
    }

    pub fn put(&self, file: &str, chunk_size: u64, record: &LayoutRecord) {
        let Ok(encoded) = serde_json::to_vec(record) else {
            warn!(file, "failed to encode layout record, dropping write");
            return;
        };
        if let Err(e) = self.tree.insert(key(file, chunk_size), encoded) {
            warn!(error = %e, file, "layout cache write failed");
        }
    }

    pub fn delete_by_file(&self, file: &str) {
        let prefix = format!("voxel-grid-shape_{file}_");
        let keys: Vec<_> = self
            .tree
            .scan_prefix(prefix.as_bytes())
            .filter_map(|r| r.ok().map(|(k, _)| k))
            .collect();
        for k in keys {
            let _ = self.tree.remove(k);
        }
    }

    pub fn clear_all(&self) {
        let _ = self.tree.clear();
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
