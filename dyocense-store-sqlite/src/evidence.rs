// dyocense-store-sqlite/src/evidence.rs
// ============================================================================
// Module: Filesystem Evidence Store
// Description: Content-addressed durable sink for provenance graphs/blobs.
// Purpose: Persist evidence write-once, content-addressed, and readable
//          without the writer's cooperation.
// Dependencies: dyocense-core
// ============================================================================

//! ## Overview
//! [`FsEvidenceStore`] shards content-addressed files two hex characters
//! deep under its root directory, the conventional layout for a
//! filesystem object store. A write first lands in a sibling temp file and
//! is then renamed into place, so a reader never observes a partially
//! written object; writes are otherwise idempotent since the filename is
//! the content's own hash.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use dyocense_core::evidence::EvidenceGraph;
use dyocense_core::evidence::EvidenceStore;
use dyocense_core::evidence::EvidenceStoreError;
use dyocense_core::fingerprint::DEFAULT_HASH_ALGORITHM;
use dyocense_core::fingerprint::canonical_json_bytes;
use dyocense_core::fingerprint::hash_bytes;
use dyocense_core::identifiers::ContentRef;

use crate::connection::validate_store_path;
use crate::error::SqliteStoreError;

// ============================================================================
// SECTION: Config
// ============================================================================

/// Configuration for the filesystem evidence store.
#[derive(Debug, Clone)]
pub struct FsEvidenceStoreConfig {
    /// Root directory objects are sharded beneath.
    pub root_path: PathBuf,
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// Content-addressed filesystem sink for evidence graphs and blobs.
#[derive(Debug, Clone)]
pub struct FsEvidenceStore {
    /// Root directory objects are sharded beneath.
    root_path: PathBuf,
}

impl FsEvidenceStore {
    /// Opens (creating if absent) a filesystem evidence store rooted at
    /// `config.root_path`.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the root path is invalid or cannot
    /// be created.
    pub fn new(config: FsEvidenceStoreConfig) -> Result<Self, SqliteStoreError> {
        validate_store_path(&config.root_path)?;
        fs::create_dir_all(&config.root_path).map_err(|err| SqliteStoreError::Io(err.to_string()))?;
        Ok(Self { root_path: config.root_path })
    }

    /// Writes `bytes` under its content hash, returning the reference.
    fn store_bytes(&self, bytes: &[u8]) -> Result<ContentRef, SqliteStoreError> {
        let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, bytes);
        let destination = object_path(&self.root_path, &digest.value);
        if destination.exists() {
            return Ok(ContentRef::new(digest.value));
        }
        let Some(shard_dir) = destination.parent() else {
            return Err(SqliteStoreError::Io("object path missing shard directory".to_string()));
        };
        fs::create_dir_all(shard_dir).map_err(|err| SqliteStoreError::Io(err.to_string()))?;
        let temp_path = shard_dir.join(format!(".{}.tmp", digest.value));
        fs::write(&temp_path, bytes).map_err(|err| SqliteStoreError::Io(err.to_string()))?;
        fs::rename(&temp_path, &destination).map_err(|err| SqliteStoreError::Io(err.to_string()))?;
        Ok(ContentRef::new(digest.value))
    }
}

impl EvidenceStore for FsEvidenceStore {
    fn write_graph(&self, graph: &EvidenceGraph) -> Result<ContentRef, EvidenceStoreError> {
        let bytes = canonical_json_bytes(graph)
            .map_err(|err| EvidenceStoreError::InvalidGraph(err.to_string()))?;
        self.store_bytes(&bytes).map_err(|err| EvidenceStoreError::Unavailable(err.to_string()))
    }

    fn put_blob(&self, bytes: &[u8]) -> Result<ContentRef, EvidenceStoreError> {
        self.store_bytes(bytes).map_err(|err| EvidenceStoreError::Unavailable(err.to_string()))
    }
}

/// Builds the two-level sharded path for a hex digest.
fn object_path(root: &Path, hex_digest: &str) -> PathBuf {
    let shard = hex_digest.get(0..2).unwrap_or(hex_digest);
    root.join("objects").join(shard).join(hex_digest)
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::panic,
        clippy::unwrap_used,
        clippy::expect_used,
        reason = "Test fixtures use explicit asserts and unwraps for clarity."
    )]

    use dyocense_core::evidence::EvidenceEdge;
    use dyocense_core::evidence::EvidenceNode;
    use dyocense_core::evidence::NodeKind;
    use dyocense_core::identifiers::EvidenceNodeId;
    use dyocense_core::identifiers::RunId;
    use serde_json::Value;
    use tempfile::TempDir;

    use super::*;

    fn store_in(dir: &TempDir) -> FsEvidenceStore {
        FsEvidenceStore::new(FsEvidenceStoreConfig { root_path: dir.path().join("evidence") })
            .expect("store init")
    }

    fn sample_graph() -> EvidenceGraph {
        EvidenceGraph {
            nodes: vec![EvidenceNode {
                run_id: RunId::new("r1"),
                node_id: EvidenceNodeId::new("goal"),
                kind: NodeKind::Goal,
                content_ref: None,
                attributes: Value::Null,
            }],
            edges: Vec::new(),
        }
    }

    #[test]
    fn writing_the_same_graph_twice_yields_the_same_reference() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        let graph = sample_graph();
        let first = store.write_graph(&graph).expect("write");
        let second = store.write_graph(&graph).expect("write");
        assert_eq!(first, second);
    }

    #[test]
    fn different_graphs_yield_different_references() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        let mut graph = sample_graph();
        let first = store.write_graph(&graph).expect("write");
        graph.edges.push(EvidenceEdge {
            run_id: RunId::new("r1"),
            from: EvidenceNodeId::new("goal"),
            to: EvidenceNodeId::new("goal"),
            kind: dyocense_core::evidence::EdgeKind::DerivedFrom,
        });
        let second = store.write_graph(&graph).expect("write");
        assert_ne!(first, second);
    }

    #[test]
    fn put_blob_is_content_addressed() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        let first = store.put_blob(b"hello").expect("put");
        let second = store.put_blob(b"hello").expect("put");
        assert_eq!(first, second);
        let third = store.put_blob(b"world").expect("put");
        assert_ne!(first, third);
    }

    #[test]
    fn rejects_overlong_path_component() {
        let dir = TempDir::new().expect("tempdir");
        let component = "x".repeat(300);
        let result = FsEvidenceStore::new(FsEvidenceStoreConfig {
            root_path: dir.path().join(component),
        });
        assert!(matches!(result, Err(SqliteStoreError::Invalid(_))));
    }
}
