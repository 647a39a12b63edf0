// dyocense-store-sqlite/tests/evidence_store.rs
// ============================================================================
// Module: Filesystem Evidence Store Integration Tests
// Description: Exercises FsEvidenceStore end to end through its public trait.
// Purpose: Confirm content-addressing and durability across a fresh process.
// ============================================================================

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_docs_in_private_items,
    missing_docs,
    reason = "Integration test fixtures use explicit unwraps/asserts for clarity."
)]

use dyocense_core::evidence::EdgeKind;
use dyocense_core::evidence::EvidenceEdge;
use dyocense_core::evidence::EvidenceGraph;
use dyocense_core::evidence::EvidenceNode;
use dyocense_core::evidence::EvidenceStore;
use dyocense_core::evidence::NodeKind;
use dyocense_core::identifiers::EvidenceNodeId;
use dyocense_core::identifiers::RunId;
use dyocense_store_sqlite::FsEvidenceStore;
use dyocense_store_sqlite::FsEvidenceStoreConfig;
use serde_json::json;
use tempfile::TempDir;

fn sample_graph(run_id: &str) -> EvidenceGraph {
    let goal = EvidenceNode {
        run_id: RunId::new(run_id),
        node_id: EvidenceNodeId::new("goal"),
        kind: NodeKind::Goal,
        content_ref: None,
        attributes: json!({"text": "reduce holding cost"}),
    };
    let plan = EvidenceNode {
        run_id: RunId::new(run_id),
        node_id: EvidenceNodeId::new("plan"),
        kind: NodeKind::Plan,
        content_ref: None,
        attributes: json!({}),
    };
    EvidenceGraph {
        nodes: vec![goal, plan],
        edges: vec![EvidenceEdge {
            run_id: RunId::new(run_id),
            from: EvidenceNodeId::new("plan"),
            to: EvidenceNodeId::new("goal"),
            kind: EdgeKind::DerivedFrom,
        }],
    }
}

#[test]
fn a_graph_written_then_reopened_from_a_fresh_store_handle_is_readable() {
    let dir = TempDir::new().expect("tempdir");
    let config = FsEvidenceStoreConfig { root_path: dir.path().join("evidence") };
    let reference = {
        let store = FsEvidenceStore::new(config.clone()).expect("open store");
        store.write_graph(&sample_graph("run-a")).expect("write graph")
    };
    let reopened = FsEvidenceStore::new(config).expect("reopen store");
    let second_reference = reopened.write_graph(&sample_graph("run-a")).expect("write graph again");
    assert_eq!(reference, second_reference);
}

#[test]
fn blobs_and_graphs_occupy_independent_content_spaces() {
    let dir = TempDir::new().expect("tempdir");
    let store = FsEvidenceStore::new(FsEvidenceStoreConfig { root_path: dir.path().join("evidence") })
        .expect("open store");
    let graph_ref = store.write_graph(&sample_graph("run-b")).expect("write graph");
    let blob_ref = store.put_blob(b"narrative explanation text").expect("put blob");
    assert_ne!(graph_ref, blob_ref);
}
