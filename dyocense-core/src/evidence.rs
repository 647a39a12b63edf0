// dyocense-core/src/evidence.rs
// ============================================================================
// Module: Evidence Store & Writer
// Description: Append-only provenance graph plus content-addressed blobs.
// Purpose: Give every run a durable, replayable audit trail.
// Dependencies: crate::{identifiers, fingerprint}, serde_json
// ============================================================================

//! ## Overview
//! Evidence is a labelled DAG: edges point only from a later stage's
//! artifacts to the earlier artifacts they derive from, so cycles are
//! disallowed by construction. The writer batches every stage's output into
//! a single logical write at run terminal and retries transient failures up
//! to five times; a failed evidence write never demotes an otherwise
//! successful run.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::identifiers::ContentRef;
use crate::identifiers::EvidenceNodeId;
use crate::identifiers::RunId;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by an Evidence Store backend.
#[derive(Debug, Error)]
pub enum EvidenceStoreError {
    /// The store is transiently unavailable; the writer should retry.
    #[error("evidence store unavailable: {0}")]
    Unavailable(String),
    /// A write would introduce a cycle or reference a missing node.
    #[error("invalid evidence graph: {0}")]
    InvalidGraph(String),
}

// ============================================================================
// SECTION: Provenance Atoms
// ============================================================================

/// Typed provenance node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// The business goal that started the run.
    Goal,
    /// A governance constraint applied to the run.
    Constraint,
    /// A forecast scenario.
    Scenario,
    /// A single solver invocation.
    SolverRun,
    /// The resulting plan.
    Plan,
    /// One decision/step within the plan.
    Step,
    /// A key performance indicator measured against the plan.
    Kpi,
}

/// Typed provenance edge kind. Every edge points from a later stage's
/// artifact to an earlier artifact it derives from or is measured by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Target node was derived from source node.
    DerivedFrom,
    /// Target node constrains source node.
    Constrains,
    /// Target node optimizes source node.
    Optimizes,
    /// Target node is measured by source node.
    MeasuredBy,
}

/// A single provenance atom, keyed by run id plus a stable node id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceNode {
    /// Run this node belongs to.
    pub run_id: RunId,
    /// Stable id for this node within the run.
    pub node_id: EvidenceNodeId,
    /// Node's provenance type.
    pub kind: NodeKind,
    /// Content reference for the node's payload, if stored out of line.
    pub content_ref: Option<ContentRef>,
    /// Small inline attributes that do not warrant a separate blob.
    pub attributes: Value,
}

/// A directed, typed edge between two [`EvidenceNode`]s in the same run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceEdge {
    /// Run this edge belongs to.
    pub run_id: RunId,
    /// Source node id.
    pub from: EvidenceNodeId,
    /// Target node id.
    pub to: EvidenceNodeId,
    /// Edge's provenance type.
    pub kind: EdgeKind,
}

/// A full provenance write for one run: every node and edge produced across
/// its stages, submitted as a single logical transaction at run terminal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceGraph {
    /// Nodes written by this run.
    pub nodes: Vec<EvidenceNode>,
    /// Edges written by this run.
    pub edges: Vec<EvidenceEdge>,
}

impl EvidenceGraph {
    /// Validates that every edge references a node present in this graph and
    /// that the edge set contains no cycle.
    ///
    /// # Errors
    ///
    /// Returns [`EvidenceStoreError::InvalidGraph`] when an edge references a
    /// missing node or a cycle is detected.
    pub fn validate(&self) -> Result<(), EvidenceStoreError> {
        let known: std::collections::HashSet<&str> =
            self.nodes.iter().map(|node| node.node_id.as_str()).collect();
        for edge in &self.edges {
            if !known.contains(edge.from.as_str()) || !known.contains(edge.to.as_str()) {
                return Err(EvidenceStoreError::InvalidGraph(format!(
                    "edge {} -> {} references an unknown node",
                    edge.from, edge.to
                )));
            }
        }
        if has_cycle(&self.edges) {
            return Err(EvidenceStoreError::InvalidGraph("cycle detected in evidence graph".to_string()));
        }
        Ok(())
    }
}

fn has_cycle(edges: &[EvidenceEdge]) -> bool {
    use std::collections::HashMap;
    use std::collections::HashSet;

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut on_stack: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
    ) -> bool {
        if on_stack.contains(node) {
            return true;
        }
        if visited.contains(node) {
            return false;
        }
        visited.insert(node);
        on_stack.insert(node);
        if let Some(neighbors) = adjacency.get(node) {
            for neighbor in neighbors {
                if visit(neighbor, adjacency, visited, on_stack) {
                    return true;
                }
            }
        }
        on_stack.remove(node);
        false
    }

    adjacency.keys().any(|node| visit(node, &adjacency, &mut visited, &mut on_stack))
}

// ============================================================================
// SECTION: Trait
// ============================================================================

/// Append-only sink for provenance graphs and content-addressed blobs.
/// Writers never block readers.
pub trait EvidenceStore: Send + Sync {
    /// Writes a run's full evidence graph in one logical transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EvidenceStoreError`] when the graph is invalid or the
    /// backend is unavailable.
    fn write_graph(&self, graph: &EvidenceGraph) -> Result<ContentRef, EvidenceStoreError>;

    /// Stores a content-addressed blob, returning its reference.
    ///
    /// # Errors
    ///
    /// Returns [`EvidenceStoreError::Unavailable`] on a backend error.
    fn put_blob(&self, bytes: &[u8]) -> Result<ContentRef, EvidenceStoreError>;
}

// ============================================================================
// SECTION: Retry Policy
// ============================================================================

/// Maximum evidence-write attempts before the `evidence` stage is marked
/// `failed` without demoting the overall run.
pub const MAX_EVIDENCE_ATTEMPTS: u32 = 5;

/// Writes `graph` to `store`, retrying transient failures up to
/// [`MAX_EVIDENCE_ATTEMPTS`] times. `backoff_ms` is called with the attempt
/// number (1-indexed) and should sleep the caller's chosen amount; this
/// function is otherwise synchronous and side-effect-free beyond the store
/// call, so it is usable from both sync and async hosts.
///
/// # Errors
///
/// Returns the last [`EvidenceStoreError`] if every attempt fails.
pub fn write_with_retry(
    store: &dyn EvidenceStore,
    graph: &EvidenceGraph,
    mut backoff_ms: impl FnMut(u32),
) -> Result<ContentRef, EvidenceStoreError> {
    graph.validate()?;
    let mut last_err = None;
    for attempt in 1..=MAX_EVIDENCE_ATTEMPTS {
        match store.write_graph(graph) {
            Ok(reference) => return Ok(reference),
            Err(err) => {
                last_err = Some(err);
                if attempt < MAX_EVIDENCE_ATTEMPTS {
                    backoff_ms(attempt);
                }
            }
        }
    }
    Err(last_err.unwrap_or(EvidenceStoreError::Unavailable("no attempts made".to_string())))
}
