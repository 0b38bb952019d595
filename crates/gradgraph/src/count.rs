//! Consumer-counting pass that schedules the backward engine.
//!
//! For a chosen root, this pass determines how many of each ancestor's
//! consumers lie within the root's reachable subgraph. A node may have
//! consumers elsewhere in the graph that are irrelevant to this particular
//! backward call, so the counts must be recomputed fresh for every root.

use crate::error::GraphError;
use crate::graph::{Graph, NodeId};
use crate::scalar::Scalar;

/// Per-root schedule produced by the counting pass.
#[derive(Debug)]
pub(crate) struct Schedule {
    /// In-subgraph consumer count per node, indexed by node id.
    ///
    /// A node's gradient is final for this pass once its count reaches zero.
    pub pending: Vec<usize>,
    /// Visited marker: nodes reachable from the root via operand edges.
    pub reachable: Vec<bool>,
}

impl Schedule {
    /// Number of reachable nodes, the root included.
    pub fn reachable_len(&self) -> usize {
        self.reachable.iter().filter(|&&r| r).count()
    }
}

/// Count in-subgraph consumers for every node reachable from `root`.
///
/// Iterative depth-first traversal over operand edges, visiting each node
/// once. Every edge encountered (including repeated occurrences of the same
/// operand) increments the operand's pending count by one. Edges into nodes
/// that do not track gradients are skipped; the backward engine skips the
/// same edges, so counts and deliveries always match.
///
/// The root starts at zero: nothing above it in this pass consumes it.
///
/// Operand edges must point to strictly-earlier nodes, so a cycle can only
/// appear as an edge whose target index is not below its source's; any such
/// edge fails with [`GraphError::GraphCycle`].
pub(crate) fn consumer_counts<T: Scalar>(
    graph: &Graph<T>,
    root: NodeId,
) -> Result<Schedule, GraphError> {
    let mut pending = vec![0usize; graph.len()];
    let mut reachable = vec![false; graph.len()];
    let mut stack = vec![root];
    reachable[root.index()] = true;

    while let Some(id) = stack.pop() {
        for &operand in graph.node(id).operands() {
            if operand.index() >= id.index() {
                return Err(GraphError::GraphCycle { index: id.index() });
            }
            if !graph.node(operand).requires_grad() {
                continue;
            }
            pending[operand.index()] += 1;
            if !reachable[operand.index()] {
                reachable[operand.index()] = true;
                stack.push(operand);
            }
        }
    }

    Ok(Schedule { pending, reachable })
}
