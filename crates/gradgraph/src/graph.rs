//! Node arena and graph builder.
//!
//! All nodes live in a single append-only arena owned by [`Graph`]. Operand
//! edges are stable indices into the arena, never owning references, so the
//! graph is acyclic by construction: an edge can only point to a node created
//! strictly earlier.

use std::collections::HashMap;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::backward;
use crate::error::GraphError;
use crate::op::{BuiltinKinds, OpKind, OpRegistry, Operation, PowOp};
use crate::scalar::Scalar;

/// Unique identifier for a node in a graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Get the internal index.
    pub fn index(&self) -> usize {
        self.0
    }

    /// Create a NodeId for testing purposes.
    #[cfg(test)]
    pub(crate) fn new_for_test(index: usize) -> Self {
        Self(index)
    }
}

/// Operand list stored inline for the common unary/binary case.
pub(crate) type Operands = SmallVec<[NodeId; 2]>;

/// A node in the computation graph.
#[derive(Debug)]
pub struct Node<T: Scalar> {
    /// Forward value, fixed at creation.
    value: T,
    /// Accumulated gradient; additive identity until a backward pass writes it.
    grad: T,
    /// Operation that produced this node (`None` for leaves).
    op: Option<OpKind>,
    /// Operand edges in order; repeated occurrences are kept.
    operands: Operands,
    /// Total number of times existing operations use this node as an operand,
    /// counted per occurrence.
    consumers: usize,
    /// Whether backward passes track gradients through this node.
    requires_grad: bool,
}

impl<T: Scalar> Node<T> {
    /// Get the forward value.
    pub fn value(&self) -> T {
        self.value
    }

    /// Get the accumulated gradient.
    pub fn gradient(&self) -> T {
        self.grad
    }

    /// Get the operation kind (`None` for leaves).
    pub fn op(&self) -> Option<OpKind> {
        self.op
    }

    /// Get the operand edges.
    pub fn operands(&self) -> &[NodeId] {
        &self.operands
    }

    /// Total consumer count across the whole graph.
    pub fn consumers(&self) -> usize {
        self.consumers
    }

    /// Check if this node is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.op.is_none()
    }

    /// Check if backward passes track gradients through this node.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }
}

/// Computation graph: node store, graph builder, and the entry points for
/// backward passes.
///
/// # Example
///
/// ```
/// use gradgraph::Graph;
///
/// let mut g: Graph<f64> = Graph::new();
/// let x = g.leaf(3.0).unwrap();
/// let y = g.mul(x, x).unwrap();
///
/// g.backward(y).unwrap();
/// assert_eq!(g.gradient(x).unwrap(), 6.0);
/// ```
#[derive(Debug)]
pub struct Graph<T: Scalar> {
    nodes: Vec<Node<T>>,
    registry: OpRegistry<T>,
    builtins: BuiltinKinds,
    /// Pow kinds already registered, keyed by exponent bit pattern.
    pow_kinds: HashMap<u64, OpKind>,
}

impl<T: Scalar> Graph<T> {
    /// Create an empty graph with the built-in operations registered.
    pub fn new() -> Self {
        let mut registry = OpRegistry::new();
        let builtins = BuiltinKinds::register_into(&mut registry);
        Self {
            nodes: Vec::new(),
            registry,
            builtins,
            pow_kinds: HashMap::new(),
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Release every node at once. Registered operations stay valid.
    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Reset every node's accumulated gradient to the additive identity.
    pub fn zero_grad(&mut self) {
        for node in &mut self.nodes {
            node.grad = T::zero();
        }
    }

    /// Create a leaf node that tracks gradients.
    ///
    /// Fails with [`GraphError::InvalidValue`] if the value is not finite.
    pub fn leaf(&mut self, value: T) -> Result<NodeId, GraphError> {
        self.push_leaf(value, true)
    }

    /// Create a leaf node that does not track gradients.
    ///
    /// Backward passes neither traverse nor count constant-only subtrees, and
    /// the node's gradient stays at the additive identity.
    pub fn constant(&mut self, value: T) -> Result<NodeId, GraphError> {
        self.push_leaf(value, false)
    }

    fn push_leaf(&mut self, value: T, requires_grad: bool) -> Result<NodeId, GraphError> {
        if !value.is_finite() {
            return Err(GraphError::InvalidValue {
                message: format!("{:?} is not finite", value),
            });
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            value,
            grad: T::zero(),
            op: None,
            operands: Operands::new(),
            consumers: 0,
            requires_grad,
        });
        Ok(id)
    }

    /// Register a user-defined operation, returning its kind tag.
    pub fn register_op(&mut self, op: Rc<dyn Operation<T>>) -> OpKind {
        self.registry.register(op)
    }

    /// Apply a registered operation to the given operands.
    ///
    /// Computes the forward value, appends one node with the operand edges in
    /// order, and increments each referenced operand's consumer count once per
    /// occurrence (a node passed twice counts twice). Existing nodes' values
    /// are never mutated; on error the store is left unchanged.
    pub fn apply(&mut self, kind: OpKind, operands: &[NodeId]) -> Result<NodeId, GraphError> {
        for &id in operands {
            self.check_node(id)?;
        }
        let op = Rc::clone(self.registry.get(kind)?);
        if !op.arity().accepts(operands.len()) {
            return Err(GraphError::ShapeMismatch {
                op: op.name(),
                expected: op.arity().expected(),
                actual: operands.len(),
            });
        }

        let inputs: SmallVec<[T; 2]> = operands.iter().map(|&id| self.nodes[id.0].value).collect();
        let value = op.forward(&inputs)?;
        let requires_grad = operands.iter().any(|&id| self.nodes[id.0].requires_grad);

        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            value,
            grad: T::zero(),
            op: Some(kind),
            operands: Operands::from_slice(operands),
            consumers: 0,
            requires_grad,
        });
        for &operand in operands {
            self.nodes[operand.0].consumers += 1;
        }
        Ok(id)
    }

    /// Addition: `a + b`.
    pub fn add(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, GraphError> {
        self.apply(self.builtins.add, &[a, b])
    }

    /// Subtraction: `a - b`.
    pub fn sub(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, GraphError> {
        self.apply(self.builtins.sub, &[a, b])
    }

    /// Multiplication: `a * b`.
    pub fn mul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, GraphError> {
        self.apply(self.builtins.mul, &[a, b])
    }

    /// Division: `a / b`. Fails with a domain error if `b` is zero.
    pub fn div(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, GraphError> {
        self.apply(self.builtins.div, &[a, b])
    }

    /// Negation: `-a`.
    pub fn neg(&mut self, a: NodeId) -> Result<NodeId, GraphError> {
        self.apply(self.builtins.neg, &[a])
    }

    /// Power with constant exponent: `a ^ exponent`.
    pub fn pow(&mut self, a: NodeId, exponent: f64) -> Result<NodeId, GraphError> {
        let kind = self.pow_kind(exponent);
        self.apply(kind, &[a])
    }

    /// Identity/copy of `a`.
    pub fn identity(&mut self, a: NodeId) -> Result<NodeId, GraphError> {
        self.apply(self.builtins.identity, &[a])
    }

    /// Variadic sum over `operands`.
    pub fn sum(&mut self, operands: &[NodeId]) -> Result<NodeId, GraphError> {
        self.apply(self.builtins.sum, operands)
    }

    fn pow_kind(&mut self, exponent: f64) -> OpKind {
        match self.pow_kinds.get(&exponent.to_bits()) {
            Some(&kind) => kind,
            None => {
                let kind = self.registry.register(Rc::new(PowOp::new(exponent)));
                self.pow_kinds.insert(exponent.to_bits(), kind);
                kind
            }
        }
    }

    /// Get a node by id.
    pub fn get(&self, id: NodeId) -> Option<&Node<T>> {
        self.nodes.get(id.0)
    }

    /// Get a node's forward value.
    pub fn value(&self, id: NodeId) -> Result<T, GraphError> {
        self.check_node(id)?;
        Ok(self.nodes[id.0].value)
    }

    /// Get a node's accumulated gradient.
    pub fn gradient(&self, id: NodeId) -> Result<T, GraphError> {
        self.check_node(id)?;
        Ok(self.nodes[id.0].grad)
    }

    /// Run a backward pass from `root` with the value type's unit seed.
    ///
    /// Fails with [`GraphError::MissingSeed`] for value types without a unit
    /// seed (non-scalar extensions); use
    /// [`backward_with_seed`](Graph::backward_with_seed) for those. If the
    /// pass fails partway, gradients of already-finalized nodes hold partial
    /// sums; discard them with [`zero_grad`](Graph::zero_grad) and re-run.
    pub fn backward(&mut self, root: NodeId) -> Result<(), GraphError> {
        let seed = T::unit_seed().ok_or(GraphError::MissingSeed)?;
        backward::run(self, root, seed)
    }

    /// Run a backward pass from `root` with an explicit seed gradient.
    pub fn backward_with_seed(&mut self, root: NodeId, seed: T) -> Result<(), GraphError> {
        backward::run(self, root, seed)
    }

    pub(crate) fn check_node(&self, id: NodeId) -> Result<(), GraphError> {
        if id.0 >= self.nodes.len() {
            return Err(GraphError::UnknownNode {
                index: id.0,
                len: self.nodes.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node<T> {
        &self.nodes[id.0]
    }

    pub(crate) fn accumulate_grad(&mut self, id: NodeId, delta: T) {
        let node = &mut self.nodes[id.0];
        node.grad = node.grad + delta;
    }

    pub(crate) fn registry(&self) -> &OpRegistry<T> {
        &self.registry
    }

    /// Append a raw node, bypassing builder validation. Tests use this to
    /// corrupt the store and exercise the defensive checks.
    #[cfg(test)]
    pub(crate) fn push_raw_for_test(
        &mut self,
        value: T,
        op: Option<OpKind>,
        operands: &[NodeId],
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            value,
            grad: T::zero(),
            op,
            operands: Operands::from_slice(operands),
            consumers: 0,
            requires_grad: true,
        });
        id
    }
}

impl<T: Scalar> Default for Graph<T> {
    fn default() -> Self {
        Self::new()
    }
}
