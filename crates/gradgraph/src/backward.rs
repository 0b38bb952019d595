//! Backward pass: gradient propagation in dependency order.
//!
//! The engine drives a ready queue over the schedule produced by the counting
//! pass. A node is ready once every in-subgraph consumer has delivered its
//! contribution, so each node's backward rule runs exactly once per pass no
//! matter how many root-to-node paths exist.

use std::collections::VecDeque;
use std::rc::Rc;

use log::debug;
use smallvec::SmallVec;

use crate::count;
use crate::error::GraphError;
use crate::graph::{Graph, NodeId};
use crate::scalar::Scalar;

/// Propagate gradients from `root` down to the leaves of its subgraph.
///
/// Contributions accumulate in a pass-local buffer and are folded into each
/// node's persistent gradient exactly once, when the node is popped from the
/// ready queue. Propagating pass-local amounts is what keeps repeated
/// backward calls additive: two passes without an intervening `zero_grad`
/// deposit exactly twice the gradient of one.
///
/// Nodes outside the root's reachable subgraph are untouched.
pub(crate) fn run<T: Scalar>(graph: &mut Graph<T>, root: NodeId, seed: T) -> Result<(), GraphError> {
    graph.check_node(root)?;
    if !graph.node(root).requires_grad() {
        // nothing below this root tracks gradients
        return Ok(());
    }

    let schedule = count::consumer_counts(graph, root)?;
    let reachable_len = schedule.reachable_len();
    let mut pending = schedule.pending;
    debug!(
        "backward from node {}: {} reachable nodes",
        root.index(),
        reachable_len
    );

    let mut pass_grads: Vec<Option<T>> = vec![None; graph.len()];
    pass_grads[root.index()] = Some(seed);

    let mut ready: VecDeque<NodeId> = VecDeque::new();
    ready.push_back(root);
    let mut finalized = 0usize;

    while let Some(id) = ready.pop_front() {
        let pass_grad =
            pass_grads[id.index()]
                .take()
                .ok_or_else(|| GraphError::InternalInvariant {
                    message: format!("node {} became ready without a gradient", id.index()),
                })?;
        graph.accumulate_grad(id, pass_grad);
        finalized += 1;

        let node = graph.node(id);
        let kind = match node.op() {
            Some(kind) => kind,
            None => continue, // leaf, nothing to propagate to
        };
        let output = node.value();
        let operands: SmallVec<[NodeId; 2]> = SmallVec::from_slice(node.operands());
        let inputs: SmallVec<[T; 2]> = operands.iter().map(|&o| graph.node(o).value()).collect();

        let op = Rc::clone(graph.registry().get(kind)?);
        let contributions = op.backward(pass_grad, &inputs, output);
        if contributions.len() != operands.len() {
            return Err(GraphError::InternalInvariant {
                message: format!(
                    "{} returned {} contributions for {} operands",
                    op.name(),
                    contributions.len(),
                    operands.len()
                ),
            });
        }

        // one delivery per operand occurrence
        for (&operand, &contribution) in operands.iter().zip(contributions.iter()) {
            if !graph.node(operand).requires_grad() {
                continue;
            }
            let slot = &mut pass_grads[operand.index()];
            *slot = Some(match slot.take() {
                Some(acc) => acc + contribution,
                None => contribution,
            });
            let count = &mut pending[operand.index()];
            *count = count
                .checked_sub(1)
                .ok_or_else(|| GraphError::InternalInvariant {
                    message: format!("pending count underflow at node {}", operand.index()),
                })?;
            if *count == 0 {
                ready.push_back(operand);
            }
        }
    }

    if finalized != reachable_len {
        return Err(GraphError::InternalInvariant {
            message: format!(
                "ready queue exhausted with {} of {} reachable nodes unfinalized",
                reachable_len - finalized,
                reachable_len
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Arity, Contributions, Operation};
    use smallvec::smallvec;
    use std::cell::Cell;

    /// Identity operation that counts backward-rule invocations.
    #[derive(Debug)]
    struct CountingOp {
        invocations: Rc<Cell<usize>>,
    }

    impl Operation<f64> for CountingOp {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn arity(&self) -> Arity {
            Arity::Fixed(1)
        }

        fn forward(&self, inputs: &[f64]) -> Result<f64, GraphError> {
            Ok(inputs[0])
        }

        fn backward(&self, upstream: f64, _inputs: &[f64], _output: f64) -> Contributions<f64> {
            self.invocations.set(self.invocations.get() + 1);
            smallvec![upstream]
        }
    }

    #[test]
    fn test_backward_simple_add() {
        let mut g: Graph<f64> = Graph::new();
        let a = g.leaf(2.0).unwrap();
        let b = g.leaf(3.0).unwrap();
        let out = g.add(a, b).unwrap();

        g.backward(out).unwrap();

        assert_eq!(g.gradient(a).unwrap(), 1.0);
        assert_eq!(g.gradient(b).unwrap(), 1.0);
        assert_eq!(g.gradient(out).unwrap(), 1.0);
    }

    #[test]
    fn test_backward_mixed_arithmetic() {
        // out = a - b + c * d
        let mut g: Graph<f64> = Graph::new();
        let a = g.leaf(2.0).unwrap();
        let b = g.leaf(3.0).unwrap();
        let c = g.leaf(4.0).unwrap();
        let d = g.leaf(5.0).unwrap();

        let diff = g.sub(a, b).unwrap();
        let prod = g.mul(c, d).unwrap();
        let out = g.add(diff, prod).unwrap();

        g.backward(out).unwrap();

        assert_eq!(g.gradient(a).unwrap(), 1.0);
        assert_eq!(g.gradient(b).unwrap(), -1.0);
        assert_eq!(g.gradient(c).unwrap(), 5.0);
        assert_eq!(g.gradient(d).unwrap(), 4.0);
    }

    #[test]
    fn test_backward_two_paths_accumulate() {
        // out = (a + 3) * (a * 4); d(out)/da = a*4 + 4*(a + 3) = 28 at a = 2
        let mut g: Graph<f64> = Graph::new();
        let a = g.leaf(2.0).unwrap();
        let three = g.leaf(3.0).unwrap();
        let four = g.leaf(4.0).unwrap();

        let left = g.add(a, three).unwrap();
        let right = g.mul(a, four).unwrap();
        let out = g.mul(left, right).unwrap();

        g.backward(out).unwrap();
        assert_eq!(g.gradient(a).unwrap(), 28.0);
    }

    #[test]
    fn test_backward_repeated_operand() {
        // out = a * a; d(out)/da = 2a
        let mut g: Graph<f64> = Graph::new();
        let a = g.leaf(3.0).unwrap();
        let out = g.mul(a, a).unwrap();

        g.backward(out).unwrap();
        assert_eq!(g.gradient(a).unwrap(), 6.0);
    }

    #[test]
    fn test_merge_point_rule_runs_once() {
        // b feeds two downstream uses; its backward rule must run once
        let mut g: Graph<f64> = Graph::new();
        let invocations = Rc::new(Cell::new(0));
        let counting = g.register_op(Rc::new(CountingOp {
            invocations: Rc::clone(&invocations),
        }));

        let a = g.leaf(2.0).unwrap();
        let b = g.apply(counting, &[a]).unwrap();
        let four = g.leaf(4.0).unwrap();
        let five = g.leaf(5.0).unwrap();
        let c = g.add(b, four).unwrap();
        let d = g.add(b, five).unwrap();
        let out = g.mul(c, d).unwrap();

        g.backward(out).unwrap();

        // out = (a+4)*(a+5); d(out)/da = (a+5) + (a+4) = 13 at a = 2
        assert_eq!(g.gradient(a).unwrap(), 13.0);
        assert_eq!(g.gradient(b).unwrap(), 13.0);
        assert_eq!(invocations.get(), 1);
    }

    #[test]
    fn test_backward_with_seed_scales() {
        let mut g: Graph<f64> = Graph::new();
        let a = g.leaf(2.0).unwrap();
        let b = g.leaf(3.0).unwrap();
        let out = g.mul(a, b).unwrap();

        g.backward_with_seed(out, 10.0).unwrap();

        assert_eq!(g.gradient(a).unwrap(), 30.0);
        assert_eq!(g.gradient(b).unwrap(), 20.0);
    }

    #[test]
    fn test_backward_unknown_root() {
        let mut g: Graph<f64> = Graph::new();
        let result = g.backward(NodeId::new_for_test(5));
        assert!(matches!(result, Err(GraphError::UnknownNode { .. })));
    }

    #[test]
    fn test_backward_on_constant_root_is_noop() {
        let mut g: Graph<f64> = Graph::new();
        let c = g.constant(2.0).unwrap();
        let d = g.constant(3.0).unwrap();
        let out = g.mul(c, d).unwrap();

        g.backward(out).unwrap();

        assert_eq!(g.gradient(out).unwrap(), 0.0);
        assert_eq!(g.gradient(c).unwrap(), 0.0);
    }

    #[test]
    fn test_constant_operand_not_propagated_into() {
        let mut g: Graph<f64> = Graph::new();
        let a = g.leaf(5.0).unwrap();
        let c = g.constant(3.0).unwrap();
        let out = g.mul(a, c).unwrap();

        g.backward(out).unwrap();

        assert_eq!(g.gradient(a).unwrap(), 3.0);
        assert_eq!(g.gradient(c).unwrap(), 0.0);
    }

    #[test]
    fn test_bad_backward_rule_is_an_invariant_error() {
        #[derive(Debug)]
        struct BadOp;

        impl Operation<f64> for BadOp {
            fn name(&self) -> &'static str {
                "bad"
            }

            fn arity(&self) -> Arity {
                Arity::Fixed(2)
            }

            fn forward(&self, inputs: &[f64]) -> Result<f64, GraphError> {
                Ok(inputs[0] + inputs[1])
            }

            fn backward(&self, upstream: f64, _inputs: &[f64], _output: f64) -> Contributions<f64> {
                smallvec![upstream] // one contribution for two operands
            }
        }

        let mut g: Graph<f64> = Graph::new();
        let a = g.leaf(1.0).unwrap();
        let b = g.leaf(2.0).unwrap();
        let bad = g.register_op(Rc::new(BadOp));
        let out = g.apply(bad, &[a, b]).unwrap();

        let result = g.backward(out);
        assert!(matches!(result, Err(GraphError::InternalInvariant { .. })));
    }

    // Minimal non-scalar value type: a pair with elementwise arithmetic and
    // no unit seed, so backward demands an explicit seed.
    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Pair(f64, f64);

    impl std::ops::Add for Pair {
        type Output = Pair;
        fn add(self, rhs: Pair) -> Pair {
            Pair(self.0 + rhs.0, self.1 + rhs.1)
        }
    }

    impl std::ops::Sub for Pair {
        type Output = Pair;
        fn sub(self, rhs: Pair) -> Pair {
            Pair(self.0 - rhs.0, self.1 - rhs.1)
        }
    }

    impl std::ops::Mul for Pair {
        type Output = Pair;
        fn mul(self, rhs: Pair) -> Pair {
            Pair(self.0 * rhs.0, self.1 * rhs.1)
        }
    }

    impl std::ops::Div for Pair {
        type Output = Pair;
        fn div(self, rhs: Pair) -> Pair {
            Pair(self.0 / rhs.0, self.1 / rhs.1)
        }
    }

    impl std::ops::Neg for Pair {
        type Output = Pair;
        fn neg(self) -> Pair {
            Pair(-self.0, -self.1)
        }
    }

    impl Scalar for Pair {
        fn one() -> Self {
            Pair(1.0, 1.0)
        }

        fn is_finite(&self) -> bool {
            self.0.is_finite() && self.1.is_finite()
        }

        fn powf(self, exponent: f64) -> Self {
            Pair(self.0.powf(exponent), self.1.powf(exponent))
        }

        fn from_f64(value: f64) -> Self {
            Pair(value, value)
        }

        fn unit_seed() -> Option<Self> {
            None
        }
    }

    #[test]
    fn test_non_scalar_root_requires_seed() {
        let mut g: Graph<Pair> = Graph::new();
        let a = g.leaf(Pair(2.0, 3.0)).unwrap();
        let b = g.leaf(Pair(4.0, 5.0)).unwrap();
        let out = g.mul(a, b).unwrap();

        assert!(matches!(g.backward(out), Err(GraphError::MissingSeed)));

        g.backward_with_seed(out, Pair(1.0, 1.0)).unwrap();
        assert_eq!(g.gradient(a).unwrap(), Pair(4.0, 5.0));
        assert_eq!(g.gradient(b).unwrap(), Pair(2.0, 3.0));
    }
}
