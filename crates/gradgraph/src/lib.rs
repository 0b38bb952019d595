//! gradgraph - reverse-mode automatic differentiation over an arena graph.
//!
//! This crate computes exact gradients of expressions built from primitive
//! arithmetic operations, recording the computation in a dynamically
//! constructed graph and propagating adjoints backward from a chosen output.
//!
//! # Architecture
//!
//! ```text
//! Graph<T>  ──owns──►  Vec<Node<T>>   (arena, append-only, NodeId indices)
//!     │
//!     │ apply() consults
//!     ▼
//! OpRegistry<T>  ──►  Rc<dyn Operation<T>>   (forward + backward rule)
//!     │
//! backward(root)
//!     │
//!     ├─► counting pass: per-root pending counts (count module)
//!     └─► ready-queue propagation, one visit per node (backward module)
//! ```
//!
//! # Example
//!
//! ```
//! use gradgraph::Graph;
//!
//! let mut g: Graph<f64> = Graph::new();
//!
//! // out = a*2 + b*3
//! let a = g.leaf(4.0).unwrap();
//! let b = g.leaf(7.0).unwrap();
//! let two = g.constant(2.0).unwrap();
//! let three = g.constant(3.0).unwrap();
//!
//! let a2 = g.mul(a, two).unwrap();
//! let b3 = g.mul(b, three).unwrap();
//! let out = g.add(a2, b3).unwrap();
//! assert_eq!(g.value(out).unwrap(), 29.0);
//!
//! g.backward(out).unwrap();
//! assert_eq!(g.gradient(a).unwrap(), 2.0);
//! assert_eq!(g.gradient(b).unwrap(), 3.0);
//! ```
//!
//! # Key Types
//!
//! - [`Graph`]: node store, graph builder, and backward entry points
//! - [`NodeId`]: stable index identifying a node in one graph's arena
//! - [`Operation`] / [`OpRegistry`]: the extensible operation table
//! - [`Scalar`]: trait abstracting the node value type (`f64`, `f32`)
//!
//! # Design Notes
//!
//! - Operand edges are indices that always point to earlier nodes, so the
//!   graph is acyclic by construction and needs no ownership cycles.
//! - Pending counts are recomputed per backward call; different roots induce
//!   different reachable subgraphs, so the counts are never stored on nodes.
//! - Single-threaded: `backward` takes `&mut Graph`, which statically rules
//!   out graph extension during an in-flight pass.

mod backward;
mod count;
pub mod error;
pub mod graph;
pub mod op;
pub mod scalar;

pub use error::GraphError;
pub use graph::{Graph, Node, NodeId};
pub use op::{Arity, Contributions, OpKind, OpRegistry, Operation};
pub use scalar::Scalar;
