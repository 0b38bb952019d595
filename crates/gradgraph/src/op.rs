//! Operation registry: forward functions paired with backward rules.

use std::fmt::Debug;
use std::rc::Rc;

use smallvec::{smallvec, SmallVec};

use crate::error::GraphError;
use crate::scalar::Scalar;

/// Per-input gradient contributions returned by a backward rule.
///
/// Stored inline for the common unary/binary case.
pub type Contributions<T> = SmallVec<[T; 2]>;

/// Operand count accepted by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly this many operands.
    Fixed(usize),
    /// Any number of operands, at least one.
    Variadic,
}

impl Arity {
    /// Check whether `n` operands satisfy this arity.
    pub fn accepts(&self, n: usize) -> bool {
        match self {
            Arity::Fixed(k) => *k == n,
            Arity::Variadic => n >= 1,
        }
    }

    /// Operand count reported in arity-mismatch errors.
    pub(crate) fn expected(&self) -> usize {
        match self {
            Arity::Fixed(k) => *k,
            Arity::Variadic => 1,
        }
    }
}

/// Kind tag identifying an operation registered in an [`OpRegistry`].
///
/// Tags are only meaningful for the registry that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpKind(pub(crate) u32);

impl OpKind {
    /// Get the internal tag value.
    pub fn tag(&self) -> u32 {
        self.0
    }
}

/// A differentiable operation.
///
/// An operation is a pure `forward` function from operand values to an output
/// value, paired with the `backward` rule implementing its local chain-rule
/// step. Both are pure; all state an operation needs (e.g. a constant
/// exponent) is captured at registration time.
pub trait Operation<T: Scalar>: Debug {
    /// Short name used in error messages.
    fn name(&self) -> &'static str;

    /// Operand count this operation accepts.
    fn arity(&self) -> Arity;

    /// Compute the output value from the operand values.
    fn forward(&self, inputs: &[T]) -> Result<T, GraphError>;

    /// Per-operand gradient contributions.
    ///
    /// Contribution `i` is `upstream * d(output)/d(input_i)` evaluated at the
    /// recorded forward values. Must return exactly one contribution per
    /// input, in operand order.
    fn backward(&self, upstream: T, inputs: &[T], output: T) -> Contributions<T>;
}

/// Registry mapping kind tags to operations.
///
/// The registry is append-only: registering an operation returns the
/// [`OpKind`] under which the graph builder can apply it. New operations are
/// added without touching existing ones.
#[derive(Debug)]
pub struct OpRegistry<T: Scalar> {
    ops: Vec<Rc<dyn Operation<T>>>,
}

impl<T: Scalar> OpRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Register an operation, returning its kind tag.
    pub fn register(&mut self, op: Rc<dyn Operation<T>>) -> OpKind {
        let kind = OpKind(self.ops.len() as u32);
        self.ops.push(op);
        kind
    }

    /// Look up an operation by kind tag.
    pub fn get(&self, kind: OpKind) -> Result<&Rc<dyn Operation<T>>, GraphError> {
        self.ops
            .get(kind.0 as usize)
            .ok_or(GraphError::UnknownOp { kind: kind.0 })
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if no operations are registered.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl<T: Scalar> Default for OpRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind tags for the built-in arithmetic operations.
///
/// Registered once per graph at construction; `pow` kinds are registered on
/// demand because each exponent is its own kind.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BuiltinKinds {
    pub add: OpKind,
    pub sub: OpKind,
    pub mul: OpKind,
    pub div: OpKind,
    pub neg: OpKind,
    pub identity: OpKind,
    pub sum: OpKind,
}

impl BuiltinKinds {
    pub(crate) fn register_into<T: Scalar>(registry: &mut OpRegistry<T>) -> Self {
        Self {
            add: registry.register(Rc::new(AddOp)),
            sub: registry.register(Rc::new(SubOp)),
            mul: registry.register(Rc::new(MulOp)),
            div: registry.register(Rc::new(DivOp)),
            neg: registry.register(Rc::new(NegOp)),
            identity: registry.register(Rc::new(IdentityOp)),
            sum: registry.register(Rc::new(SumOp)),
        }
    }
}

/// Addition: `inputs[0] + inputs[1]`.
#[derive(Debug)]
pub struct AddOp;

impl<T: Scalar> Operation<T> for AddOp {
    fn name(&self) -> &'static str {
        "add"
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(2)
    }

    fn forward(&self, inputs: &[T]) -> Result<T, GraphError> {
        Ok(inputs[0] + inputs[1])
    }

    fn backward(&self, upstream: T, _inputs: &[T], _output: T) -> Contributions<T> {
        smallvec![upstream, upstream]
    }
}

/// Subtraction: `inputs[0] - inputs[1]`.
#[derive(Debug)]
pub struct SubOp;

impl<T: Scalar> Operation<T> for SubOp {
    fn name(&self) -> &'static str {
        "sub"
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(2)
    }

    fn forward(&self, inputs: &[T]) -> Result<T, GraphError> {
        Ok(inputs[0] - inputs[1])
    }

    fn backward(&self, upstream: T, _inputs: &[T], _output: T) -> Contributions<T> {
        smallvec![upstream, -upstream]
    }
}

/// Multiplication: `inputs[0] * inputs[1]`.
#[derive(Debug)]
pub struct MulOp;

impl<T: Scalar> Operation<T> for MulOp {
    fn name(&self) -> &'static str {
        "mul"
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(2)
    }

    fn forward(&self, inputs: &[T]) -> Result<T, GraphError> {
        Ok(inputs[0] * inputs[1])
    }

    fn backward(&self, upstream: T, inputs: &[T], _output: T) -> Contributions<T> {
        smallvec![upstream * inputs[1], upstream * inputs[0]]
    }
}

/// Division: `inputs[0] / inputs[1]`.
#[derive(Debug)]
pub struct DivOp;

impl<T: Scalar> Operation<T> for DivOp {
    fn name(&self) -> &'static str {
        "div"
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(2)
    }

    fn forward(&self, inputs: &[T]) -> Result<T, GraphError> {
        if inputs[1] == T::zero() {
            return Err(GraphError::Domain {
                op: "div",
                message: "division by zero".to_string(),
            });
        }
        Ok(inputs[0] / inputs[1])
    }

    fn backward(&self, upstream: T, inputs: &[T], _output: T) -> Contributions<T> {
        let (a, b) = (inputs[0], inputs[1]);
        smallvec![upstream / b, -(upstream * a) / (b * b)]
    }
}

/// Negation: `-inputs[0]`.
#[derive(Debug)]
pub struct NegOp;

impl<T: Scalar> Operation<T> for NegOp {
    fn name(&self) -> &'static str {
        "neg"
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(1)
    }

    fn forward(&self, inputs: &[T]) -> Result<T, GraphError> {
        Ok(-inputs[0])
    }

    fn backward(&self, upstream: T, _inputs: &[T], _output: T) -> Contributions<T> {
        smallvec![-upstream]
    }
}

/// Power with constant exponent: `inputs[0] ^ exponent`.
///
/// The exponent is captured at registration; each distinct exponent is its
/// own kind.
#[derive(Debug)]
pub struct PowOp {
    exponent: f64,
}

impl PowOp {
    /// Create a power operation with the given constant exponent.
    pub fn new(exponent: f64) -> Self {
        Self { exponent }
    }
}

impl<T: Scalar> Operation<T> for PowOp {
    fn name(&self) -> &'static str {
        "pow"
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(1)
    }

    fn forward(&self, inputs: &[T]) -> Result<T, GraphError> {
        // powf is the only builtin that can produce a non-finite result from
        // finite, pre-validated inputs (0^-1, (-2)^0.5).
        let result = inputs[0].powf(self.exponent);
        if !result.is_finite() {
            return Err(GraphError::Domain {
                op: "pow",
                message: format!("base {:?} with exponent {} is undefined", inputs[0], self.exponent),
            });
        }
        Ok(result)
    }

    fn backward(&self, upstream: T, inputs: &[T], _output: T) -> Contributions<T> {
        let local = inputs[0].powf(self.exponent - 1.0) * T::from_f64(self.exponent);
        smallvec![upstream * local]
    }
}

/// Identity/copy: `inputs[0]` unchanged.
#[derive(Debug)]
pub struct IdentityOp;

impl<T: Scalar> Operation<T> for IdentityOp {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(1)
    }

    fn forward(&self, inputs: &[T]) -> Result<T, GraphError> {
        Ok(inputs[0])
    }

    fn backward(&self, upstream: T, _inputs: &[T], _output: T) -> Contributions<T> {
        smallvec![upstream]
    }
}

/// Variadic sum: `inputs[0] + inputs[1] + ...`.
#[derive(Debug)]
pub struct SumOp;

impl<T: Scalar> Operation<T> for SumOp {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn arity(&self) -> Arity {
        Arity::Variadic
    }

    fn forward(&self, inputs: &[T]) -> Result<T, GraphError> {
        let mut total = inputs[0];
        for &x in &inputs[1..] {
            total = total + x;
        }
        Ok(total)
    }

    fn backward(&self, upstream: T, inputs: &[T], _output: T) -> Contributions<T> {
        SmallVec::from_elem(upstream, inputs.len())
    }
}
