//! Scalar trait for graph value types.

use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Trait for values stored at graph nodes.
///
/// The engine only needs ring arithmetic plus a few float-flavored hooks:
/// finiteness checking for leaf validation, `powf`/`from_f64` for the
/// constant-exponent power rule, and `unit_seed` for default backward seeds.
///
/// A fixed-shape tensor type can implement this trait as an extension; such a
/// type should return `None` from [`unit_seed`](Scalar::unit_seed) so that
/// backward passes rooted at it demand an explicit seed gradient.
pub trait Scalar:
    Copy
    + Debug
    + Default
    + PartialEq
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + 'static
{
    /// Returns the additive identity (zero).
    fn zero() -> Self {
        Self::default()
    }

    /// Returns the multiplicative identity (one).
    fn one() -> Self;

    /// Whether the value is finite (used to validate leaf values).
    fn is_finite(&self) -> bool;

    /// Raise to a constant power.
    fn powf(self, exponent: f64) -> Self;

    /// Convert a constant (e.g. a power-rule exponent) into this type.
    fn from_f64(value: f64) -> Self;

    /// Default seed gradient for a backward pass rooted at this type.
    ///
    /// `Some(one)` for scalar types; `None` for non-scalar value types, which
    /// must be seeded explicitly.
    fn unit_seed() -> Option<Self> {
        Some(Self::one())
    }
}

impl Scalar for f64 {
    fn one() -> Self {
        1.0
    }

    fn is_finite(&self) -> bool {
        f64::is_finite(*self)
    }

    fn powf(self, exponent: f64) -> Self {
        f64::powf(self, exponent)
    }

    fn from_f64(value: f64) -> Self {
        value
    }
}

impl Scalar for f32 {
    fn one() -> Self {
        1.0
    }

    fn is_finite(&self) -> bool {
        f32::is_finite(*self)
    }

    fn powf(self, exponent: f64) -> Self {
        f32::powf(self, exponent as f32)
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_one() {
        assert_eq!(f64::zero(), 0.0);
        assert_eq!(f64::one(), 1.0);
        assert_eq!(f32::zero(), 0.0);
        assert_eq!(f32::one(), 1.0);
    }

    #[test]
    fn test_is_finite() {
        assert!(Scalar::is_finite(&1.5));
        assert!(!Scalar::is_finite(&f64::NAN));
        assert!(!Scalar::is_finite(&f64::INFINITY));
    }

    #[test]
    fn test_powf() {
        assert_eq!(Scalar::powf(2.0_f64, 3.0), 8.0);
        assert_eq!(Scalar::powf(9.0_f32, 0.5), 3.0);
    }

    #[test]
    fn test_unit_seed() {
        assert_eq!(<f64 as Scalar>::unit_seed(), Some(1.0));
        assert_eq!(<f32 as Scalar>::unit_seed(), Some(1.0));
    }
}
