#![allow(dead_code, non_snake_case, non_upper_case_globals)]

//! Core numerical primitives for tensor-network simulations of infinite
//! quantum chains: a block-sparse tensor container keyed by symmetry sector,
//! and the Krylov-based machinery used to compute fixed-point environments of
//! triangular (Jordan-block) matrix-product-operator transfer matrices.

use ndarray_linalg::types::{ Scalar, Lapack };
use num_complex::{ ComplexFloat, Complex };
use num_traits::{ Float, Zero };

pub mod coord;
pub mod sparse;
pub mod block;
pub mod linop;
pub mod krylov;
pub mod solve;
pub mod mpo;
pub mod env;
pub mod qp;

/// Extension trait for [`ComplexFloat`].
pub trait ComplexFloatExt: ComplexFloat {
    /// Return the imaginary unit, *i*.
    fn i() -> Self;

    /// Convert from `Self::Real`.
    ///
    /// Should adhere to the usual relationship between ordinary complex and
    /// real numbers, i.e. the result should have imaginary part equal to zero.
    fn from_re(x: Self::Real) -> Self;

    /// Construct from real and imaginary components.
    fn from_components(re: Self::Real, im: Self::Real) -> Self;

    /// Create a new value of unit magnitude with a given phase angle.
    fn cis(angle: Self::Real) -> Self;

    /// Convert to a polar representation `(r, θ)`.
    fn to_polar(self) -> (Self::Real, Self::Real);

    /// Convert a polar representation into a complex number.
    fn from_polar(r: Self::Real, theta: Self::Real) -> Self;
}

impl<T> ComplexFloatExt for Complex<T>
where
    Complex<T>: ComplexFloat<Real = T>,
    T: Zero + Float,
{
    fn i() -> Self { Complex::i() }

    fn from_re(x: Self::Real) -> Self {
        Self { re: x, im: <Self::Real as Zero>::zero() }
    }

    fn from_components(re: Self::Real, im: Self::Real) -> Self {
        Self { re, im }
    }

    fn cis(angle: Self::Real) -> Self { Complex::cis(angle) }

    fn to_polar(self) -> (Self::Real, Self::Real) {
        self.to_polar()
    }

    fn from_polar(r: Self::Real, theta: Self::Real) -> Self {
        Complex::from_polar(r, theta)
    }
}

/// Convenience trait to identify complex number types that can be used in the
/// Krylov layer's linear-algebraic operations.
pub trait ComplexScalar
where
    Self:
        ComplexFloat<Real = Self::Re>
        + ComplexFloatExt
        + Scalar<Real = Self::Re, Complex = Self>
        + Lapack
{
    /// Type for associated real values.
    type Re: Float + std::fmt::Debug;
}

impl<A> ComplexScalar for A
where
    A:
        ComplexFloat<Real = <A as Scalar>::Real>
        + ComplexFloatExt
        + Scalar<Complex = A>
        + Lapack,
    <A as Scalar>::Real: Float + std::fmt::Debug,
{
    type Re = <A as Scalar>::Real;
}
