//! Adapters between structured tensor operands and the flat vectors consumed
//! by the Krylov back-ends.
//!
//! A caller-supplied operator acts on values of some structural type (a
//! dense array, or a sparse container of boundary blocks) while the
//! back-ends in [`crate::krylov`] see nothing but flat complex vectors. The
//! [`Vectorize`] round-trip is keyed off a reference value's structural
//! metadata (stored coordinates and per-element leg spaces) and never
//! inspects algebraic content, so any element type rides along unchanged.

use ndarray::{ self as nd, ShapeBuilder };
use num_complex::Complex64 as C64;
use crate::block::Block;
use crate::sparse::SparseTensor;

/// An operator acting on a structured operand by right-multiplication.
pub trait LinOp<X> {
    fn apply_to(&self, x: &X) -> X;
}

impl<X, F> LinOp<X> for F
where F: Fn(&X) -> X
{
    fn apply_to(&self, x: &X) -> X { self(x) }
}

/// An approximate inverse applied by left-division.
pub trait Precond<X> {
    fn div_into(&self, x: &X) -> X;
}

/// Wrapper turning any closure into a preconditioner.
pub struct FnPrecond<F>(pub F);

impl<X, F> Precond<X> for FnPrecond<F>
where F: Fn(&X) -> X
{
    fn div_into(&self, x: &X) -> X { (self.0)(x) }
}

/// Round-trip between a structured value and a flat complex vector.
///
/// `devectorize` is keyed off `self` as the structural reference: for any
/// value sharing `self`'s structure, `x.devectorize(&x.vectorize()) == x`.
pub trait Vectorize: Clone {
    /// Flatten into a vector. Column-major throughout, matching the crate's
    /// coordinate convention.
    fn vectorize(&self) -> nd::Array1<C64>;

    /// Rebuild a value with `self`'s structure from flat data.
    fn devectorize(&self, flat: &nd::Array1<C64>) -> Self;

    /// The flat dimension of the structural type.
    fn flat_len(&self) -> usize { self.vectorize().len() }
}

impl Vectorize for nd::Array1<C64> {
    fn vectorize(&self) -> nd::Array1<C64> { self.clone() }

    fn devectorize(&self, flat: &nd::Array1<C64>) -> Self { flat.clone() }

    fn flat_len(&self) -> usize { self.len() }
}

impl Vectorize for nd::Array2<C64> {
    fn vectorize(&self) -> nd::Array1<C64> {
        self.t().iter().copied().collect()
    }

    fn devectorize(&self, flat: &nd::Array1<C64>) -> Self {
        nd::Array2::from_shape_vec(self.raw_dim().f(), flat.to_vec())
            .unwrap()
    }

    fn flat_len(&self) -> usize { self.len() }
}

impl Vectorize for nd::Array3<C64> {
    fn vectorize(&self) -> nd::Array1<C64> {
        self.t().iter().copied().collect()
    }

    fn devectorize(&self, flat: &nd::Array1<C64>) -> Self {
        nd::Array3::from_shape_vec(self.raw_dim().f(), flat.to_vec())
            .unwrap()
    }

    fn flat_len(&self) -> usize { self.len() }
}

/// The flat space of a sparse container spans its *stored* blocks only, in
/// the deterministic [`SparseTensor::find`] order; structural zeros stay
/// structural through the round-trip.
impl Vectorize for SparseTensor<Block> {
    fn vectorize(&self) -> nd::Array1<C64> {
        self.iter_sorted()
            .flat_map(|(_, block)| block.0.iter().copied())
            .collect()
    }

    fn devectorize(&self, flat: &nd::Array1<C64>) -> Self {
        let mut out = self.clone();
        let mut offset = 0;
        for coord in self.find() {
            let shape = self.get(&coord)
                .map(|b| b.0.shape().to_vec())
                .unwrap_or_default();
            let len: usize = shape.iter().product();
            let data: Vec<C64> =
                flat.iter().skip(offset).take(len).copied().collect();
            offset += len;
            let block = Block(
                nd::ArrayD::from_shape_vec(nd::IxDyn(&shape), data).unwrap());
            out.insert(coord, block).unwrap();
        }
        out
    }

    fn flat_len(&self) -> usize {
        self.iter().map(|(_, block)| block.0.len()).sum()
    }
}

/// Flatten a structured operator into a closure on flat vectors, keyed off a
/// reference value.
pub fn flatten_op<'a, X, O>(op: &'a O, reference: &'a X)
    -> impl Fn(&nd::Array1<C64>) -> nd::Array1<C64> + 'a
where
    X: Vectorize,
    O: LinOp<X> + ?Sized,
{
    move |v: &nd::Array1<C64>| {
        let x = reference.devectorize(v);
        op.apply_to(&x).vectorize()
    }
}

/// Flatten a structured preconditioner into a closure on flat vectors, keyed
/// off a reference value.
pub fn flatten_precond<'a, X, M>(m: &'a M, reference: &'a X)
    -> impl Fn(&nd::Array1<C64>) -> nd::Array1<C64> + 'a
where
    X: Vectorize,
    M: Precond<X> + ?Sized,
{
    move |v: &nd::Array1<C64>| {
        let x = reference.devectorize(v);
        m.div_into(&x).vectorize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array2_round_trip() {
        let m: nd::Array2<C64> =
            nd::array![[1.0, 2.0], [3.0, 4.0]].mapv(C64::from);
        let flat = m.vectorize();
        // column-major
        assert_eq!(flat[1], C64::from(3.0));
        let back = m.devectorize(&flat);
        assert_eq!(back, m);
    }

    #[test]
    fn sparse_block_round_trip() {
        let mut t: SparseTensor<Block> = SparseTensor::new(vec![1, 3, 1]);
        t.insert(
            vec![1, 1, 1],
            Block::from2_re(nd::array![[1.0, 2.0], [3.0, 4.0]]),
        ).unwrap();
        t.insert(
            vec![1, 3, 1],
            Block::from2_re(nd::array![[5.0, 6.0], [7.0, 8.0]]),
        ).unwrap();
        let flat = t.vectorize();
        assert_eq!(flat.len(), 8);
        let back = t.devectorize(&flat);
        assert_eq!(back, t);
        // structural zero at the middle channel stays structural
        assert_eq!(back.nnz(), 2);
    }

    #[test]
    fn flattened_operator_matches_structured() {
        let m: nd::Array2<C64> =
            nd::array![[2.0, 0.0], [0.0, 3.0]].mapv(C64::from);
        let op = |x: &nd::Array2<C64>| -> nd::Array2<C64> { x * 2.0 };
        let f = flatten_op(&op, &m);
        let out = f(&m.vectorize());
        assert_eq!(m.devectorize(&out), m.mapv(|z| z * 2.0));
    }
}
