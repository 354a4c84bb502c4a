//! Dense tensor blocks stored as elements of a sparse container.
//!
//! A [`Block`] is the dense-block member of the closed element set behind
//! [`Elem`][crate::sparse::Elem]: an N-dimensional array of complex values
//! whose per-axis leg-space descriptor is simply its shape. The environment
//! layer stores rank-3 boundary blocks and rank-2 operator blocks this way.

use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::sparse::{ Elem, SparseError, SparseResult };

/// Dense N-dimensional block of complex values.
#[derive(Clone, Debug, PartialEq)]
pub struct Block(pub nd::ArrayD<C64>);

impl Block {
    /// An all-zero block with the given leg spaces.
    pub fn zeros(legs: &[usize]) -> Self {
        Self(nd::ArrayD::zeros(nd::IxDyn(legs)))
    }

    /// Wrap a rank-2 array.
    pub fn from2(m: nd::Array2<C64>) -> Self { Self(m.into_dyn()) }

    /// Wrap a rank-3 array.
    pub fn from3(t: nd::Array3<C64>) -> Self { Self(t.into_dyn()) }

    /// Wrap a real rank-2 array.
    pub fn from2_re(m: nd::Array2<f64>) -> Self {
        Self(m.mapv(C64::from).into_dyn())
    }

    /// The number of internal legs.
    pub fn rank(&self) -> usize { self.0.ndim() }

    /// View as a rank-2 array, if the block has two legs.
    pub fn as2(&self) -> Option<nd::Array2<C64>> {
        self.0.clone().into_dimensionality::<nd::Ix2>().ok()
    }

    /// View as a rank-3 array, if the block has three legs.
    pub fn as3(&self) -> Option<nd::Array3<C64>> {
        self.0.clone().into_dimensionality::<nd::Ix3>().ok()
    }

    /// Multiply by a complex factor.
    pub fn scale_c(&self, c: C64) -> Self { Self(self.0.mapv(|z| z * c)) }

    /// Sum of all entries.
    pub fn sum(&self) -> C64 { self.0.sum() }
}

impl Elem for Block {
    fn legs(&self) -> Vec<usize> { self.0.shape().to_vec() }

    fn zero_from_legs(legs: &[usize]) -> Option<Self> {
        Some(Self::zeros(legs))
    }

    fn zero_like(&self) -> Self { Self(nd::ArrayD::zeros(self.0.raw_dim())) }

    fn default_zero() -> Option<Self> { None }

    fn add_checked(&self, rhs: &Self) -> SparseResult<Self> {
        if self.0.shape() != rhs.0.shape() {
            return Err(SparseError::ElemShapeMismatch(
                self.legs(), rhs.legs()));
        }
        Ok(Self(&self.0 + &rhs.0))
    }

    fn mul_checked(&self, rhs: &Self) -> SparseResult<Self> {
        if self.0.shape() != rhs.0.shape() {
            return Err(SparseError::ElemShapeMismatch(
                self.legs(), rhs.legs()));
        }
        Ok(Self(&self.0 * &rhs.0))
    }

    fn negate(&self) -> Self { Self(self.0.mapv(|z| -z)) }

    fn conjugate(&self) -> Self { Self(self.0.mapv(|z| z.conj())) }

    fn norm_sqr(&self) -> f64 {
        self.0.iter().map(|z| z.norm_sqr()).sum()
    }

    fn scale(&self, c: f64) -> Self { Self(self.0.mapv(|z| z * c)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::SparseTensor;

    #[test]
    fn elem_ops() {
        let a = Block::from2_re(nd::array![[1.0, 2.0], [3.0, 4.0]]);
        let b = Block::from2_re(nd::array![[1.0, 0.0], [0.0, 1.0]]);
        let s = a.add_checked(&b).unwrap();
        assert_eq!(s.0[[0, 0]], C64::new(2.0, 0.0));
        let p = a.mul_checked(&b).unwrap();
        assert_eq!(p.0[[0, 1]], C64::new(0.0, 0.0));
        assert_eq!(a.norm_sqr(), 30.0);
        let bad = Block::zeros(&[3, 3]);
        assert!(a.add_checked(&bad).is_err());
    }

    #[test]
    fn structural_zero_from_siblings() {
        // container with blocks of coordinate-dependent leg spaces
        let mut t: SparseTensor<Block> = SparseTensor::new(vec![2, 2]);
        t.insert(vec![1, 1], Block::zeros(&[2, 3])).unwrap();
        t.insert(vec![2, 2], Block::zeros(&[4, 5])).unwrap();
        let d = t.to_dense().unwrap();
        // the zero at (1, 2) borrows leg 0 from (1, 1) and leg 1 from (2, 2)
        assert_eq!(d[[0, 1]].legs(), vec![2, 5]);
        assert_eq!(d[[1, 0]].legs(), vec![4, 3]);
    }
}
