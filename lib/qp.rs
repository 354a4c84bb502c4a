//! Quasi-particle ansatz states over uniform matrix-product backgrounds.
//!
//! An [`InfQp`] pairs a left and a right uniform background with a momentum
//! label, a charge-sector label, and one tangent-space coordinate tensor `X`
//! per site. The per-site null-space tensors `VL` (the directions orthogonal
//! to the left background) and the excitation tensors `B = VL ⊗ X` are
//! derived quantities: computed lazily, cached once computed, and never
//! mutated independently of `(VL, X)`: replacing `X` drops the cached `B`.

use ndarray as nd;
use ndarray_linalg::SVD;
use num_complex::Complex64 as C64;
use once_cell::unsync::OnceCell;
use thiserror::Error;
use crate::mpo::UniformMps;

#[derive(Debug, Error)]
pub enum QpError {
    /// Returned when the two backgrounds have different unit-cell lengths.
    #[error("error in ansatz creation: left period {0} does not match right period {1}")]
    PeriodMismatch(usize, usize),

    /// Returned when the number of coordinate tensors does not match the
    /// period.
    #[error("error in ansatz creation: {0} coordinate tensors for period {1}")]
    CoordinateCount(usize, usize),

    /// Returned when a coordinate tensor has the wrong shape for its site.
    #[error("error in ansatz creation: coordinate tensor {0} has shape ({1}, {2}), expected ({3}, {4})")]
    CoordinateShape(usize, usize, usize, usize, usize),

    /// Returned when the null-space factorization of a background tensor
    /// fails.
    #[error("error in ansatz: null-space factorization failed at site {0}")]
    NullSpace(usize),
}
use QpError::*;
pub type QpResult<T> = Result<T, QpError>;

/// A quasi-particle excitation over infinite uniform backgrounds.
#[derive(Clone, Debug)]
pub struct InfQp {
    mps_left: UniformMps,
    mps_right: UniformMps,
    momentum: f64,
    sector: i32,
    x: Vec<nd::Array2<C64>>,
    vl: OnceCell<Vec<nd::Array3<C64>>>,
    b: OnceCell<Vec<nd::Array3<C64>>>,
}

impl InfQp {
    /// Create a new ansatz state.
    ///
    /// The backgrounds must share a period; `x` holds one coordinate tensor
    /// per site of shape `(D_l d - D_l', D_r')` where `D_l, D_l'` are the
    /// left background's bond dimensions around the site and `D_r'` is the
    /// right background's outgoing bond.
    pub fn new(
        mps_left: UniformMps,
        mps_right: UniformMps,
        momentum: f64,
        sector: i32,
        x: Vec<nd::Array2<C64>>,
    ) -> QpResult<Self>
    {
        if mps_left.period() != mps_right.period() {
            return Err(PeriodMismatch(
                mps_left.period(), mps_right.period()));
        }
        check_coords(&mps_left, &mps_right, &x)?;
        Ok(Self {
            mps_left,
            mps_right,
            momentum,
            sector,
            x,
            vl: OnceCell::new(),
            b: OnceCell::new(),
        })
    }

    pub fn period(&self) -> usize { self.mps_left.period() }

    pub fn momentum(&self) -> f64 { self.momentum }

    pub fn sector(&self) -> i32 { self.sector }

    pub fn mps_left(&self) -> &UniformMps { &self.mps_left }

    pub fn mps_right(&self) -> &UniformMps { &self.mps_right }

    pub fn x(&self) -> &[nd::Array2<C64>] { &self.x }

    /// The per-site null-space tensors of the left background: rank-3
    /// `(D_l, d, D_l d - D_l')`, orthonormal and orthogonal to the
    /// background site tensor. Computed on first use and cached.
    pub fn vl(&self) -> QpResult<&[nd::Array3<C64>]> {
        self.vl.get_or_try_init(|| {
            (0..self.period())
                .map(|w| null_space(&self.mps_left, w))
                .collect()
        }).map(Vec::as_slice)
    }

    /// The per-site excitation tensors `B = VL ⊗ X`: rank-3
    /// `(D_l, d, D_r')`. Computed on first use and cached; derived from
    /// `(VL, X)` and dropped whenever `X` changes.
    pub fn b(&self) -> QpResult<&[nd::Array3<C64>]> {
        let vl = self.vl()?;
        self.b.get_or_try_init(|| {
            vl.iter().zip(&self.x)
                .map(|(v, x)| {
                    let (dl, d, k) = v.dim();
                    let v_mat = v.view().into_shape((dl * d, k)).unwrap();
                    let b_mat = v_mat.dot(x);
                    let dr = x.dim().1;
                    Ok(b_mat.into_shape((dl, d, dr)).unwrap())
                })
                .collect()
        }).map(Vec::as_slice)
    }

    /// Replace the tangent-space coordinates, dropping the cached `B`.
    pub fn set_x(&mut self, x: Vec<nd::Array2<C64>>) -> QpResult<()> {
        check_coords(&self.mps_left, &self.mps_right, &x)?;
        self.x = x;
        self.b = OnceCell::new();
        Ok(())
    }
}

fn check_coords(
    mps_left: &UniformMps,
    mps_right: &UniformMps,
    x: &[nd::Array2<C64>],
) -> QpResult<()>
{
    let p = mps_left.period();
    if x.len() != p { return Err(CoordinateCount(x.len(), p)); }
    for (w, xw) in x.iter().enumerate() {
        let dl = mps_left.bond_dim(w);
        let d = mps_left.phys_dim(w);
        let dl_next = mps_left.bond_dim((w + 1) % p);
        let dr_next = mps_right.bond_dim((w + 1) % p);
        let rows = dl * d - dl_next;
        if xw.dim() != (rows, dr_next) {
            return Err(CoordinateShape(
                w, xw.dim().0, xw.dim().1, rows, dr_next));
        }
    }
    Ok(())
}

// the orthogonal complement of a site tensor's range, from a full SVD
fn null_space(mps: &UniformMps, w: usize) -> QpResult<nd::Array3<C64>> {
    let a = mps.tensor(w);
    let (dl, d, dl_next) = a.dim();
    let m = a.view().into_shape((dl * d, dl_next)).unwrap().to_owned();
    let (u, _, _) = m.svd(true, false).map_err(|_| NullSpace(w))?;
    let u = u.ok_or(NullSpace(w))?;
    let k = dl * d - dl_next;
    let vl = u.slice(nd::s![.., dl_next..]).to_owned();
    Ok(vl.into_shape((dl, d, k)).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product_up() -> UniformMps {
        let mut a: nd::Array3<C64> = nd::Array3::zeros((1, 2, 1));
        a[[0, 0, 0]] = C64::new(1.0, 0.0);
        UniformMps::new(vec![a]).unwrap()
    }

    #[test]
    fn null_space_is_orthogonal_and_orthonormal() {
        let mps = product_up();
        let qp = InfQp::new(
            mps.clone(),
            mps.clone(),
            0.5,
            0,
            vec![nd::Array2::from_elem((1, 1), C64::new(1.0, 0.0))],
        ).unwrap();
        let vl = &qp.vl().unwrap()[0];
        assert_eq!(vl.dim(), (1, 2, 1));
        // orthogonal to the background tensor
        let a = mps.tensor(0);
        let overlap: C64 =
            a.iter().zip(vl.iter()).map(|(ai, vi)| ai.conj() * vi).sum();
        assert!(overlap.norm() < 1e-14);
        // unit norm
        let nrm: f64 = vl.iter().map(|z| z.norm_sqr()).sum();
        assert!((nrm - 1.0).abs() < 1e-14);
    }

    #[test]
    fn b_is_derived_and_cache_drops_on_set_x() {
        let mps = product_up();
        let mut qp = InfQp::new(
            mps.clone(),
            mps,
            0.0,
            1,
            vec![nd::Array2::from_elem((1, 1), C64::new(2.0, 0.0))],
        ).unwrap();
        let b0 = qp.b().unwrap()[0].clone();
        // B = VL X, so its norm scales with X
        let nrm0: f64 = b0.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt();
        assert!((nrm0 - 2.0).abs() < 1e-12);
        qp.set_x(
            vec![nd::Array2::from_elem((1, 1), C64::new(0.5, 0.0))],
        ).unwrap();
        let b1 = qp.b().unwrap()[0].clone();
        let nrm1: f64 = b1.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt();
        assert!((nrm1 - 0.5).abs() < 1e-12);
    }

    #[test]
    fn rejects_period_and_shape_mismatches() {
        let one = product_up();
        let two = UniformMps::new(vec![
            one.tensor(0).clone(),
            one.tensor(0).clone(),
        ]).unwrap();
        assert!(matches!(
            InfQp::new(one.clone(), two, 0.0, 0, Vec::new()),
            Err(PeriodMismatch(1, 2)),
        ));
        assert!(matches!(
            InfQp::new(
                one.clone(),
                one.clone(),
                0.0,
                0,
                vec![nd::Array2::from_elem((2, 2), C64::new(0.0, 0.0))],
            ),
            Err(CoordinateShape(0, 2, 2, 1, 1)),
        ));
    }
}
