//! Uniform matrix-product backgrounds and triangular (Jordan-block)
//! matrix-product operators.
//!
//! A [`UniformMps`] is the narrow background interface the environment
//! solver consumes: one rank-3 site tensor `(D_left, d, D_right)` per site
//! of a periodic unit cell, transfer-map application, and the dominant
//! transfer fixed points (obtained through the crate's own eigensolver).
//!
//! A [`JordanMpo`] stores each site of the operator as a rank-2 sparse
//! container of `d×d` dense operator blocks, block-upper-triangular in the
//! internal bond index. The diagonal of each internal channel is classified
//! as identity, structurally zero, or generic contracting, which are the
//! three cases the environment sweep dispatches on.

use ndarray as nd;
use num_complex::Complex64 as C64;
use once_cell::sync::Lazy;
use thiserror::Error;
use crate::block::Block;
use crate::krylov::{ Flag, Which };
use crate::solve::{ self, EigConfig };
use crate::sparse::{ Elem, SparseError, SparseTensor };

#[derive(Debug, Error)]
pub enum MpoError {
    /// Returned when attempting to create a background or operator for an
    /// empty unit cell.
    #[error("error in unit-cell creation: cannot create for an empty cell")]
    EmptyCell,

    /// Returned when neighboring site tensors have incompatible bond
    /// dimensions.
    #[error("error in MPS creation: bond mismatch between sites {0} and {1}")]
    BondMismatch(usize, usize),

    /// Returned when an MPO site container is not square rank-2.
    #[error("error in MPO creation: site {0} container is not square rank-2")]
    NotSquareMpo(usize),

    /// Returned when MPO sites disagree on the internal bond dimension.
    #[error("error in MPO creation: site {0} has bond dimension {1}, expected {2}")]
    MpoBondMismatch(usize, usize, usize),

    /// Returned when an entry sits below the diagonal.
    #[error("error in MPO creation: entry below the diagonal at site {0}, ({1}, {2})")]
    NotTriangular(usize, usize, usize),

    /// Returned when an operator block is not square, or disagrees with the
    /// site's physical dimension.
    #[error("error in MPO creation: bad operator block at site {0}, ({1}, {2})")]
    BlockShape(usize, usize, usize),

    #[error(transparent)]
    Sparse(#[from] SparseError),
}
use MpoError::*;
pub type MpoResult<T> = Result<T, MpoError>;

pub static SIGMA_X: Lazy<nd::Array2<C64>> = Lazy::new(|| {
    nd::array![
        [C64::new(0.0, 0.0), C64::new(1.0, 0.0)],
        [C64::new(1.0, 0.0), C64::new(0.0, 0.0)],
    ]
});

pub static SIGMA_Z: Lazy<nd::Array2<C64>> = Lazy::new(|| {
    nd::array![
        [C64::new(1.0, 0.0), C64::new(0.0, 0.0)],
        [C64::new(0.0, 0.0), C64::new(-1.0, 0.0)],
    ]
});

pub static IDENT_2: Lazy<nd::Array2<C64>> = Lazy::new(|| {
    nd::Array2::eye(2)
});

/// Apply one site's transfer map from the left, with an optional local
/// operator inserted on the physical leg:
/// `y[b, b'] = Σ conj(A[a, s, b]) O[s, t] x[a, a'] A[a', t, b']`.
pub fn transfer_left_op(
    x: &nd::Array2<C64>,
    op: Option<&nd::Array2<C64>>,
    a: &nd::Array3<C64>,
) -> nd::Array2<C64>
{
    let (d1, d, d2) = a.dim();
    let a_mat = a.view().into_shape((d1, d * d2)).unwrap();
    // z[a, (t, b')] = Σ_{a'} x[a, a'] A[a', t, b']
    let z = x.dot(&a_mat);
    let z = apply_phys(z, op, d1, d, d2);
    // y[b, b'] = Σ_{a, s} conj(A[a, s, b]) z[(a, s), b']
    let a_rows = a.view().into_shape((d1 * d, d2)).unwrap();
    let z_rows = z.into_shape((d1 * d, d2)).unwrap();
    a_rows.mapv(|v| v.conj()).t().dot(&z_rows)
}

/// Apply one site's transfer map from the right, with an optional local
/// operator inserted on the physical leg:
/// `y[a, a'] = Σ conj(A[a, s, b]) O[s, t] A[a', t, b'] x[b, b']`.
pub fn transfer_right_op(
    x: &nd::Array2<C64>,
    op: Option<&nd::Array2<C64>>,
    a: &nd::Array3<C64>,
) -> nd::Array2<C64>
{
    let (d1, d, d2) = a.dim();
    let a_rows = a.view().into_shape((d1 * d, d2)).unwrap();
    // z[(a', t), b] = Σ_{b'} A[a', t, b'] x[b, b']
    let z = a_rows.dot(&x.t());
    let z = apply_phys(z, op, d1, d, x.dim().0);
    // y[a, a'] = Σ_{s, b} conj(A[a, s, b]) z[(a', s), b]
    let a_mat = a.view().into_shape((d1, d * d2)).unwrap();
    let z_mat = z.into_shape((d1, d * x.dim().0)).unwrap();
    a_mat.mapv(|v| v.conj()).dot(&z_mat.t())
}

// contract a local operator into the physical leg of z[(left, phys), right]
fn apply_phys(
    z: nd::Array2<C64>,
    op: Option<&nd::Array2<C64>>,
    dl: usize,
    d: usize,
    dr: usize,
) -> nd::Array2<C64>
{
    let Some(o) = op else { return z };
    let z3 = z.into_shape((dl, d, dr)).unwrap();
    let zt = z3.permuted_axes([1, 0, 2]);
    let zt = zt.as_standard_layout()
        .into_owned()
        .into_shape((d, dl * dr))
        .unwrap();
    let oz = o.dot(&zt)
        .into_shape((d, dl, dr))
        .unwrap();
    let back = oz.permuted_axes([1, 0, 2]);
    back.as_standard_layout()
        .into_owned()
        .into_shape((dl, d * dr))
        .unwrap()
}

/// The bilinear pairing under which the right transfer action is the adjoint
/// of the left one: `Σ x[i, j] y[i, j]`.
pub fn pair(x: &nd::Array2<C64>, y: &nd::Array2<C64>) -> C64 {
    x.iter().zip(y).map(|(a, b)| a * b).sum()
}

/// A uniform matrix-product background over a periodic unit cell.
///
/// Site tensors are rank-3 `(D_left, d, D_right)`. The orthonormality gauge
/// is the caller's contract: the left environment sweep expects
/// left-orthonormal tensors, the right sweep right-orthonormal ones.
#[derive(Clone, Debug)]
pub struct UniformMps {
    tensors: Vec<nd::Array3<C64>>,
}

impl UniformMps {
    /// Create a new background from per-site tensors.
    ///
    /// Fails on an empty cell or mismatched bond dimensions around the ring.
    pub fn new(tensors: Vec<nd::Array3<C64>>) -> MpoResult<Self> {
        if tensors.is_empty() { return Err(EmptyCell); }
        let p = tensors.len();
        for w in 0..p {
            let next = (w + 1) % p;
            if tensors[w].dim().2 != tensors[next].dim().0 {
                return Err(BondMismatch(w, next));
            }
        }
        Ok(Self { tensors })
    }

    /// The unit-cell length.
    pub fn period(&self) -> usize { self.tensors.len() }

    /// The site tensor at `w`.
    pub fn tensor(&self, w: usize) -> &nd::Array3<C64> { &self.tensors[w] }

    /// Left bond dimension at site `w`.
    pub fn bond_dim(&self, w: usize) -> usize { self.tensors[w].dim().0 }

    /// Physical dimension at site `w`.
    pub fn phys_dim(&self, w: usize) -> usize { self.tensors[w].dim().1 }

    /// Apply the whole-cell transfer map from the left.
    pub fn transfer_left_cell(&self, x: &nd::Array2<C64>) -> nd::Array2<C64> {
        self.tensors.iter()
            .fold(x.clone(), |acc, a| transfer_left_op(&acc, None, a))
    }

    /// Apply the whole-cell transfer map from the right.
    pub fn transfer_right_cell(&self, x: &nd::Array2<C64>) -> nd::Array2<C64> {
        self.tensors.iter().rev()
            .fold(x.clone(), |acc, a| transfer_right_op(&acc, None, a))
    }

    /// Dominant right fixed point of the cell transfer map, Hermitized and
    /// normalized to unit trace. Returns the dominant eigenvalue alongside.
    pub fn right_fixed_point(&self, cfg: &EigConfig)
        -> (C64, nd::Array2<C64>, Flag)
    {
        let op = |x: &nd::Array2<C64>| self.transfer_right_cell(x);
        self.fixed_point_of(&op, cfg)
    }

    /// Dominant left fixed point of the cell transfer map, Hermitized and
    /// normalized to unit trace. Returns the dominant eigenvalue alongside.
    pub fn left_fixed_point(&self, cfg: &EigConfig)
        -> (C64, nd::Array2<C64>, Flag)
    {
        let op = |x: &nd::Array2<C64>| self.transfer_left_cell(x);
        self.fixed_point_of(&op, cfg)
    }

    fn fixed_point_of<F>(&self, op: &F, cfg: &EigConfig)
        -> (C64, nd::Array2<C64>, Flag)
    where F: Fn(&nd::Array2<C64>) -> nd::Array2<C64>
    {
        let d = self.bond_dim(0);
        let x0: nd::Array2<C64> = nd::Array2::eye(d);
        let out = solve::eigsolve(op, &x0, 1, Which::LargestAbs, cfg);
        if out.values.is_empty() {
            let fallback = x0.mapv(|z| z / d as f64);
            return (C64::new(0.0, 0.0), fallback, out.flag);
        }
        let lambda = out.values[0];
        let v = &out.vectors[0];
        let tr = v.diag().sum();
        let v = v.mapv(|z| z / tr);
        let herm = (&v + &v.t().mapv(|z| z.conj())).mapv(|z| z * 0.5);
        (lambda, herm, out.flag)
    }
}

/// Diagonal-channel classification of a Jordan MPO.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    /// The whole-cell diagonal product vanishes; the channel is fixed by its
    /// right-hand side alone.
    Zero,
    /// Every site carries the identity; the divergent direction handled by
    /// projection.
    Identity,
    /// A generic contracting channel.
    Generic,
}

/// A block-upper-triangular matrix-product operator over a periodic unit
/// cell.
#[derive(Clone, Debug)]
pub struct JordanMpo {
    sites: Vec<SparseTensor<Block>>,
    phys_dims: Vec<usize>,
    bond: usize,
}

impl JordanMpo {
    /// Create a new operator from per-site sparse containers of operator
    /// blocks.
    ///
    /// Each container must be square rank-2 of a common internal bond
    /// dimension, with entries only on or above the diagonal, and every
    /// stored block square in one common physical dimension per site.
    pub fn new(sites: Vec<SparseTensor<Block>>) -> MpoResult<Self> {
        if sites.is_empty() { return Err(EmptyCell); }
        let bond = match sites[0].shape() {
            [n, m] if n == m => *n,
            _ => return Err(NotSquareMpo(0)),
        };
        let mut phys_dims: Vec<usize> = Vec::with_capacity(sites.len());
        for (w, site) in sites.iter().enumerate() {
            match site.shape() {
                [n, m] if n == m => {
                    if *n != bond {
                        return Err(MpoBondMismatch(w, *n, bond));
                    }
                },
                _ => return Err(NotSquareMpo(w)),
            }
            let mut d: Option<usize> = None;
            for (coord, block) in site.iter() {
                let (a, b) = (coord[0], coord[1]);
                if a > b { return Err(NotTriangular(w, a, b)); }
                match block.legs()[..] {
                    [r, c] if r == c => {
                        if *d.get_or_insert(r) != r {
                            return Err(BlockShape(w, a, b));
                        }
                    },
                    _ => return Err(BlockShape(w, a, b)),
                }
            }
            phys_dims.push(d.unwrap_or(0));
        }
        Ok(Self { sites, phys_dims, bond })
    }

    /// The unit-cell length.
    pub fn period(&self) -> usize { self.sites.len() }

    /// The internal (virtual) bond dimension.
    pub fn bond_dim(&self) -> usize { self.bond }

    /// Physical dimension at site `w`.
    pub fn phys_dim(&self, w: usize) -> usize { self.phys_dims[w] }

    /// The sparse container at site `w`.
    pub fn site(&self, w: usize) -> &SparseTensor<Block> { &self.sites[w] }

    /// The operator block at site `w`, channel entry `(a, b)` (1-based).
    pub fn entry(&self, w: usize, a: usize, b: usize)
        -> Option<nd::Array2<C64>>
    {
        self.sites[w].get(&[a, b]).and_then(Block::as2)
    }

    /// Classify the whole-cell diagonal of channel `i` (1-based).
    pub fn diagonal_kind(&self, i: usize) -> ChannelKind {
        let entries: Vec<Option<nd::Array2<C64>>> =
            (0..self.period())
            .map(|w| self.entry(w, i, i))
            .collect();
        if entries.iter().any(Option::is_none) {
            return ChannelKind::Zero;
        }
        let all_identity = entries.iter().flatten().all(|o| {
            let d = o.dim().0;
            let eye: nd::Array2<C64> = nd::Array2::eye(d);
            (o - &eye).iter().map(|z| z.norm()).fold(0.0, f64::max) < 1e-12
        });
        if all_identity { ChannelKind::Identity } else { ChannelKind::Generic }
    }

    /// The transverse-field Ising operator
    /// `H = -J Σ Z_i Z_{i+1} - h Σ X_i` as a 1-site, 3-channel Jordan MPO.
    pub fn ising(j: f64, h: f64) -> Self {
        let mut site: SparseTensor<Block> = SparseTensor::new(vec![3, 3]);
        site.insert(vec![1, 1], Block::from2(IDENT_2.clone())).unwrap();
        site.insert(vec![1, 2], Block::from2(SIGMA_Z.clone())).unwrap();
        site.insert(
            vec![1, 3],
            Block::from2(SIGMA_X.mapv(|z| z * (-h))),
        ).unwrap();
        site.insert(
            vec![2, 3],
            Block::from2(SIGMA_Z.mapv(|z| z * (-j))),
        ).unwrap();
        site.insert(vec![3, 3], Block::from2(IDENT_2.clone())).unwrap();
        Self {
            sites: vec![site],
            phys_dims: vec![2],
            bond: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // the spin-up product state as a bond-dimension-1 background
    fn product_up() -> UniformMps {
        let mut a: nd::Array3<C64> = nd::Array3::zeros((1, 2, 1));
        a[[0, 0, 0]] = C64::new(1.0, 0.0);
        UniformMps::new(vec![a]).unwrap()
    }

    #[test]
    fn transfer_expectation_values() {
        let mps = product_up();
        let one: nd::Array2<C64> = nd::Array2::eye(1);
        // <Z> = 1, <X> = 0 in the up state
        let z = transfer_left_op(&one, Some(&SIGMA_Z), mps.tensor(0));
        assert!((z[[0, 0]] - C64::new(1.0, 0.0)).norm() < 1e-14);
        let x = transfer_left_op(&one, Some(&SIGMA_X), mps.tensor(0));
        assert!(x[[0, 0]].norm() < 1e-14);
        let zr = transfer_right_op(&one, Some(&SIGMA_Z), mps.tensor(0));
        assert!((zr[[0, 0]] - C64::new(1.0, 0.0)).norm() < 1e-14);
    }

    #[test]
    fn transfer_adjoint_pairing() {
        // <x . T, y> == <x, T . y> for a random-ish D = 2 tensor
        let a = nd::Array3::from_shape_fn((2, 2, 2), |(i, s, j)| {
            C64::new(
                0.3 + 0.25 * (i + 2 * s) as f64 - 0.1 * j as f64,
                0.1 * (s + j) as f64,
            )
        });
        let x = nd::Array2::from_shape_fn(
            (2, 2), |(i, j)| C64::new(1.0 + i as f64, 0.2 * j as f64));
        let y = nd::Array2::from_shape_fn(
            (2, 2), |(i, j)| C64::new(0.5 - 0.3 * j as f64, 0.4 * i as f64));
        let lhs = pair(&transfer_left_op(&x, None, &a), &y);
        let rhs = pair(&x, &transfer_right_op(&y, None, &a));
        assert!((lhs - rhs).norm() < 1e-12, "{lhs} vs {rhs}");
    }

    #[test]
    fn product_state_fixed_points() {
        let mps = product_up();
        let cfg = EigConfig { verbosity: 0, ..EigConfig::default() };
        let (lambda, rho, flag) = mps.right_fixed_point(&cfg);
        assert_eq!(flag.code(), 0);
        assert!((lambda - C64::new(1.0, 0.0)).norm() < 1e-10);
        assert!((rho[[0, 0]] - C64::new(1.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn ising_structure() {
        let mpo = JordanMpo::ising(1.0, 0.5);
        assert_eq!(mpo.bond_dim(), 3);
        assert_eq!(mpo.period(), 1);
        assert_eq!(mpo.diagonal_kind(1), ChannelKind::Identity);
        assert_eq!(mpo.diagonal_kind(2), ChannelKind::Zero);
        assert_eq!(mpo.diagonal_kind(3), ChannelKind::Identity);
        let w13 = mpo.entry(0, 1, 3).unwrap();
        assert!((w13[[0, 1]] - C64::new(-0.5, 0.0)).norm() < 1e-14);
    }

    #[test]
    fn rejects_below_diagonal() {
        let mut site: SparseTensor<Block> = SparseTensor::new(vec![2, 2]);
        site.insert(vec![2, 1], Block::from2(IDENT_2.clone())).unwrap();
        assert!(matches!(
            JordanMpo::new(vec![site]),
            Err(NotTriangular(0, 2, 1)),
        ));
    }
}
