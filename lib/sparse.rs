//! Block-sparse multi-dimensional container keyed by multi-index.
//!
//! A [`SparseTensor`] maps a set of distinct 1-based multi-indices to opaque
//! element values; every unstored position denotes a structural zero. Stored
//! elements may be bare scalars or dense tensor blocks carrying their own
//! internal leg spaces; the container is generic over the [`Elem`]
//! capability interface and never branches on the concrete element kind.
//!
//! Linear/multi-index conversions all go through [`crate::coord`], so the
//! whole crate shares a single column-major, 1-based addressing convention.
//!
//! # Example
//!
//! ```
//! use transfer_net::sparse::SparseTensor;
//!
//! // a 2x2 matrix with nonzeros at (1,1) and (2,2)
//! let a: SparseTensor<f64> = SparseTensor::from_coords(
//!     vec![vec![1, 1], vec![2, 2]],
//!     vec![2.0, 3.0],
//!     Some(vec![2, 2]),
//! ).unwrap();
//!
//! // a 2x1 column with nonzeros at (1,1) and (2,1)
//! let b: SparseTensor<f64> = SparseTensor::from_coords(
//!     vec![vec![1, 1], vec![2, 1]],
//!     vec![5.0, 1.0],
//!     Some(vec![2, 1]),
//! ).unwrap();
//!
//! let c = a.matmul(&b).unwrap();
//! assert_eq!(c.get(&[1, 1]), Some(&10.0));
//! assert_eq!(c.get(&[2, 1]), Some(&3.0));
//! ```

use std::fmt;
use itertools::Itertools;
use ndarray::{ self as nd, Dimension, ShapeBuilder };
use num_complex::Complex64 as C64;
use rustc_hash::FxHashMap;
use thiserror::Error;
use crate::coord::{ self, CoordError };

#[derive(Debug, Error, PartialEq)]
pub enum SparseError {
    /// Returned when the number of index rows does not match the number of
    /// values (and the values cannot be broadcast).
    #[error("error in sparse construction: {0} index rows but {1} values")]
    CountMismatch(usize, usize),

    /// Returned when index rows disagree on rank.
    #[error("error in sparse construction: index row of rank {0}, expected {1}")]
    RaggedIndex(usize, usize),

    /// Returned when the same multi-index appears twice.
    #[error("error in sparse construction: duplicate index row {0:?}")]
    DuplicateIndex(Vec<usize>),

    /// Returned when a supplied index falls outside a supplied shape.
    #[error("error in sparse construction: index {0:?} outside shape {1:?}")]
    IndexOutsideShape(Vec<usize>, Vec<usize>),

    /// Returned when a reshape target holds a different number of positions.
    #[error("error in reshape: cannot reshape {0} positions into shape {1:?}")]
    ReshapeCountMismatch(usize, Vec<usize>),

    /// Returned when a permutation order is not a permutation of the axes.
    #[error("error in permute: {0:?} is not a permutation of 0..{1}")]
    BadPermutation(Vec<usize>, usize),

    /// Returned when an add is attempted between tensors with incompatible
    /// leading dimensions.
    #[error("error in add: shapes {0:?} and {1:?} are incompatible")]
    ShapeMismatchAdd(Vec<usize>, Vec<usize>),

    /// Returned when an elementwise multiply is attempted between tensors of
    /// different shapes.
    #[error("error in elementwise multiply: shapes {0:?} and {1:?} differ")]
    ShapeMismatchMul(Vec<usize>, Vec<usize>),

    /// Returned when a matrix multiply is attempted on a non-rank-2 operand.
    #[error("error in matrix multiply: operands must have rank 2")]
    NotRank2,

    /// Returned when matrix-multiply inner dimensions disagree.
    #[error("error in matrix multiply: inner dimensions {0} and {1} differ")]
    InnerDimMismatch(usize, usize),

    /// Returned when the two contracted-axis lists have different lengths.
    #[error("error in contraction: contracted-axis lists have lengths {0} and {1}")]
    ContractArityMismatch(usize, usize),

    /// Returned when a contracted axis is out of range or repeated.
    #[error("error in contraction: bad contracted axis {0} for rank {1}")]
    BadContractAxis(usize, usize),

    /// Returned when a pair of contracted axes have different lengths.
    #[error("error in contraction: axis {0} of length {1} contracted against axis {2} of length {3}")]
    ContractAxisMismatch(usize, usize, usize, usize),

    /// Returned when the number of axis selectors does not match the rank.
    #[error("error in indexing: {0} axis selectors for rank {1}")]
    SelectorRank(usize, usize),

    /// Returned when one axis selector repeats an index.
    #[error("error in indexing: duplicate index {1} in selector for axis {0}")]
    DuplicateSelector(usize, usize),

    /// Returned when an axis selector holds an index outside the axis bound.
    #[error("error in indexing: index {1} in selector for axis {0} outside bound {2}")]
    SelectorOutOfRange(usize, usize, usize),

    /// Returned when an assignment source does not match the selector shape.
    #[error("error in assignment: source shape {0:?} does not match selector shape {1:?}")]
    AssignShapeMismatch(Vec<usize>, Vec<usize>),

    /// Returned when element arithmetic is attempted between blocks with
    /// different leg spaces.
    #[error("error in element arithmetic: leg spaces {0:?} and {1:?} differ")]
    ElemShapeMismatch(Vec<usize>, Vec<usize>),

    /// Returned when a structural zero must be materialized but neither a
    /// stored sibling, the prototype, nor a shape-free default can type it.
    #[error("cannot type a structural zero: no stored sibling or prototype")]
    NoZeroPrototype,

    #[error(transparent)]
    Coord(#[from] CoordError),
}
use SparseError::*;
pub type SparseResult<T> = Result<T, SparseError>;

/// Capability interface for values stored in a [`SparseTensor`].
///
/// Implementations form a closed set of element kinds (bare scalars and
/// dense tensor blocks), and the container code is written entirely against
/// this interface.
pub trait Elem: Clone + PartialEq + fmt::Debug {
    /// Per-axis leg-space descriptor. Empty for scalar kinds.
    fn legs(&self) -> Vec<usize>;

    /// Synthesize a structural zero with the given leg spaces, if the kind
    /// supports them.
    fn zero_from_legs(legs: &[usize]) -> Option<Self>;

    /// A structural zero matching the leg spaces of `self`.
    fn zero_like(&self) -> Self;

    /// The shape-free zero used only when nothing else is available to type a
    /// structural zero. `None` for kinds that always carry leg spaces.
    fn default_zero() -> Option<Self>;

    /// Elementwise sum. Fails on mismatched leg spaces.
    fn add_checked(&self, rhs: &Self) -> SparseResult<Self>;

    /// Elementwise (pairwise) product. Fails on mismatched leg spaces.
    fn mul_checked(&self, rhs: &Self) -> SparseResult<Self>;

    /// Additive inverse.
    fn negate(&self) -> Self;

    /// Elementwise complex conjugate.
    fn conjugate(&self) -> Self;

    /// Squared Frobenius norm.
    fn norm_sqr(&self) -> f64;

    /// Multiply by a real factor.
    fn scale(&self, c: f64) -> Self;
}

impl Elem for f64 {
    fn legs(&self) -> Vec<usize> { Vec::new() }

    fn zero_from_legs(legs: &[usize]) -> Option<Self> {
        legs.is_empty().then_some(0.0)
    }

    fn zero_like(&self) -> Self { 0.0 }

    fn default_zero() -> Option<Self> { Some(0.0) }

    fn add_checked(&self, rhs: &Self) -> SparseResult<Self> { Ok(self + rhs) }

    fn mul_checked(&self, rhs: &Self) -> SparseResult<Self> { Ok(self * rhs) }

    fn negate(&self) -> Self { -self }

    fn conjugate(&self) -> Self { *self }

    fn norm_sqr(&self) -> f64 { self * self }

    fn scale(&self, c: f64) -> Self { self * c }
}

impl Elem for C64 {
    fn legs(&self) -> Vec<usize> { Vec::new() }

    fn zero_from_legs(legs: &[usize]) -> Option<Self> {
        legs.is_empty().then_some(Self::new(0.0, 0.0))
    }

    fn zero_like(&self) -> Self { Self::new(0.0, 0.0) }

    fn default_zero() -> Option<Self> { Some(Self::new(0.0, 0.0)) }

    fn add_checked(&self, rhs: &Self) -> SparseResult<Self> { Ok(self + rhs) }

    fn mul_checked(&self, rhs: &Self) -> SparseResult<Self> { Ok(self * rhs) }

    fn negate(&self) -> Self { -self }

    fn conjugate(&self) -> Self { self.conj() }

    fn norm_sqr(&self) -> f64 { C64::norm_sqr(self) }

    fn scale(&self, c: f64) -> Self { self * c }
}

/// Per-axis index selector for subscript reads and writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AxisSel {
    /// Every index along the axis.
    All,
    /// An explicit list of 1-based indices.
    Take(Vec<usize>),
}

/// Result of a general tensor contraction.
///
/// A contraction over every axis of both operands degenerates to a bare
/// scalar, and a result with every position occupied is handed over in its
/// dense representation.
#[derive(Clone, Debug, PartialEq)]
pub enum Contracted<A> {
    Scalar(A),
    Sparse(SparseTensor<A>),
    Dense(nd::ArrayD<A>),
}

impl<A> Contracted<A>
where A: Elem
{
    /// Return the bare scalar, if the contraction produced one.
    pub fn scalar(self) -> Option<A> {
        match self {
            Self::Scalar(a) => Some(a),
            _ => None,
        }
    }

    /// Convert any of the three representations into a sparse container.
    pub fn into_sparse(self) -> SparseTensor<A> {
        match self {
            Self::Scalar(a) => {
                let mut t = SparseTensor::new(vec![1]);
                t.proto = Some(a.zero_like());
                t.vals.insert(vec![1], a);
                t
            },
            Self::Sparse(t) => t,
            Self::Dense(d) => SparseTensor::from_dense(&d),
        }
    }
}

/// Block-sparse multi-dimensional array.
///
/// Maps distinct 1-based multi-indices to stored elements; unstored positions
/// are structural zeros. The container carries an explicit structural-zero
/// prototype recorded at construction so that the element kind never has to
/// be re-deduced from whatever happens to be stored.
///
/// Operations either mutate the receiver in place where that is unambiguous
/// ([`Self::permute`], [`Self::normalize`], writes) or return a new instance.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseTensor<A> {
    shape: Vec<usize>,
    vals: FxHashMap<Vec<usize>, A>,
    proto: Option<A>,
}

impl<A> SparseTensor<A>
where A: Elem
{
    /// Create an empty container with the given shape.
    pub fn new(shape: Vec<usize>) -> Self {
        Self { shape, vals: FxHashMap::default(), proto: None }
    }

    /// Create an empty container with an explicit structural-zero prototype.
    pub fn with_proto(shape: Vec<usize>, proto: A) -> Self {
        Self { shape, vals: FxHashMap::default(), proto: Some(proto.zero_like()) }
    }

    /// Create a container from explicit index rows and values.
    ///
    /// A single value is broadcast across all index rows. If `shape` is
    /// omitted it is inferred as the per-axis maximum index. Fails on
    /// index/value count mismatch, ragged or duplicate index rows, zero
    /// coordinates, or indices outside a supplied shape.
    pub fn from_coords(
        indices: Vec<Vec<usize>>,
        values: Vec<A>,
        shape: Option<Vec<usize>>,
    ) -> SparseResult<Self>
    {
        let values: Vec<A> =
            if values.len() == 1 && indices.len() > 1 {
                std::iter::repeat(values[0].clone())
                    .take(indices.len())
                    .collect()
            } else {
                values
            };
        if indices.len() != values.len() {
            return Err(CountMismatch(indices.len(), values.len()));
        }
        let rank: usize =
            shape.as_ref().map(Vec::len)
            .or_else(|| indices.first().map(Vec::len))
            .unwrap_or(0);
        let mut inferred: Vec<usize> = vec![0; rank];
        for row in indices.iter() {
            if row.len() != rank { return Err(RaggedIndex(row.len(), rank)); }
            for (k, &c) in row.iter().enumerate() {
                if c == 0 { return Err(CoordError::ZeroCoordinate(k).into()); }
                inferred[k] = inferred[k].max(c);
            }
        }
        let shape: Vec<usize> = match shape {
            Some(s) => {
                for row in indices.iter() {
                    if row.iter().zip(&s).any(|(&c, &dim)| c > dim) {
                        return Err(IndexOutsideShape(row.clone(), s));
                    }
                }
                s
            },
            None => inferred,
        };
        let proto: Option<A> = values.first().map(Elem::zero_like);
        let mut vals: FxHashMap<Vec<usize>, A> = FxHashMap::default();
        for (row, val) in indices.into_iter().zip(values) {
            if vals.insert(row.clone(), val).is_some() {
                return Err(DuplicateIndex(row));
            }
        }
        Ok(Self { shape, vals, proto })
    }

    /// Create a container from a dense array, storing every position
    /// explicitly (including zeros).
    ///
    /// Intended only for small or debugging conversions.
    pub fn from_dense(arr: &nd::ArrayD<A>) -> Self {
        let shape: Vec<usize> = arr.shape().to_vec();
        let proto: Option<A> = arr.first().map(Elem::zero_like);
        let vals: FxHashMap<Vec<usize>, A> =
            arr.indexed_iter()
            .map(|(idx, val)| {
                let coord: Vec<usize> =
                    idx.slice().iter().map(|&i| i + 1).collect();
                (coord, val.clone())
            })
            .collect();
        Self { shape, vals, proto }
    }

    /// The per-axis extents.
    pub fn shape(&self) -> &[usize] { &self.shape }

    /// The number of axes.
    pub fn rank(&self) -> usize { self.shape.len() }

    /// The number of stored entries.
    pub fn nnz(&self) -> usize { self.vals.len() }

    /// The total number of addressable positions.
    pub fn numel(&self) -> usize { coord::numel(&self.shape) }

    /// `true` if no entries are stored.
    pub fn is_empty(&self) -> bool { self.vals.is_empty() }

    /// `true` if every position holds a stored entry.
    pub fn is_full(&self) -> bool { self.nnz() == self.numel() }

    /// The structural-zero prototype, if one was recorded.
    pub fn proto(&self) -> Option<&A> { self.proto.as_ref() }

    /// Record a structural-zero prototype.
    pub fn set_proto(&mut self, proto: A) { self.proto = Some(proto.zero_like()); }

    /// Reference to the stored entry at `coord`, if any.
    pub fn get(&self, coord: &[usize]) -> Option<&A> { self.vals.get(coord) }

    /// Insert or update the entry at `coord`. Returns the previous value.
    ///
    /// Fails if `coord` lies outside the shape; the shape never grows through
    /// this method.
    pub fn insert(&mut self, coord: Vec<usize>, val: A)
        -> SparseResult<Option<A>>
    {
        coord::multi_to_linear(&self.shape, &coord)?;
        if self.proto.is_none() { self.proto = Some(val.zero_like()); }
        Ok(self.vals.insert(coord, val))
    }

    /// Iterate over stored entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<usize>, &A)> {
        self.vals.iter()
    }

    /// Iterate over stored entries in the deterministic [`Self::find`] order.
    pub fn iter_sorted(&self) -> impl Iterator<Item = (&Vec<usize>, &A)> {
        self.vals.iter()
            .sorted_by(|(a, _), (b, _)| a.iter().rev().cmp(b.iter().rev()))
    }

    /// Stored coordinates in a fixed last-axis-major sort order, i.e. the
    /// order of ascending column-major linear position.
    pub fn find(&self) -> Vec<Vec<usize>> {
        self.vals.keys().cloned()
            .sorted_by(|a, b| a.iter().rev().cmp(b.iter().rev()))
            .collect()
    }

    /// The first `k` coordinates of [`Self::find`].
    pub fn find_first(&self, k: usize) -> Vec<Vec<usize>> {
        self.find().into_iter().take(k).collect()
    }

    /// The last `k` coordinates of [`Self::find`], still in sorted order.
    pub fn find_last(&self, k: usize) -> Vec<Vec<usize>> {
        let found = self.find();
        let skip = found.len().saturating_sub(k);
        found.into_iter().skip(skip).collect()
    }

    /// Reindex the axes in place: after the call, axis `k` is the old axis
    /// `order[k]`. Axis order is metadata only, so no element is touched.
    ///
    /// Fails if `order` is not a permutation of `0..rank`.
    pub fn permute(&mut self, order: &[usize]) -> SparseResult<&mut Self> {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        if order.len() != rank
            || order.iter().any(|&o| {
                o >= rank || std::mem::replace(&mut seen[o.min(rank - 1)], true)
            })
        {
            return Err(BadPermutation(order.to_vec(), rank));
        }
        self.shape = order.iter().map(|&o| self.shape[o]).collect();
        self.vals =
            self.vals.drain()
            .map(|(coord, val)| {
                let permuted: Vec<usize> =
                    order.iter().map(|&o| coord[o]).collect();
                (permuted, val)
            })
            .collect();
        Ok(self)
    }

    /// Owned variant of [`Self::permute`].
    pub fn permuted(mut self, order: &[usize]) -> SparseResult<Self> {
        self.permute(order)?;
        Ok(self)
    }

    /// Re-derive every stored multi-index for a new shape by round-tripping
    /// through the flat linear position.
    ///
    /// Fails if the new shape holds a different number of positions.
    pub fn reshape(&self, new_shape: &[usize]) -> SparseResult<Self> {
        if coord::numel(new_shape) != self.numel() {
            return Err(ReshapeCountMismatch(self.numel(), new_shape.to_vec()));
        }
        let vals: FxHashMap<Vec<usize>, A> =
            self.vals.iter()
            .map(|(c, v)| {
                let lin = coord::multi_to_linear(&self.shape, c)?;
                let c2 = coord::linear_to_multi(new_shape, lin)?;
                Ok((c2, v.clone()))
            })
            .collect::<SparseResult<_>>()?;
        Ok(Self {
            shape: new_shape.to_vec(),
            vals,
            proto: self.proto.clone(),
        })
    }

    /// Synthesize the structural zero for an unstored position.
    ///
    /// For block-kind elements, each leg space is deduced from a stored
    /// sibling sharing that axis's coordinate; when some leg cannot be
    /// deduced, the prototype is the (warned) fallback.
    fn structural_zero(&self, coord: &[usize]) -> SparseResult<A> {
        if let Some(p) = &self.proto {
            if p.legs().is_empty() { return Ok(p.zero_like()); }
        }
        let rank = self.rank();
        let mut legs: Vec<Option<usize>> = vec![None; rank];
        for (c, v) in self.vals.iter() {
            let vlegs = v.legs();
            for k in 0..rank {
                if legs[k].is_none() && c[k] == coord[k] {
                    legs[k] = vlegs.get(k).copied();
                }
            }
        }
        if rank > 0 && legs.iter().all(Option::is_some) {
            let legs: Vec<usize> = legs.into_iter().flatten().collect();
            if let Some(z) = A::zero_from_legs(&legs) { return Ok(z); }
        }
        if let Some(p) = &self.proto {
            log::warn!(
                "no stored sibling types the structural zero at {:?}; \
                falling back to the prototype's leg spaces",
                coord,
            );
            return Ok(p.zero_like());
        }
        A::default_zero().ok_or(NoZeroPrototype)
    }

    /// Materialize every position as a dense array.
    ///
    /// Fails only when a structural zero cannot be typed at all (nothing
    /// stored, no prototype, and the element kind has no shape-free zero).
    pub fn to_dense(&self) -> SparseResult<nd::ArrayD<A>> {
        let n = self.numel();
        let mut elems: Vec<A> = Vec::with_capacity(n);
        for pos in 1..=n {
            let c = coord::linear_to_multi(&self.shape, pos)?;
            match self.vals.get(&c) {
                Some(v) => { elems.push(v.clone()); },
                None => { elems.push(self.structural_zero(&c)?); },
            }
        }
        let arr =
            nd::ArrayD::from_shape_vec(nd::IxDyn(&self.shape).f(), elems)
            .unwrap();
        Ok(arr)
    }

    /// Elementwise additive inverse over stored values; implicit zeros are
    /// unaffected.
    pub fn negate(&self) -> Self {
        self.map_values(Elem::negate)
    }

    /// Elementwise complex conjugate over stored values; implicit zeros are
    /// unaffected.
    pub fn conj(&self) -> Self {
        self.map_values(Elem::conjugate)
    }

    /// Multiply every stored value by a real factor.
    pub fn scale(&self, c: f64) -> Self {
        self.map_values(|v| v.scale(c))
    }

    fn map_values<F>(&self, f: F) -> Self
    where F: Fn(&A) -> A
    {
        Self {
            shape: self.shape.clone(),
            vals: self.vals.iter().map(|(c, v)| (c.clone(), f(v))).collect(),
            proto: self.proto.clone(),
        }
    }

    /// Compute the sum of `self` and `rhs`.
    ///
    /// The shorter-ranked operand is treated as carrying trailing singleton
    /// axes; every leading dimension present in both operands must agree.
    /// Positions stored in both operands sum; positions stored in only one
    /// keep that value. When either operand is logically dense (every
    /// position stored) and the shapes agree exactly, the sum is carried out
    /// densely and every position of the result is stored.
    pub fn add_checked(&self, rhs: &Self) -> SparseResult<Self> {
        let ra = self.rank();
        let rb = rhs.rank();
        let shared = ra.min(rb);
        if self.shape[..shared] != rhs.shape[..shared] {
            return Err(ShapeMismatchAdd(self.shape.clone(), rhs.shape.clone()));
        }
        if ra == rb && (self.is_full() || rhs.is_full()) {
            let a = self.to_dense()?;
            let mut out = a;
            for (c, v) in rhs.vals.iter() {
                let idx: Vec<usize> = c.iter().map(|&i| i - 1).collect();
                let sum = out[nd::IxDyn(&idx)].add_checked(v)?;
                out[nd::IxDyn(&idx)] = sum;
            }
            return Ok(Self::from_dense(&out));
        }
        let rank = ra.max(rb);
        let mut shape: Vec<usize> =
            if ra >= rb { self.shape.clone() } else { rhs.shape.clone() };
        shape.iter_mut().for_each(|d| { *d = (*d).max(1); });
        let pad = |c: &[usize]| -> Vec<usize> {
            let mut c = c.to_vec();
            c.resize(rank, 1);
            c
        };
        let mut vals: FxHashMap<Vec<usize>, A> =
            self.vals.iter()
            .map(|(c, v)| (pad(c), v.clone()))
            .collect();
        for (c, v) in rhs.vals.iter() {
            let c = pad(c);
            match vals.get(&c) {
                Some(cur) => {
                    let sum = cur.add_checked(v)?;
                    vals.insert(c, sum);
                },
                None => { vals.insert(c, v.clone()); },
            }
        }
        let proto = self.proto.clone().or_else(|| rhs.proto.clone());
        Ok(Self { shape, vals, proto })
    }

    /// Compute the elementwise product of `self` and `rhs`.
    ///
    /// An operand with a single addressable position is broadcast across the
    /// other's stored values; otherwise the shapes must agree exactly and the
    /// result holds the intersection of the stored-index sets (zero times
    /// anything vanishes).
    pub fn hadamard(&self, rhs: &Self) -> SparseResult<Self> {
        if self.numel() == 1 {
            return broadcast_mul(self, rhs, rhs.shape.clone(), false);
        }
        if rhs.numel() == 1 {
            return broadcast_mul(rhs, self, self.shape.clone(), true);
        }
        if self.shape != rhs.shape {
            return Err(ShapeMismatchMul(self.shape.clone(), rhs.shape.clone()));
        }
        let mut vals: FxHashMap<Vec<usize>, A> = FxHashMap::default();
        for (c, v) in self.vals.iter() {
            if let Some(w) = rhs.vals.get(c) {
                vals.insert(c.clone(), v.mul_checked(w)?);
            }
        }
        let proto =
            vals.values().next().map(Elem::zero_like)
            .or_else(|| self.proto.clone());
        Ok(Self { shape: self.shape.clone(), vals, proto })
    }

    /// Sum of elementwise products over indices stored in *both* operands.
    ///
    /// Indices stored in only one operand contribute nothing; an empty
    /// intersection yields the additive identity.
    pub fn dot(&self, rhs: &Self) -> SparseResult<A> {
        if self.shape != rhs.shape {
            return Err(ShapeMismatchMul(self.shape.clone(), rhs.shape.clone()));
        }
        let mut acc: Option<A> = None;
        for (c, v) in self.vals.iter() {
            if let Some(w) = rhs.vals.get(c) {
                let prod = v.mul_checked(w)?;
                acc = Some(match acc {
                    Some(cur) => cur.add_checked(&prod)?,
                    None => prod,
                });
            }
        }
        match acc {
            Some(a) => Ok(a),
            None =>
                self.proto.clone()
                .or_else(|| rhs.proto.clone())
                .or_else(A::default_zero)
                .ok_or(NoZeroPrototype),
        }
    }

    /// Sparse matrix product of two rank-2 containers.
    ///
    /// For every stored `a[i, k]` and `b[k, j]`, accumulates
    /// `a[i, k] * b[k, j]` into position `(i, j)`, combining duplicates by
    /// addition. Fails unless both operands have rank 2 with matching inner
    /// dimensions.
    pub fn matmul(&self, rhs: &Self) -> SparseResult<Self> {
        if self.rank() != 2 || rhs.rank() != 2 { return Err(NotRank2); }
        if self.shape[1] != rhs.shape[0] {
            return Err(InnerDimMismatch(self.shape[1], rhs.shape[0]));
        }
        let mut by_row: FxHashMap<usize, Vec<(usize, &A)>> =
            FxHashMap::default();
        for (c, v) in rhs.vals.iter() {
            by_row.entry(c[0]).or_default().push((c[1], v));
        }
        let mut vals: FxHashMap<Vec<usize>, A> = FxHashMap::default();
        for (c, v) in self.vals.iter() {
            let Some(row) = by_row.get(&c[1]) else { continue };
            for &(j, w) in row.iter() {
                let prod = v.mul_checked(w)?;
                let out = vec![c[0], j];
                match vals.get(&out) {
                    Some(cur) => {
                        let sum = cur.add_checked(&prod)?;
                        vals.insert(out, sum);
                    },
                    None => { vals.insert(out, prod); },
                }
            }
        }
        let proto =
            vals.values().next().map(Elem::zero_like)
            .or_else(|| self.proto.clone())
            .or_else(|| rhs.proto.clone());
        Ok(Self { shape: vec![self.shape[0], rhs.shape[1]], vals, proto })
    }

    /// General tensor contraction over explicit (0-based) axis pairs.
    ///
    /// Both operands are permuted and reshaped so that the contracted axes
    /// collapse into a single flattened axis, the nonzero-pair accumulation
    /// of [`Self::matmul`] runs on the resulting matrices, and the product is
    /// reshaped to the concatenation of `self`'s and `rhs`'s uncontracted
    /// axes (in that order). A fully contracted pair degenerates to a bare
    /// scalar, and a fully occupied result is handed over densely.
    pub fn contract(
        &self,
        rhs: &Self,
        axes_a: &[usize],
        axes_b: &[usize],
    ) -> SparseResult<Contracted<A>>
    {
        if axes_a.len() != axes_b.len() {
            return Err(ContractArityMismatch(axes_a.len(), axes_b.len()));
        }
        check_axes(axes_a, self.rank())?;
        check_axes(axes_b, rhs.rank())?;
        for (&ka, &kb) in axes_a.iter().zip(axes_b) {
            if self.shape[ka] != rhs.shape[kb] {
                return Err(ContractAxisMismatch(
                    ka, self.shape[ka], kb, rhs.shape[kb]));
            }
        }
        let ua: Vec<usize> =
            (0..self.rank()).filter(|k| !axes_a.contains(k)).collect();
        let ub: Vec<usize> =
            (0..rhs.rank()).filter(|k| !axes_b.contains(k)).collect();
        let m: usize = ua.iter().map(|&k| self.shape[k]).product();
        let n: usize = ub.iter().map(|&k| rhs.shape[k]).product();
        let kk: usize = axes_a.iter().map(|&k| self.shape[k]).product();

        let order_a: Vec<usize> =
            ua.iter().chain(axes_a.iter()).copied().collect();
        let order_b: Vec<usize> =
            axes_b.iter().chain(ub.iter()).copied().collect();
        let a2 = self.clone().permuted(&order_a)?.reshape(&[m, kk])?;
        let b2 = rhs.clone().permuted(&order_b)?.reshape(&[kk, n])?;
        let c = a2.matmul(&b2)?;

        let out_shape: Vec<usize> =
            ua.iter().map(|&k| self.shape[k])
            .chain(ub.iter().map(|&k| rhs.shape[k]))
            .collect();
        if out_shape.is_empty() {
            let val = match c.get(&[1, 1]) {
                Some(v) => v.clone(),
                None =>
                    c.proto.clone()
                    .or_else(A::default_zero)
                    .ok_or(NoZeroPrototype)?,
            };
            return Ok(Contracted::Scalar(val));
        }
        let out = c.reshape(&out_shape)?;
        if out.is_full() && out.nnz() > 0 {
            Ok(Contracted::Dense(out.to_dense()?))
        } else {
            Ok(Contracted::Sparse(out))
        }
    }

    /// Subscript read over one selector per axis.
    ///
    /// Produces a new container whose shape matches the selector
    /// cardinalities, with retained entries remapped to the compacted
    /// coordinate space. Fails on duplicate or out-of-range indices within a
    /// selector.
    pub fn select(&self, sels: &[AxisSel]) -> SparseResult<Self> {
        if sels.len() != self.rank() {
            return Err(SelectorRank(sels.len(), self.rank()));
        }
        let mut shape: Vec<usize> = Vec::with_capacity(self.rank());
        // old 1-based index -> new 1-based index, None = identity
        let mut remaps: Vec<Option<FxHashMap<usize, usize>>> = Vec::new();
        for (k, sel) in sels.iter().enumerate() {
            match sel {
                AxisSel::All => {
                    shape.push(self.shape[k]);
                    remaps.push(None);
                },
                AxisSel::Take(list) => {
                    let mut remap: FxHashMap<usize, usize> =
                        FxHashMap::default();
                    for (pos, &idx) in list.iter().enumerate() {
                        if idx == 0 || idx > self.shape[k] {
                            return Err(
                                SelectorOutOfRange(k, idx, self.shape[k]));
                        }
                        if remap.insert(idx, pos + 1).is_some() {
                            return Err(DuplicateSelector(k, idx));
                        }
                    }
                    shape.push(list.len());
                    remaps.push(Some(remap));
                },
            }
        }
        let mut vals: FxHashMap<Vec<usize>, A> = FxHashMap::default();
        'entries: for (c, v) in self.vals.iter() {
            let mut mapped: Vec<usize> = Vec::with_capacity(c.len());
            for (ck, remap) in c.iter().zip(&remaps) {
                match remap {
                    None => { mapped.push(*ck); },
                    Some(remap) => {
                        match remap.get(ck) {
                            Some(&new) => { mapped.push(new); },
                            None => { continue 'entries; },
                        }
                    },
                }
            }
            vals.insert(mapped, v.clone());
        }
        Ok(Self { shape, vals, proto: self.proto.clone() })
    }

    /// Linear subscript read: select flat positions, producing a rank-1
    /// container. Duplicate positions are rejected.
    pub fn take_linear(&self, positions: &[usize]) -> SparseResult<Self> {
        let mut remap: FxHashMap<usize, usize> = FxHashMap::default();
        for (pos, &lin) in positions.iter().enumerate() {
            if lin == 0 || lin > self.numel() {
                return Err(CoordError::LinearOutOfBounds(
                    lin, self.numel()).into());
            }
            if remap.insert(lin, pos + 1).is_some() {
                return Err(DuplicateSelector(0, lin));
            }
        }
        let mut vals: FxHashMap<Vec<usize>, A> = FxHashMap::default();
        for (c, v) in self.vals.iter() {
            let lin = coord::multi_to_linear(&self.shape, c)?;
            if let Some(&new) = remap.get(&lin) {
                vals.insert(vec![new], v.clone());
            }
        }
        Ok(Self {
            shape: vec![positions.len()],
            vals,
            proto: self.proto.clone(),
        })
    }

    /// Subscript write over one selector per axis, with every written
    /// position stored explicitly (even structural zeros of the source).
    ///
    /// The target set is the cartesian product of the per-axis index lists;
    /// `src` must either match the selector shape or hold a single position
    /// to broadcast. Targets outside the current shape are an error here;
    /// growth is the explicit opt-in [`Self::assign_extend`].
    pub fn assign(&mut self, sels: &[AxisSel], src: &Self)
        -> SparseResult<&mut Self>
    {
        self.assign_impl(sels, src, false)
    }

    /// [`Self::assign`], with out-of-range targets growing the shape to fit
    /// (the shape never shrinks).
    pub fn assign_extend(&mut self, sels: &[AxisSel], src: &Self)
        -> SparseResult<&mut Self>
    {
        self.assign_impl(sels, src, true)
    }

    fn assign_impl(&mut self, sels: &[AxisSel], src: &Self, extend: bool)
        -> SparseResult<&mut Self>
    {
        if sels.len() != self.rank() {
            return Err(SelectorRank(sels.len(), self.rank()));
        }
        let mut lists: Vec<Vec<usize>> = Vec::with_capacity(sels.len());
        for (k, sel) in sels.iter().enumerate() {
            match sel {
                AxisSel::All => {
                    lists.push((1..=self.shape[k]).collect());
                },
                AxisSel::Take(list) => {
                    let mut seen: FxHashMap<usize, ()> = FxHashMap::default();
                    for &idx in list.iter() {
                        if idx == 0 {
                            return Err(CoordError::ZeroCoordinate(k).into());
                        }
                        if !extend && idx > self.shape[k] {
                            return Err(
                                SelectorOutOfRange(k, idx, self.shape[k]));
                        }
                        if seen.insert(idx, ()).is_some() {
                            return Err(DuplicateSelector(k, idx));
                        }
                    }
                    lists.push(list.clone());
                },
            }
        }
        let sel_shape: Vec<usize> = lists.iter().map(Vec::len).collect();
        let broadcast = src.numel() == 1;
        if !broadcast && src.shape != sel_shape {
            return Err(AssignShapeMismatch(src.shape.clone(), sel_shape));
        }
        if extend {
            for (k, list) in lists.iter().enumerate() {
                let hi = list.iter().copied().max().unwrap_or(0);
                if hi > self.shape[k] { self.shape[k] = hi; }
            }
        }
        let src_broadcast_coord: Vec<usize> = vec![1; src.rank()];
        let positions =
            lists.iter()
            .map(|list| 0..list.len())
            .multi_cartesian_product();
        for pos in positions {
            let target: Vec<usize> =
                pos.iter().zip(&lists).map(|(&p, list)| list[p]).collect();
            let src_coord: Vec<usize> =
                if broadcast {
                    src_broadcast_coord.clone()
                } else {
                    pos.iter().map(|&p| p + 1).collect()
                };
            let val = match src.vals.get(&src_coord) {
                Some(v) => v.clone(),
                None => src.structural_zero(&src_coord)?,
            };
            if self.proto.is_none() { self.proto = Some(val.zero_like()); }
            self.vals.insert(target, val);
        }
        Ok(self)
    }

    /// Frobenius norm over stored values; implicit zeros contribute nothing.
    pub fn norm(&self) -> f64 {
        self.vals.values()
            .map(Elem::norm_sqr)
            .sum::<f64>()
            .sqrt()
    }

    /// Scale so that the Frobenius norm is 1.
    ///
    /// With no stored values the norm is the additive identity and scaling
    /// would be meaningless, so the call warns and leaves the container
    /// unchanged instead of manufacturing NaNs.
    pub fn normalize(&mut self) -> &mut Self {
        if self.vals.is_empty() {
            log::warn!(
                "normalize called on a tensor with no stored values; \
                leaving it unchanged");
            return self;
        }
        let n = self.norm();
        if n > 0.0 {
            self.vals.values_mut().for_each(|v| { *v = v.scale(1.0 / n); });
        } else {
            log::warn!(
                "normalize called on a tensor with zero norm; \
                leaving it unchanged");
        }
        self
    }
}

fn check_axes(axes: &[usize], rank: usize) -> SparseResult<()> {
    for (i, &k) in axes.iter().enumerate() {
        if k >= rank || axes[..i].contains(&k) {
            return Err(BadContractAxis(k, rank));
        }
    }
    Ok(())
}

fn broadcast_mul<A>(
    scalar: &SparseTensor<A>,
    tensor: &SparseTensor<A>,
    shape: Vec<usize>,
    scalar_on_right: bool,
) -> SparseResult<SparseTensor<A>>
where A: Elem
{
    let mut vals: FxHashMap<Vec<usize>, A> = FxHashMap::default();
    if let Some(s) = scalar.vals.values().next() {
        for (c, v) in tensor.vals.iter() {
            let prod =
                if scalar_on_right { v.mul_checked(s)? }
                else { s.mul_checked(v)? };
            vals.insert(c.clone(), prod);
        }
    }
    let proto =
        vals.values().next().map(Elem::zero_like)
        .or_else(|| tensor.proto.clone());
    Ok(SparseTensor { shape, vals, proto })
}

impl<A> fmt::Display for SparseTensor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sparse tensor {:?} ({} of {} stored)",
            self.shape,
            self.vals.len(),
            coord::numel(&self.shape),
        )
    }
}
