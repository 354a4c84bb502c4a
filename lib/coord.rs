//! Bidirectional mapping between linear positions and multi-index coordinates
//! for a fixed shape.
//!
//! Every container in this crate addresses its entries through these
//! functions, so the convention is pinned down exactly once: coordinates are
//! 1-based and linear order is column-major, i.e. the first axis varies
//! fastest.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordError {
    /// Returned when a multi-index coordinate is zero. Coordinates are
    /// 1-based.
    #[error("error in coordinate conversion: zero coordinate on axis {0}")]
    ZeroCoordinate(usize),

    /// Returned when a multi-index coordinate exceeds its axis bound.
    #[error("error in coordinate conversion: coordinate {1} on axis {0} exceeds bound {2}")]
    OutOfBounds(usize, usize, usize),

    /// Returned when a linear position falls outside `1..=numel(shape)`.
    #[error("error in coordinate conversion: linear position {0} outside 1..={1}")]
    LinearOutOfBounds(usize, usize),

    /// Returned when a multi-index has a different number of axes than the
    /// shape it is resolved against.
    #[error("error in coordinate conversion: coordinate rank {0} does not match shape rank {1}")]
    RankMismatch(usize, usize),
}
use CoordError::*;
pub type CoordResult<T> = Result<T, CoordError>;

/// Total number of addressable positions for a shape.
pub fn numel(shape: &[usize]) -> usize { shape.iter().product() }

/// Convert a single 1-based multi-index into its 1-based linear position.
pub fn multi_to_linear(shape: &[usize], coord: &[usize]) -> CoordResult<usize> {
    if coord.len() != shape.len() {
        return Err(RankMismatch(coord.len(), shape.len()));
    }
    let mut pos: usize = 0;
    let mut stride: usize = 1;
    for (k, (&c, &dim)) in coord.iter().zip(shape).enumerate() {
        if c == 0 { return Err(ZeroCoordinate(k)); }
        if c > dim { return Err(OutOfBounds(k, c, dim)); }
        pos += (c - 1) * stride;
        stride *= dim;
    }
    Ok(pos + 1)
}

/// Convert a single 1-based linear position into its 1-based multi-index.
pub fn linear_to_multi(shape: &[usize], pos: usize) -> CoordResult<Vec<usize>> {
    let n = numel(shape);
    if pos == 0 || pos > n { return Err(LinearOutOfBounds(pos, n)); }
    let mut rem = pos - 1;
    let coord: Vec<usize> =
        shape.iter()
        .map(|&dim| {
            let c = rem % dim;
            rem /= dim;
            c + 1
        })
        .collect();
    Ok(coord)
}

/// Convert a batch of linear positions into multi-index rows.
///
/// Inverse of [`to_linear`] for in-bounds input.
pub fn to_indices(shape: &[usize], positions: &[usize])
    -> CoordResult<Vec<Vec<usize>>>
{
    positions.iter()
        .map(|&pos| linear_to_multi(shape, pos))
        .collect()
}

/// Convert a batch of multi-index rows into linear positions.
///
/// Inverse of [`to_indices`] for in-bounds input.
pub fn to_linear(shape: &[usize], rows: &[Vec<usize>])
    -> CoordResult<Vec<usize>>
{
    rows.iter()
        .map(|coord| multi_to_linear(shape, coord))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let shape = [3, 4, 2];
        let all: Vec<usize> = (1..=numel(&shape)).collect();
        let rows = to_indices(&shape, &all).unwrap();
        let back = to_linear(&shape, &rows).unwrap();
        assert_eq!(back, all);
    }

    #[test]
    fn first_axis_fastest() {
        let shape = [3, 2];
        assert_eq!(linear_to_multi(&shape, 1).unwrap(), vec![1, 1]);
        assert_eq!(linear_to_multi(&shape, 2).unwrap(), vec![2, 1]);
        assert_eq!(linear_to_multi(&shape, 4).unwrap(), vec![1, 2]);
        assert_eq!(multi_to_linear(&shape, &[3, 2]).unwrap(), 6);
    }

    #[test]
    fn rejects_zero_coordinate() {
        assert_eq!(
            multi_to_linear(&[2, 2], &[0, 1]),
            Err(ZeroCoordinate(0)),
        );
    }

    #[test]
    fn rejects_out_of_bounds() {
        assert_eq!(
            multi_to_linear(&[2, 2], &[1, 3]),
            Err(OutOfBounds(1, 3, 2)),
        );
        assert_eq!(
            linear_to_multi(&[2, 2], 5),
            Err(LinearOutOfBounds(5, 4)),
        );
        assert_eq!(linear_to_multi(&[2, 2], 0), Err(LinearOutOfBounds(0, 4)));
    }

    #[test]
    fn rejects_rank_mismatch() {
        assert_eq!(
            multi_to_linear(&[2, 2], &[1, 1, 1]),
            Err(RankMismatch(3, 2)),
        );
    }
}
