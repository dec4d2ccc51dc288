//! `CartGrid`: the periodic Cartesian process grid.
//!
//! Ranks are laid out row-major, matching MPI's default Cartesian
//! ordering: `rank = (c0·Dy + c1)·Dz + c2`. The topology is fully
//! periodic; coordinate lookups wrap in every dimension.
//!
//! The grid is a plain value passed explicitly into the partitioner; no
//! ambient process-global state.

use crate::error::LcGridError;
use crate::grid::globox::{linearize, unlinearize};

/// A periodic Cartesian arrangement of `Dx·Dy·Dz` processes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CartGrid {
    dims: [usize; 3],
}

impl CartGrid {
    /// Create a process grid of shape `dims` for a communicator of
    /// `comm_size` ranks.
    pub fn new(dims: [usize; 3], comm_size: usize) -> Result<Self, LcGridError> {
        if dims.iter().any(|&d| d == 0) || dims[0] * dims[1] * dims[2] != comm_size {
            return Err(LcGridError::ProcessGridMismatch {
                dims,
                size: comm_size,
            });
        }
        Ok(Self { dims })
    }

    /// Processes per axis.
    #[inline]
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Total number of processes.
    #[inline]
    pub fn nprocs(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    /// Cartesian coordinates of `rank`.
    #[inline]
    pub fn coords_of(&self, rank: usize) -> [usize; 3] {
        debug_assert!(rank < self.nprocs());
        unlinearize(rank, self.dims)
    }

    /// Rank at (possibly out-of-range) coordinates, wrapping periodically.
    pub fn rank_of(&self, coords: [i64; 3]) -> usize {
        let mut c = [0usize; 3];
        for d in 0..3 {
            c[d] = coords[d].rem_euclid(self.dims[d] as i64) as usize;
        }
        linearize(c, self.dims)
    }

    /// Whether `rank` sits at the top face of the process grid in
    /// dimension `d` (its subdomain touches the periodic boundary there).
    #[inline]
    pub fn at_top_face(&self, rank: usize, d: usize) -> bool {
        self.coords_of(rank)[d] == self.dims[d] - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_size() {
        assert!(matches!(
            CartGrid::new([2, 2, 2], 4),
            Err(LcGridError::ProcessGridMismatch { .. })
        ));
        assert!(matches!(
            CartGrid::new([0, 2, 2], 0),
            Err(LcGridError::ProcessGridMismatch { .. })
        ));
    }

    #[test]
    fn coords_roundtrip() {
        let cart = CartGrid::new([2, 3, 4], 24).unwrap();
        for rank in 0..24 {
            let c = cart.coords_of(rank);
            assert_eq!(cart.rank_of([c[0] as i64, c[1] as i64, c[2] as i64]), rank);
        }
    }

    #[test]
    fn rank_of_wraps() {
        let cart = CartGrid::new([2, 3, 4], 24).unwrap();
        assert_eq!(cart.rank_of([-1, 0, 0]), cart.rank_of([1, 0, 0]));
        assert_eq!(cart.rank_of([2, 3, 4]), cart.rank_of([0, 0, 0]));
    }

    #[test]
    fn top_face_detection() {
        let cart = CartGrid::new([2, 1, 1], 2).unwrap();
        assert!(!cart.at_top_face(0, 0));
        assert!(cart.at_top_face(1, 0));
        // A 1-wide dimension is always at the top face.
        assert!(cart.at_top_face(0, 1));
    }
}
