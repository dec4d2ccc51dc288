//! `GlobalBox`: immutable geometric oracle for the global cell grid.
//!
//! The simulation box is an axis-aligned box of lengths `L` divided into a
//! regular grid of `G = (Gx, Gy, Gz)` cells of size `h = L / G`. A global
//! cell index linearizes its 3D coordinates as `(cx·Gy + cy)·Gz + cz`.
//! The 26-neighborhood wraps periodically in every dimension.
//!
//! `GlobalBox` is a plain value, identical on every process; all methods
//! are pure.

use crate::error::LcGridError;
use crate::grid::Point3;

/// Linearize 3D cell coordinates into a global cell index.
#[inline]
pub(crate) const fn linearize(c: [usize; 3], grid: [usize; 3]) -> usize {
    (c[0] * grid[1] + c[1]) * grid[2] + c[2]
}

/// Invert [`linearize`].
#[inline]
pub(crate) const fn unlinearize(cidx: usize, grid: [usize; 3]) -> [usize; 3] {
    [
        (cidx / grid[2]) / grid[1],
        (cidx / grid[2]) % grid[1],
        cidx % grid[2],
    ]
}

/// The global cell grid.
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalBox {
    box_l: Point3,
    grid: [usize; 3],
    cell_l: Point3,
}

impl GlobalBox {
    /// Create a global box of lengths `box_l` with `grid` cells per axis.
    ///
    /// Fails with [`LcGridError::InvalidGeometry`] if any dimension has
    /// zero cells or cells smaller than `min_cell_size`.
    pub fn new(box_l: Point3, grid: [usize; 3], min_cell_size: f64) -> Result<Self, LcGridError> {
        let mut cell_l = [0.0; 3];
        for d in 0..3 {
            cell_l[d] = box_l[d] / grid[d] as f64;
            if grid[d] == 0 || cell_l[d] < min_cell_size {
                return Err(LcGridError::InvalidGeometry {
                    dim: d,
                    ncells: grid[d],
                    cell_size: cell_l[d],
                    min_cell_size,
                });
            }
        }
        Ok(Self {
            box_l,
            grid,
            cell_l,
        })
    }

    /// Total number of cells.
    #[inline]
    pub fn ncells(&self) -> usize {
        self.grid[0] * self.grid[1] * self.grid[2]
    }

    /// Edge lengths of one cell.
    #[inline]
    pub fn cell_size(&self) -> Point3 {
        self.cell_l
    }

    /// Cells per axis.
    #[inline]
    pub fn grid_size(&self) -> [usize; 3] {
        self.grid
    }

    /// Box lengths.
    #[inline]
    pub fn box_size(&self) -> Point3 {
        self.box_l
    }

    /// Midpoint of the cell with global index `cidx`.
    pub fn midpoint(&self, cidx: usize) -> Point3 {
        let c = unlinearize(cidx, self.grid);
        let mut m = [0.0; 3];
        for d in 0..3 {
            m[d] = (c[d] as f64 + 0.5) * self.cell_l[d];
        }
        m
    }

    /// Global index of the cell containing `pos`, wrapping periodically.
    pub fn cell_at_pos(&self, pos: &Point3) -> usize {
        let mut c = [0usize; 3];
        for d in 0..3 {
            let g = self.grid[d] as i64;
            let i = (pos[d] / self.cell_l[d]).floor() as i64;
            c[d] = i.rem_euclid(g) as usize;
        }
        linearize(c, self.grid)
    }

    /// The `k`-th cell of the full-shell neighborhood of `cidx`.
    ///
    /// `k ∈ [0, 26]` enumerates the 3×3×3 offsets in row-major order;
    /// `k = 13` is the zero offset, i.e. `cidx` itself. Offsets wrap
    /// periodically.
    pub fn neighbor(&self, cidx: usize, k: usize) -> usize {
        debug_assert!(k < 27);
        let off = unlinearize(k, [3, 3, 3]);
        let c = unlinearize(cidx, self.grid);
        let mut n = [0usize; 3];
        for d in 0..3 {
            let g = self.grid[d] as i64;
            n[d] = (c[d] as i64 + off[d] as i64 - 1).rem_euclid(g) as usize;
        }
        linearize(n, self.grid)
    }

    /// The 26 periodic neighbors of `cidx`, in offset order, without
    /// `cidx` itself.
    pub fn full_shell_neigh_without_center(
        &self,
        cidx: usize,
    ) -> impl Iterator<Item = usize> + '_ {
        (0..27).filter(|&k| k != 13).map(move |k| self.neighbor(cidx, k))
    }
}
