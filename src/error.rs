//! Unified error type for lcgrid public APIs.
//!
//! Every fallible public operation returns `Result<_, LcGridError>`; no
//! error is silently swallowed. `command` strings are the one exception by
//! contract: unrecognized commands are ignored.

use thiserror::Error;

/// Unified error type for lcgrid operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LcGridError {
    /// The requested global grid would produce cells smaller than the
    /// minimum cell size, or has a zero-cell dimension.
    #[error("invalid geometry: dimension {dim} has {ncells} cells of size {cell_size} (minimum {min_cell_size})")]
    InvalidGeometry {
        dim: usize,
        ncells: usize,
        cell_size: f64,
        min_cell_size: f64,
    },
    /// The process grid does not multiply out to the communicator size.
    #[error("process grid {dims:?} does not match communicator size {size}")]
    ProcessGridMismatch { dims: [usize; 3], size: usize },
    /// A position resolved to neither this process nor any direct
    /// neighbor's subdomain. Indicates a particle drifted beyond the halo
    /// since the last reinit.
    #[error("position {pos:?} is outside this process's neighborhood")]
    OutOfNeighborhood { pos: [f64; 3] },
    /// A position resolved to a neighbor, but the caller required a rank
    /// from the neighbor list (e.g. `position_to_neighidx` on an owned
    /// position).
    #[error("rank {rank} is not a neighbor of rank {this}")]
    NotANeighbor { rank: usize, this: usize },
    /// A process ended up owning no cells, which the exchange machinery
    /// cannot tolerate.
    #[error("rank {rank} owns no cells after reinit")]
    EmptySubdomain { rank: usize },
    /// The neighbor enumeration produced a duplication pattern that cannot
    /// come from a periodic Cartesian wrap.
    #[error("rank {rank} appears {observed} times in the 26-neighborhood, expected {expected}")]
    InvalidNeighborhood {
        rank: usize,
        observed: usize,
        expected: usize,
    },
    /// An exchange descriptor violates the layout invariants (send lists
    /// owned cells, recv lists ghost cells, destinations are neighbors).
    #[error("broken exchange descriptor on rank {rank}: {what}")]
    BrokenExchange { rank: usize, what: &'static str },
}
