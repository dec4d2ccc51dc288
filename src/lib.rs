//! # lcgrid
//!
//! lcgrid is a distributed dynamic load-balancing library for particle
//! simulations on linked-cell grids. A simulation box is decomposed into a
//! regular global grid of cells jointly owned by a set of message-passing
//! processes arranged in a periodic Cartesian grid. Each process owns a
//! contiguous spatial subdomain plus a ghost layer mirroring its neighbors'
//! boundary cells. As particle density drifts over a run, lcgrid
//! re-partitions cells among processes to equalize load while preserving
//! the invariants the particle-exchange machinery depends on.
//!
//! ## Subsystems
//! - A grid-based partitioner ([`GridBasedPartition`]): the partition is
//!   parameterized by one 3D gridpoint per process; subdomains are the
//!   octagons spanned by the surrounding eight gridpoints. Repartitioning
//!   moves gridpoints along a force computed from neighbor load imbalances
//!   (Begau & Sutmann, Comp. Phys. Comm. 190, 2015).
//! - A family of diffusion flow calculators ([`FlowCalc`]) that turn
//!   per-process loads on a neighbor graph into per-neighbor load-transfer
//!   volumes (first-order, iterated, and second-order variants).
//! - Pluggable communication backends: a serial no-op, an in-process
//!   thread-backed backend used by the test suite, and an MPI adapter
//!   behind the `mpi-support` feature.
//!
//! The linked-cell physics engine stays outside this crate: it supplies a
//! load per local cell (and particle positions) through [`CellMetric`] and
//! consumes the resulting `{local cells, ghost cells, exchange
//! descriptors}` layout.
//!
//! ## Collective discipline
//! Every public mutation of partition state is collective: all processes
//! in the Cartesian communicator must enter it, and all proceed in
//! lockstep through the contained collectives. Accessors and
//! `position_to_*` queries are purely local.

pub mod comm;
pub mod debug_invariants;
pub mod error;
pub mod graph;
pub mod grid;
pub mod partition;

/// A convenient prelude importing the most-used traits and types.
pub mod prelude {
    pub use crate::comm::{CommTag, Communicator, NoComm, ThreadComm, Wait};
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::error::LcGridError;
    pub use crate::graph::NeighborGraph;
    pub use crate::grid::cart::CartGrid;
    pub use crate::grid::globox::GlobalBox;
    pub use crate::grid::octagon::Octagon;
    pub use crate::partition::diffusion::{create_flow_calc, FlowCalc, FlowCalcKind};
    pub use crate::partition::gridbased::GridBasedPartition;
    pub use crate::partition::{CellAssignment, CellMetric, GhostExchangeDesc, Point3, Rank};
}

pub use crate::error::LcGridError;
pub use crate::partition::diffusion::{create_flow_calc, FlowCalc, FlowCalcKind};
pub use crate::partition::gridbased::GridBasedPartition;
pub use crate::partition::{CellAssignment, CellMetric, GhostExchangeDesc, Point3, Rank};
