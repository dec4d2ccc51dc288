//! Partitioning of the global cell grid across processes.
//!
//! [`gridbased`] holds the gridpoint-parameterized partitioner;
//! [`diffusion`] the flow-calculator family feeding cell-assignment
//! strategies. The types here are the seam between the partitioner and
//! the particle engine on both sides: the engine provides loads and
//! particle positions through [`CellMetric`] and consumes the exchange
//! layout through [`GhostExchangeDesc`].

pub mod diffusion;
pub mod gridbased;

pub use crate::graph::Rank;
pub use crate::grid::Point3;

/// Ghost-exchange descriptor toward one neighbor rank.
///
/// `send` lists owned cells whose contents this process sends to `dest`;
/// `recv` lists the ghost cells it receives in return. The lists need not
/// have equal lengths (surfaces are asymmetric in general), but both are
/// sorted by the underlying global cell index before being translated to
/// local indices, and the sort is identical on both sides: the `send`
/// list on this rank toward `dest` pairs element-wise with the `recv`
/// list on `dest` from this rank, without any index exchange.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GhostExchangeDesc {
    /// Neighbor rank this descriptor communicates with.
    pub dest: Rank,
    /// Owned cells to send, as local cell indices.
    pub send: Vec<usize>,
    /// Ghost cells to receive into, as local cell indices.
    pub recv: Vec<usize>,
}

/// Engine-side load input for a repartition step.
///
/// Implemented by the particle engine; the partitioner only reads.
pub trait CellMetric {
    /// One non-negative load weight per local cell, in local cell order.
    fn weights(&self) -> Vec<f64>;

    /// Positions of all particles owned by this process. Used for the
    /// center-of-load; an empty result makes the partitioner fall back to
    /// the unweighted mean of owned-cell midpoints.
    fn particle_positions(&self) -> Vec<Point3> {
        Vec::new()
    }
}

/// Plain weight closures are metrics without particles.
impl<F> CellMetric for F
where
    F: Fn() -> Vec<f64>,
{
    fn weights(&self) -> Vec<f64> {
        self()
    }
}

/// Consumer of flow volumes on the diffusion path.
///
/// Given the per-neighbor volumes from a
/// [`FlowCalc`](crate::partition::diffusion::FlowCalc), an implementation
/// picks owned cells to donate to each neighbor. Implementations must
/// keep the remaining subdomain connected, must never donate a cell to a
/// rank that is not a direct neighbor, and are responsible for not
/// donating more weight than the process holds. The strategies themselves
/// live with the engine; the partitioner only defines the seam.
pub trait CellAssignment {
    /// Select owned cells to donate, one list per entry of the neighbor
    /// rank list the flow was computed for. `flow[i]` is the target
    /// volume toward neighbor `i`; `weights` are the current per-cell
    /// loads in local cell order.
    fn select_cells(&mut self, flow: &[f64], weights: &[f64]) -> Vec<Vec<usize>>;
}

/// Parse a `key = value` command string; whitespace around either side is
/// ignored. Returns `None` for anything that does not match.
pub(crate) fn parse_assignment<T: std::str::FromStr>(s: &str, key: &str) -> Option<T> {
    let (lhs, rhs) = s.split_once('=')?;
    if lhs.trim() != key {
        return None;
    }
    rhs.trim().parse().ok()
}
