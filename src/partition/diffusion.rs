//! Diffusion flow calculators.
//!
//! Given a per-process scalar load on a neighbor graph, a flow calculator
//! returns the volume of load this process should ship to each neighbor
//! to approach global balance. The variants differ in their convergence
//! theory:
//!
//! - [`FlowCalcKind::Wlm`] — stateless first-order diffusion after
//!   Willebeek-LeMair & Reeves (IEEE Trans. Par. Distr. Sys. 4(9), 1993).
//! - [`FlowCalcKind::Schorn`] — iterates the first-order step
//!   `n_flow_iter` times on a virtual load buffer.
//! - [`FlowCalcKind::So`] — second-order scheme with per-neighbor flow
//!   memory across calls.
//! - [`FlowCalcKind::Soc`] — second-order, centralized: iterates the
//!   diffusion matrix on the all-gathered world load vector.
//! - [`FlowCalcKind::Sof`] — Schorn's sweep count fused with the
//!   second-order damping, no cross-call state.
//!
//! Every `compute_flow` is collective on the (symmetric) neighbor graph;
//! the returned volumes are non-negative and ordered like
//! `graph.neighbor_ranks()`. A calculator may return flows summing to
//! less than the held load; clamping donations against what the process
//! actually holds is the cell-assignment consumer's responsibility.

use hashbrown::HashMap;

use crate::comm::collectives::{
    all_gather, all_gather_varcount, all_reduce_max_u64, displacements,
};
use crate::comm::{CommTag, Communicator};
use crate::graph::{NeighborGraph, Rank};
use crate::partition::parse_assignment;

const TAG_FLOW: CommTag = CommTag::new(0x10);
const TAG_DEGREE: CommTag = CommTag::new(0x11);
const TAG_WORLD_LOAD: CommTag = CommTag::new(0x12);
// Varcount gathers burn two consecutive tags.
const TAG_WORLD_ADJ: CommTag = CommTag::new(0x13);

/// Default damping for the second-order variants.
const DEFAULT_BETA: f64 = 1.8;

/// Selector for [`create_flow_calc`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlowCalcKind {
    Wlm,
    Schorn,
    Soc,
    So,
    Sof,
}

/// A flow calculator with its per-variant mutable state.
#[derive(Clone, Debug)]
pub enum FlowCalc {
    Wlm,
    Schorn {
        n_flow_iter: u32,
    },
    So {
        beta: f64,
        /// Unclamped previous flow per neighbor rank.
        prev_flow: HashMap<Rank, f64>,
    },
    Soc {
        beta: f64,
        alpha: f64,
        /// World diffusion matrix, built once from the gathered adjacency.
        matrix: Vec<Vec<f64>>,
        iterate: Vec<f64>,
        prev_iterate: Vec<f64>,
    },
    Sof {
        beta: f64,
        n_flow_iter: u32,
    },
}

/// Construct a flow calculator of the given kind with default parameters.
pub fn create_flow_calc(kind: FlowCalcKind) -> FlowCalc {
    match kind {
        FlowCalcKind::Wlm => FlowCalc::Wlm,
        FlowCalcKind::Schorn => FlowCalc::Schorn { n_flow_iter: 1 },
        FlowCalcKind::So => FlowCalc::So {
            beta: DEFAULT_BETA,
            prev_flow: HashMap::new(),
        },
        FlowCalcKind::Soc => FlowCalc::Soc {
            beta: DEFAULT_BETA,
            alpha: 0.0,
            matrix: Vec::new(),
            iterate: Vec::new(),
            prev_iterate: Vec::new(),
        },
        FlowCalcKind::Sof => FlowCalc::Sof {
            beta: DEFAULT_BETA,
            n_flow_iter: 1,
        },
    }
}

/// `alpha = 1 / (max_degree + 1)`, with the maximum degree taken over the
/// whole communicator.
fn diffusion_alpha<C: Communicator>(graph: &NeighborGraph, comm: &C) -> f64 {
    let max_degree = all_reduce_max_u64(comm, TAG_DEGREE, graph.nneigh() as u64);
    1.0 / (max_degree as f64 + 1.0)
}

fn mat_vec(m: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    m.iter()
        .map(|row| row.iter().zip(v).map(|(a, b)| a * b).sum())
        .collect()
}

impl FlowCalc {
    /// The kind tag of this calculator.
    pub fn kind(&self) -> FlowCalcKind {
        match self {
            FlowCalc::Wlm => FlowCalcKind::Wlm,
            FlowCalc::Schorn { .. } => FlowCalcKind::Schorn,
            FlowCalc::So { .. } => FlowCalcKind::So,
            FlowCalc::Soc { .. } => FlowCalcKind::Soc,
            FlowCalc::Sof { .. } => FlowCalcKind::Sof,
        }
    }

    /// Compute the volume of load to send to each neighbor.
    ///
    /// Collective on the neighbor graph (and, for the `alpha` reduction
    /// and the centralized variant, on the whole communicator). Returns
    /// one non-negative volume per entry of `graph.neighbor_ranks()`.
    pub fn compute_flow<C: Communicator>(
        &mut self,
        graph: &NeighborGraph,
        comm: &C,
        load: f64,
    ) -> Vec<f64> {
        let alpha = diffusion_alpha(graph, comm);
        let nneigh = graph.nneigh();

        match self {
            FlowCalc::Wlm => {
                let lambda = graph.neighbor_allgather(comm, TAG_FLOW, &[load]);
                (0..nneigh)
                    .map(|i| (alpha * (load - lambda[i])).max(0.0))
                    .collect()
            }

            FlowCalc::Schorn { n_flow_iter } => {
                let mut virtual_load = load;
                let mut flow = vec![0.0; nneigh];
                for _ in 0..(*n_flow_iter).max(1) {
                    let lambda = graph.neighbor_allgather(comm, TAG_FLOW, &[virtual_load]);
                    let lv = virtual_load;
                    let mut net = 0.0;
                    for i in 0..nneigh {
                        let s = alpha * (lv - lambda[i]);
                        flow[i] += s.max(0.0);
                        net += (-s).max(0.0) - s.max(0.0);
                    }
                    virtual_load += net;
                }
                flow
            }

            FlowCalc::So { beta, prev_flow } => {
                let lambda = graph.neighbor_allgather(comm, TAG_FLOW, &[load]);
                let first = prev_flow.is_empty();
                let mut flow = vec![0.0; nneigh];
                for (i, &r) in graph.neighbor_ranks().iter().enumerate() {
                    let base = alpha * (load - lambda[i]);
                    let s = if first {
                        base
                    } else {
                        *beta * base + (*beta - 1.0) * prev_flow[&r]
                    };
                    prev_flow.insert(r, s);
                    flow[i] = s.max(0.0);
                }
                flow
            }

            FlowCalc::Soc {
                beta,
                alpha: alpha_state,
                matrix,
                iterate,
                prev_iterate,
            } => {
                let world_load = all_gather(comm, TAG_WORLD_LOAD, &[load]);
                let size = comm.size();

                if matrix.len() != size {
                    // Seed: gather the world adjacency once and build the
                    // diffusion matrix from it.
                    let neigh: Vec<u64> =
                        graph.neighbor_ranks().iter().map(|&r| r as u64).collect();
                    let (all_neighbors, rcounts) =
                        all_gather_varcount(comm, TAG_WORLD_ADJ, &neigh);
                    let displs = displacements(&rcounts);
                    let max_degree = rcounts.iter().max().copied().unwrap_or(0);
                    let a = 1.0 / (max_degree as f64 + 1.0);

                    let mut m = vec![vec![0.0; size]; size];
                    for i in 0..size {
                        for k in 0..rcounts[i] {
                            let j = all_neighbors[displs[i] + k] as usize;
                            m[i][j] = a;
                        }
                        m[i][i] = 1.0 - rcounts[i] as f64 * a;
                    }

                    *alpha_state = a;
                    *matrix = m;
                    // Seed with the raw distribution; the first call's
                    // flows are then plain first-order diffusion.
                    *prev_iterate = world_load.clone();
                    *iterate = world_load;
                } else {
                    let next: Vec<f64> = mat_vec(matrix, iterate)
                        .into_iter()
                        .zip(prev_iterate.iter())
                        .map(|(mx, &prev)| *beta * mx + (1.0 - *beta) * prev)
                        .collect();
                    *prev_iterate = std::mem::replace(iterate, next);
                }

                let me = comm.rank();
                graph
                    .neighbor_ranks()
                    .iter()
                    .map(|&r| (*alpha_state * (iterate[me] - iterate[r])).max(0.0))
                    .collect()
            }

            FlowCalc::Sof { beta, n_flow_iter } => {
                let mut virtual_load = load;
                let mut flow = vec![0.0; nneigh];
                let mut prev_step = vec![0.0; nneigh];
                for iter in 0..(*n_flow_iter).max(1) {
                    let lambda = graph.neighbor_allgather(comm, TAG_FLOW, &[virtual_load]);
                    let lv = virtual_load;
                    let mut net = 0.0;
                    for i in 0..nneigh {
                        let base = alpha * (lv - lambda[i]);
                        let s = if iter == 0 {
                            base
                        } else {
                            *beta * base + (*beta - 1.0) * prev_step[i]
                        };
                        prev_step[i] = s;
                        flow[i] += s.max(0.0);
                        net += (-s).max(0.0) - s.max(0.0);
                    }
                    virtual_load += net;
                }
                flow
            }
        }
    }

    /// Set the sweep count. Returns whether the variant supports it.
    pub fn set_n_flow_iter(&mut self, n: u32) -> bool {
        match self {
            FlowCalc::Schorn { n_flow_iter } | FlowCalc::Sof { n_flow_iter, .. } => {
                *n_flow_iter = n;
                true
            }
            _ => false,
        }
    }

    /// Set the damping coefficient. Returns whether the variant supports it.
    pub fn set_beta(&mut self, beta: f64) -> bool {
        match self {
            FlowCalc::So { beta: b, .. }
            | FlowCalc::Soc { beta: b, .. }
            | FlowCalc::Sof { beta: b, .. } => {
                *b = beta;
                true
            }
            _ => false,
        }
    }

    /// Process a runtime command. Recognized: `n_flow_iter = <uint>` and
    /// `beta = <float>`, each applied only where the variant supports it.
    /// Unrecognized strings are ignored silently.
    pub fn command(&mut self, s: &str) {
        if let Some(n) = parse_assignment::<u32>(s, "n_flow_iter") {
            if self.set_n_flow_iter(n) {
                log::debug!("setting n_flow_iter = {}", n);
            }
        } else if let Some(beta) = parse_assignment::<f64>(s, "beta") {
            if self.set_beta(beta) {
                log::debug!("setting beta = {}", beta);
            }
        }
    }
}
