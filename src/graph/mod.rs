//! `NeighborGraph`: the 26-neighborhood of a process in the Cartesian
//! grid, and the neighbor-collective operations running on it.
//!
//! The graph enumerates the 3×3×3 offsets around this process's
//! coordinates, wraps each periodically into a valid rank, skips self and
//! deduplicates (on very small process grids the same rank appears at
//! several offsets). Two edge layouts are supported:
//!
//! - the **gridbased** split: source neighbors are the ranks at offsets
//!   with all components ≥ 0 plus self, destination neighbors those with
//!   all components ≤ 0 plus self. Sources are exactly the eight
//!   subdomains touching this process's gridpoint, so a neighbor-allgather
//!   delivers precisely the loads that pull on it;
//! - the **diffusion** layout: sources = destinations = all deduplicated
//!   neighbors, no self, as used by the flow calculators.
//!
//! A `neighbor_allgather` sends this rank's block to every destination and
//! collects one block per source, ordered by the source list. The ordering
//! is a pure function of the Cartesian topology, so paired ranks agree on
//! it without exchanging indices.

use bytemuck::cast_slice;
use hashbrown::HashMap;

use crate::comm::{CommTag, Communicator, Wait};
use crate::error::LcGridError;
use crate::grid::cart::CartGrid;

/// Process rank within the Cartesian communicator.
pub type Rank = usize;

fn push_back_unique(v: &mut Vec<Rank>, el: Rank) {
    if !v.contains(&el) {
        v.push(el);
    }
}

/// Distributed neighbor graph of one process.
#[derive(Clone, Debug)]
pub struct NeighborGraph {
    rank: Rank,
    neighbor_ranks: Vec<Rank>,
    neighbor_idx: HashMap<Rank, usize>,
    sources: Vec<Rank>,
    dests: Vec<Rank>,
}

impl NeighborGraph {
    /// Build the asymmetric source/destination split used by the
    /// grid-based partitioner.
    pub fn gridbased(cart: &CartGrid, rank: Rank) -> Result<Self, LcGridError> {
        Self::build(cart, rank, true)
    }

    /// Build the symmetric layout used by the diffusion flow calculators.
    pub fn diffusion(cart: &CartGrid, rank: Rank) -> Result<Self, LcGridError> {
        Self::build(cart, rank, false)
    }

    fn build(cart: &CartGrid, rank: Rank, gridbased_split: bool) -> Result<Self, LcGridError> {
        let c = cart.coords_of(rank);

        let mut neighbor_ranks = Vec::new();
        let mut neighbor_idx = HashMap::new();
        let mut sources = Vec::new();
        let mut dests = Vec::new();
        let mut multiplicity: HashMap<Rank, usize> = HashMap::new();

        for ox in -1i64..=1 {
            for oy in -1i64..=1 {
                for oz in -1i64..=1 {
                    let off = [ox, oy, oz];
                    let r = cart.rank_of([
                        c[0] as i64 + off[0],
                        c[1] as i64 + off[1],
                        c[2] as i64 + off[2],
                    ]);
                    if r == rank {
                        continue;
                    }
                    *multiplicity.entry(r).or_insert(0) += 1;
                    if !neighbor_idx.contains_key(&r) {
                        neighbor_idx.insert(r, neighbor_ranks.len());
                        neighbor_ranks.push(r);
                    }
                    if gridbased_split {
                        if off.iter().all(|&o| o >= 0) {
                            push_back_unique(&mut sources, r);
                        }
                        if off.iter().all(|&o| o <= 0) {
                            push_back_unique(&mut dests, r);
                        }
                    }
                }
            }
        }

        if gridbased_split {
            sources.push(rank);
            dests.push(rank);
        } else {
            sources = neighbor_ranks.clone();
            dests = neighbor_ranks.clone();
        }

        let graph = Self {
            rank,
            neighbor_ranks,
            neighbor_idx,
            sources,
            dests,
        };
        graph.validate_multiplicities(cart, &multiplicity)?;
        Ok(graph)
    }

    /// Check that every neighbor's multiplicity among the 26 offsets is
    /// exactly the product of its per-dimension wrap multiplicities. Any
    /// other pattern means the rank/coordinate mapping is not a periodic
    /// Cartesian grid.
    fn validate_multiplicities(
        &self,
        cart: &CartGrid,
        multiplicity: &HashMap<Rank, usize>,
    ) -> Result<(), LcGridError> {
        let c = cart.coords_of(self.rank);
        for (&r, &observed) in multiplicity.iter() {
            let nc = cart.coords_of(r);
            let mut expected = 1usize;
            for d in 0..3 {
                let hits = (-1i64..=1)
                    .filter(|&o| {
                        (c[d] as i64 + o).rem_euclid(cart.dims()[d] as i64) as usize == nc[d]
                    })
                    .count();
                expected *= hits;
            }
            if expected != observed {
                return Err(LcGridError::InvalidNeighborhood {
                    rank: r,
                    observed,
                    expected,
                });
            }
        }
        Ok(())
    }

    /// This process's rank.
    #[inline]
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Deduplicated neighbor ranks in first-seen offset order.
    #[inline]
    pub fn neighbor_ranks(&self) -> &[Rank] {
        &self.neighbor_ranks
    }

    /// Number of distinct neighbors (at most 26, zero on a 1×1×1 grid).
    #[inline]
    pub fn nneigh(&self) -> usize {
        self.neighbor_ranks.len()
    }

    /// Position of `rank` in [`neighbor_ranks`](Self::neighbor_ranks).
    #[inline]
    pub fn neighbor_index(&self, rank: Rank) -> Option<usize> {
        self.neighbor_idx.get(&rank).copied()
    }

    /// Source neighbors (the ranks a neighbor-allgather receives from).
    #[inline]
    pub fn sources(&self) -> &[Rank] {
        &self.sources
    }

    /// In-degree of the graph: the length of a neighbor-allgather result
    /// in blocks.
    #[inline]
    pub fn indegree(&self) -> usize {
        self.sources.len()
    }

    /// Gather a fixed-size `f64` block from every source neighbor.
    ///
    /// Sends this rank's `block` to every destination neighbor and returns
    /// the received blocks concatenated in source order
    /// (`indegree() * block.len()` values). Collective on the graph: every
    /// rank must call it with the same tag and block length.
    pub fn neighbor_allgather<C: Communicator>(
        &self,
        comm: &C,
        tag: CommTag,
        block: &[f64],
    ) -> Vec<f64> {
        let bytes: &[u8] = cast_slice(block);

        let mut sends = Vec::with_capacity(self.dests.len());
        for &d in &self.dests {
            if d != self.rank {
                sends.push(comm.isend(d, tag.as_u16(), bytes));
            }
        }

        let mut out = Vec::with_capacity(self.sources.len() * block.len());
        for &s in &self.sources {
            if s == self.rank {
                out.extend_from_slice(block);
            } else {
                let msg = comm
                    .irecv(s, tag.as_u16(), bytes.len())
                    .wait()
                    .expect("neighbor_allgather: receive completed without data");
                out.extend_from_slice(&bytemuck::pod_collect_to_vec::<u8, f64>(&msg));
            }
        }

        for s in sends {
            s.wait();
        }
        out
    }
}
