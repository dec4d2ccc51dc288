//! Grid-based partitioner.
//!
//! The partition is parameterized by one 3D *gridpoint* per process: the
//! upper-right-back corner of its subdomain. A process's subdomain is the
//! octagon spanned by the eight gridpoints of the processes at offsets
//! `{0,-1}³` from its Cartesian coordinates, with corners mirrored by a
//! box length where they come from across a periodic boundary. A cell
//! belongs to the process whose octagon contains its midpoint.
//!
//! `repartition` displaces gridpoints along a force computed from the
//! load imbalance of the eight subdomains surrounding each gridpoint
//! (Begau & Sutmann, Comp. Phys. Comm. 190, 2015, p. 51–61), then
//! rebuilds octagons, the cell layout and the exchange descriptors from
//! scratch. All mutating operations are collective on the Cartesian
//! communicator; accessors and position lookups are purely local.

use hashbrown::HashMap;

use crate::comm::collectives::{all_gather, all_reduce_sum_u64};
use crate::comm::{CommTag, Communicator};
use crate::debug_invariants::DebugInvariants;
use crate::error::LcGridError;
use crate::graph::{NeighborGraph, Rank};
use crate::grid::cart::CartGrid;
use crate::grid::globox::GlobalBox;
use crate::grid::octagon::Octagon;
use crate::grid::Point3;
use crate::partition::{parse_assignment, CellMetric, GhostExchangeDesc};

const TAG_GRIDPOINTS: CommTag = CommTag::new(0x01);
const TAG_LOAD: CommTag = CommTag::new(0x02);
const TAG_CENTER: CommTag = CommTag::new(0x03);
const TAG_CONFLICTS: CommTag = CommTag::new(0x04);

fn push_back_unique(v: &mut Vec<usize>, el: usize) {
    if !v.contains(&el) {
        v.push(el);
    }
}

#[inline]
fn dist(a: Point3, b: Point3) -> f64 {
    let d = [a[0] - b[0], a[1] - b[1], a[2] - b[2]];
    (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt()
}

/// Gridpoint-parameterized partition of a [`GlobalBox`] across the
/// processes of a periodic [`CartGrid`].
pub struct GridBasedPartition<C: Communicator> {
    comm: C,
    cart: CartGrid,
    gbox: GlobalBox,
    rank: Rank,
    mu: f64,
    /// Still the initial regular Cartesian split; enables O(1) global
    /// position resolution until the first accepted repartition.
    is_regular_grid: bool,
    gridpoint: Point3,
    /// All gridpoints, replicated by rank via all-gather.
    gridpoints: Vec<Point3>,
    my_dom: Octagon,
    neighbor_doms: Vec<Octagon>,
    graph: NeighborGraph,
    /// Owned cells at `[0, nlocal)`, ghosts at `[nlocal, nlocal+nghost)`,
    /// ghosts in discovery order.
    cells: Vec<usize>,
    nlocal: usize,
    nghost: usize,
    global_to_local: HashMap<usize, usize>,
    exchange_vec: Vec<GhostExchangeDesc>,
}

impl<C: Communicator> GridBasedPartition<C> {
    /// Build the initial regular partition. Collective on `comm`.
    ///
    /// Gridpoints start at the upper-right-back corners of the regular
    /// Cartesian split; ownership of midpoints exactly on a subdomain
    /// boundary follows the octagon's half-open containment convention.
    pub fn new(comm: C, cart: CartGrid, gbox: GlobalBox) -> Result<Self, LcGridError> {
        if cart.nprocs() != comm.size() {
            return Err(LcGridError::ProcessGridMismatch {
                dims: cart.dims(),
                size: comm.size(),
            });
        }
        let rank = comm.rank();
        let coords = cart.coords_of(rank);
        let mut gridpoint = [0.0; 3];
        for d in 0..3 {
            gridpoint[d] = regular_bound(&gbox, &cart, d, coords[d] as i64);
        }

        let graph = NeighborGraph::gridbased(&cart, rank)?;
        let mut part = Self {
            comm,
            cart,
            gbox,
            rank,
            mu: 1.0,
            is_regular_grid: true,
            gridpoint,
            gridpoints: Vec::new(),
            my_dom: Octagon::new([[0.0; 3]; 8]),
            neighbor_doms: Vec::new(),
            graph,
            cells: Vec::new(),
            nlocal: 0,
            nghost: 0,
            global_to_local: HashMap::new(),
            exchange_vec: Vec::new(),
        };
        part.init_octagons();
        part.reinit()?;
        Ok(part)
    }

    /// Corners of the octagon of rank `r`, mirrored into `r`'s real-space
    /// location where they come from across a periodic boundary.
    ///
    /// Corner `i` encodes the offset bits `(off_x, off_y, off_z)`: the
    /// gridpoint of the process at `coords - off`, which can only wrap in
    /// the negative direction.
    fn bounding_box(&self, r: Rank) -> [Point3; 8] {
        let c = self.cart.coords_of(r);
        let dims = self.cart.dims();
        let box_l = self.gbox.box_size();

        let mut corners = [[0.0; 3]; 8];
        let mut i = 0;
        for off_x in 0..=1i64 {
            for off_y in 0..=1i64 {
                for off_z in 0..=1i64 {
                    let off = [off_x, off_y, off_z];
                    let mut nc = [0i64; 3];
                    let mut mirror = [0i64; 3];
                    for d in 0..3 {
                        nc[d] = c[d] as i64 - off[d];
                        if nc[d] < 0 {
                            nc[d] = dims[d] as i64 - 1;
                            mirror[d] = -1;
                        }
                    }
                    let owner = self.cart.rank_of(nc);
                    for d in 0..3 {
                        corners[i][d] =
                            self.gridpoints[owner][d] + mirror[d] as f64 * box_l[d];
                    }
                    i += 1;
                }
            }
        }
        corners
    }

    /// All-gather the gridpoints and rebuild the own and neighbor
    /// octagons. Collective on the Cartesian communicator.
    fn init_octagons(&mut self) {
        let flat = all_gather(&self.comm, TAG_GRIDPOINTS, self.gridpoint.as_slice());
        self.gridpoints = flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect();

        self.my_dom = Octagon::new(self.bounding_box(self.rank));
        self.neighbor_doms = self
            .graph
            .neighbor_ranks()
            .iter()
            .map(|&r| Octagon::new(self.bounding_box(r)))
            .collect();
    }

    /// Rebuild the local cell list, the ghost layer and the exchange
    /// descriptors from the current octagons. Purely local.
    fn reinit(&mut self) -> Result<(), LcGridError> {
        self.cells.clear();
        self.global_to_local.clear();
        self.nlocal = 0;
        self.nghost = 0;

        // Owned cells: all global cells whose midpoint falls into this
        // process's octagon.
        for g in 0..self.gbox.ncells() {
            let midpoint = self.gbox.midpoint(g);
            if self.my_dom.contains(&midpoint) {
                self.global_to_local.insert(g, self.nlocal);
                self.cells.push(g);
                self.nlocal += 1;
            }
        }
        if self.nlocal == 0 {
            return Err(LcGridError::EmptySubdomain { rank: self.rank });
        }

        self.exchange_vec = self
            .graph
            .neighbor_ranks()
            .iter()
            .map(|&r| GhostExchangeDesc {
                dest: r,
                send: Vec::new(),
                recv: Vec::new(),
            })
            .collect();

        // Ghost cells and communication volume: walk the 26-shell of
        // every owned cell; foreign cells become ghosts in discovery
        // order, and each cross-process edge feeds the exchange lists.
        for i in 0..self.nlocal {
            let cell = self.cells[i];
            let shell: Vec<usize> = self.gbox.full_shell_neigh_without_center(cell).collect();
            for g in shell {
                let owner = self.gloidx_to_rank(g)?;
                if owner == self.rank {
                    continue;
                }
                if !self.global_to_local.contains_key(&g) {
                    self.global_to_local.insert(g, self.nlocal + self.nghost);
                    self.cells.push(g);
                    self.nghost += 1;
                }

                let idx = self
                    .graph
                    .neighbor_index(owner)
                    .ok_or(LcGridError::NotANeighbor {
                        rank: owner,
                        this: self.rank,
                    })?;
                push_back_unique(&mut self.exchange_vec[idx].recv, g);
                push_back_unique(&mut self.exchange_vec[idx].send, cell);
            }
        }

        // Sort by global index (identical on both sides of every pair),
        // then translate in place to local indices.
        let global_to_local = &self.global_to_local;
        for v in &mut self.exchange_vec {
            v.recv.sort_unstable();
            for g in v.recv.iter_mut() {
                *g = global_to_local[&*g];
            }
            v.send.sort_unstable();
            for g in v.send.iter_mut() {
                *g = global_to_local[&*g];
            }
        }

        crate::debug_invariants!(self.validate_invariants(), "gridbased reinit");
        Ok(())
    }

    /// Owner of the global cell `g`, resolved through its midpoint.
    fn gloidx_to_rank(&self, g: usize) -> Result<Rank, LcGridError> {
        self.position_to_rank(&self.gbox.midpoint(g))
    }

    /// Number of owned cells.
    #[inline]
    pub fn n_local_cells(&self) -> usize {
        self.nlocal
    }

    /// Number of ghost cells.
    #[inline]
    pub fn n_ghost_cells(&self) -> usize {
        self.nghost
    }

    /// Number of distinct neighbor processes.
    #[inline]
    pub fn n_neighbors(&self) -> usize {
        self.graph.nneigh()
    }

    /// Rank of the `i`-th neighbor.
    #[inline]
    pub fn neighbor_rank(&self, i: usize) -> Rank {
        self.graph.neighbor_ranks()[i]
    }

    /// Local index of the `k`-th shell neighbor of the owned cell
    /// `cellidx` (`k ∈ [0, 26]`; `k = 13` returns the cell itself). The
    /// result is an owned index or a ghost index.
    pub fn cell_neighbor_index(&self, cellidx: usize, k: usize) -> usize {
        debug_assert!(cellidx < self.nlocal, "cell_neighbor_index of a ghost cell");
        self.global_to_local[&self.gbox.neighbor(self.cells[cellidx], k)]
    }

    /// The exchange descriptors, one per neighbor.
    #[inline]
    pub fn get_boundary_info(&self) -> &[GhostExchangeDesc] {
        &self.exchange_vec
    }

    /// Global index of the local (owned or ghost) cell `cellidx`.
    #[inline]
    pub fn global_cell_index(&self, cellidx: usize) -> usize {
        self.cells[cellidx]
    }

    /// Edge lengths of one grid cell.
    #[inline]
    pub fn cell_size(&self) -> Point3 {
        self.gbox.cell_size()
    }

    /// Cells per axis of the global grid.
    #[inline]
    pub fn grid_size(&self) -> [usize; 3] {
        self.gbox.grid_size()
    }

    /// Current gridpoint of this process.
    #[inline]
    pub fn gridpoint(&self) -> Point3 {
        self.gridpoint
    }

    /// The replicated gridpoints of all processes.
    #[inline]
    pub fn gridpoints(&self) -> &[Point3] {
        &self.gridpoints
    }

    /// Current gridpoint displacement step size.
    #[inline]
    pub fn mu(&self) -> f64 {
        self.mu
    }

    /// Local cell index of the cell containing `pos`.
    ///
    /// Contract: positions in owned cells return an index
    /// `< n_local_cells()`; positions in ghost cells are *defined* and
    /// return the ghost's local index. Positions outside the subdomain
    /// and its ghost layer fail with
    /// [`LcGridError::OutOfNeighborhood`].
    pub fn position_to_cell_index(&self, pos: &Point3) -> Result<usize, LcGridError> {
        #[cfg(debug_assertions)]
        {
            // The position must at least resolve within the neighborhood.
            self.position_to_rank(pos)?;
        }
        let g = self.gbox.cell_at_pos(pos);
        self.global_to_local
            .get(&g)
            .copied()
            .ok_or(LcGridError::OutOfNeighborhood { pos: *pos })
    }

    /// Rank owning the position `pos`.
    ///
    /// Ownership is decided by the midpoint of the containing cell, so
    /// the answer is consistent with cell ownership. While the partition
    /// is still the initial regular split, any position in the box
    /// resolves in O(1); afterwards only the own and direct-neighbor
    /// subdomains are searched, and anything else fails with
    /// [`LcGridError::OutOfNeighborhood`].
    pub fn position_to_rank(&self, pos: &Point3) -> Result<Rank, LcGridError> {
        let m = self.gbox.midpoint(self.gbox.cell_at_pos(pos));

        if self.is_regular_grid {
            let mut c = [0i64; 3];
            for d in 0..3 {
                let dims = self.cart.dims()[d] as f64;
                let mut cd = ((m[d] / self.gbox.box_size()[d]) * dims).floor() as i64;
                // Snap to the exact half-open bounds the octagons use, so
                // both resolution paths agree on boundary midpoints.
                if m[d] >= regular_bound(&self.gbox, &self.cart, d, cd) {
                    cd += 1;
                } else if cd > 0 && m[d] < regular_bound(&self.gbox, &self.cart, d, cd - 1) {
                    cd -= 1;
                }
                c[d] = cd;
            }
            return Ok(self.cart.rank_of(c));
        }

        if self.my_dom.contains(&m) {
            return Ok(self.rank);
        }
        for (i, dom) in self.neighbor_doms.iter().enumerate() {
            if dom.contains(&m) {
                return Ok(self.graph.neighbor_ranks()[i]);
            }
        }
        Err(LcGridError::OutOfNeighborhood { pos: *pos })
    }

    /// Neighbor-list index of the rank owning `pos`.
    ///
    /// Fails with [`LcGridError::NotANeighbor`] when `pos` is owned by
    /// this process itself.
    pub fn position_to_neighidx(&self, pos: &Point3) -> Result<usize, LcGridError> {
        let rank = self.position_to_rank(pos)?;
        self.graph
            .neighbor_index(rank)
            .ok_or(LcGridError::NotANeighbor {
                rank,
                this: self.rank,
            })
    }

    /// Mean position of the particles owned by this process.
    ///
    /// With no particles this falls back to the unweighted mean of the
    /// owned-cell midpoints; every cell counts equally there, regardless
    /// of its load weight.
    fn center_of_load(&self, particles: &[Point3]) -> Point3 {
        let mut c = [0.0; 3];
        let mut npart = 0usize;
        for p in particles {
            for d in 0..3 {
                c[d] += p[d];
            }
            npart += 1;
        }

        if npart == 0 {
            for i in 0..self.nlocal {
                let mp = self.gbox.midpoint(self.cells[i]);
                for d in 0..3 {
                    c[d] += mp[d];
                }
                npart += 1;
            }
        }

        for d in 0..3 {
            c[d] /= npart as f64;
        }
        c
    }

    /// One Begau–Sutmann repartition step. Collective on the Cartesian
    /// communicator and the neighbor graph.
    ///
    /// Gathers the neighborhood loads and centers of load, displaces this
    /// process's gridpoint by `mu` along the resulting force (only in
    /// dimensions where the process is not at the top face of the process
    /// grid, which pins one gridpoint per periodic axis line), and checks
    /// the new corner set for collisions. The check is unanimous: either
    /// every process accepts the move — octagons are rebuilt,
    /// `exchange_start_callback` runs once, and the cell layout is
    /// reinitialized — or every process rolls back to the exact prior
    /// state and `Ok(false)` is returned. A rejected move leaves all
    /// replicated state bitwise unchanged; callers may retry with a
    /// smaller `mu`.
    pub fn repartition<M, F>(
        &mut self,
        metric: &M,
        exchange_start_callback: F,
    ) -> Result<bool, LcGridError>
    where
        M: CellMetric + ?Sized,
        F: FnOnce(),
    {
        let nneigh = self.graph.indegree();

        let weights = metric.weights();
        debug_assert_eq!(weights.len(), self.nlocal, "one weight per local cell");
        let lambda_p: f64 = weights.iter().sum();
        let r_p = self.center_of_load(&metric.particle_positions());

        let lambda = self
            .graph
            .neighbor_allgather(&self.comm, TAG_LOAD, &[lambda_p]);
        let lnormalizer = lambda.iter().sum::<f64>() / nneigh as f64;

        let r = self
            .graph
            .neighbor_allgather(&self.comm, TAG_CENTER, r_p.as_slice());

        // Force on this gridpoint: heavier-than-average subdomains around
        // it pull it toward their center of load, lighter ones push.
        let mut f = vec![0.0; 3 * nneigh];
        for i in 0..nneigh {
            // An entirely unloaded neighborhood exerts no force.
            let lambda_hat = if lnormalizer > 0.0 {
                lambda[i] / lnormalizer
            } else {
                1.0
            };
            let mut u = [0.0; 3];
            for d in 0..3 {
                u[d] = r[3 * i + d] - self.gridpoint[d];
            }
            let len = (u[0] * u[0] + u[1] * u[1] + u[2] * u[2]).sqrt();
            if len == 0.0 {
                continue;
            }
            for d in 0..3 {
                f[3 * i + d] = (lambda_hat - 1.0) * u[d] / len;
            }
        }

        let coords = self.cart.coords_of(self.rank);
        let dims = self.cart.dims();
        let mut new_c = self.gridpoint;
        for d in 0..3 {
            // Gridpoints at the top face stay pinned; forces from across
            // the periodic boundary are not applied, so no mirroring of
            // gathered centers is needed either.
            if coords[d] == dims[d] - 1 {
                continue;
            }
            for i in 0..nneigh {
                new_c[d] += self.mu * f[3 * i + d];
            }
        }

        let old_gridpoint = self.gridpoint;
        let old_gridpoints = std::mem::take(&mut self.gridpoints);

        self.gridpoint = new_c;
        let flat = all_gather(&self.comm, TAG_GRIDPOINTS, self.gridpoint.as_slice());
        self.gridpoints = flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect();

        // Admissibility: subdomains may be non-convex, but gridpoints
        // must not collide. Count corner pairs closer than twice the
        // minimum cell edge and reject unanimously if any process sees
        // one.
        let cs = self.gbox.cell_size();
        let min_cell_size = cs[0].min(cs[1]).min(cs[2]);

        let bb = self.bounding_box(self.rank);
        let mut nconflicts = 0u64;
        for i in 0..bb.len() {
            for j in i + 1..bb.len() {
                if dist(bb[i], bb[j]) < 2.0 * min_cell_size {
                    nconflicts += 1;
                }
            }
        }
        let nconflicts = all_reduce_sum_u64(&self.comm, TAG_CONFLICTS, nconflicts);

        if nconflicts > 0 {
            log::warn!(
                "rank {}: gridpoint update rejected, {} corner conflicts",
                self.rank,
                nconflicts
            );
            self.gridpoints = old_gridpoints;
            self.gridpoint = old_gridpoint;
            return Ok(false);
        }

        self.is_regular_grid = false;

        self.init_octagons();
        exchange_start_callback();
        self.reinit()?;

        Ok(true)
    }

    /// Process a runtime command. Recognized: `mu = <float>` sets the
    /// gridpoint displacement step size. Unrecognized strings are ignored
    /// silently.
    pub fn command(&mut self, s: &str) {
        if let Some(mu) = parse_assignment::<f64>(s, "mu") {
            self.mu = mu;
            if self.rank == 0 {
                log::info!("setting mu = {}", self.mu);
            }
        }
    }
}

/// Upper boundary of process-coordinate `k` in dimension `d` of the
/// regular Cartesian split. This is the exact expression gridpoints are
/// initialized from, so boundary comparisons agree bit-for-bit with the
/// octagon corners.
fn regular_bound(gbox: &GlobalBox, cart: &CartGrid, d: usize, k: i64) -> f64 {
    (k + 1) as f64 * gbox.box_size()[d] / cart.dims()[d] as f64
}

impl<C: Communicator> DebugInvariants for GridBasedPartition<C> {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "gridbased partition");
    }

    fn validate_invariants(&self) -> Result<(), LcGridError> {
        if self.nlocal == 0 {
            return Err(LcGridError::EmptySubdomain { rank: self.rank });
        }
        // A lone process has no ghost layer; everyone else must have one.
        if self.comm.size() > 1 && self.nghost == 0 {
            return Err(LcGridError::BrokenExchange {
                rank: self.rank,
                what: "no ghost cells despite multiple processes",
            });
        }
        for v in &self.exchange_vec {
            if v.dest == self.rank || self.graph.neighbor_index(v.dest).is_none() {
                return Err(LcGridError::BrokenExchange {
                    rank: self.rank,
                    what: "destination is self or not a neighbor",
                });
            }
            if v.send.iter().any(|&l| l >= self.nlocal) {
                return Err(LcGridError::BrokenExchange {
                    rank: self.rank,
                    what: "send list contains a ghost cell",
                });
            }
            if v.recv
                .iter()
                .any(|&l| l < self.nlocal || l >= self.nlocal + self.nghost)
            {
                return Err(LcGridError::BrokenExchange {
                    rank: self.rank,
                    what: "recv list contains a non-ghost cell",
                });
            }
        }
        Ok(())
    }
}
