//! `Octagon`: point-in-subdomain test for an 8-corner polyhedron.
//!
//! A process's subdomain is spanned by the eight gridpoints surrounding
//! it. Corner `i` encodes a 3-bit offset `(off_x, off_y, off_z)` (bit set
//! = one step toward the lower neighbor in that dimension), so corner 0 is
//! the process's own gridpoint (the upper-right-back corner) and corner 7
//! the lower-left-front one. The polyhedron need not be convex; the only
//! geometric requirement is that gridpoints do not collide, which the
//! partitioner's admissibility check enforces.
//!
//! Containment decomposes the polyhedron into six tetrahedra around the
//! main diagonal (corner 7 → corner 0). The decomposition triangulates
//! every face with the diagonal through the face's offset-0 and offset-3
//! corners, so two octagons sharing a face triangulate it identically and
//! their containment answers partition space.
//!
//! The test is half-open: a point strictly inside any tetrahedron is
//! contained; a point exactly on a face plane is contained only if the
//! face's inward normal is lexicographically positive. On an axis-aligned
//! grid this reduces to `[lo, hi)` ownership per dimension, which is the
//! tie-break that keeps every cell midpoint owned by exactly one process
//! even when a subdomain boundary crosses a midpoint plane.

use crate::grid::Point3;

/// Kuhn triangulation of the 8-corner polyhedron: each tetrahedron walks
/// the main diagonal from corner 7 to corner 0, lowering one offset bit
/// at a time (one path per permutation of the three dimensions).
const TETS: [[usize; 4]; 6] = [
    [7, 3, 1, 0],
    [7, 3, 2, 0],
    [7, 5, 1, 0],
    [7, 5, 4, 0],
    [7, 6, 2, 0],
    [7, 6, 4, 0],
];

/// Faces of a tetrahedron `[t0, t1, t2, t3]`, each paired with the
/// opposite vertex used to orient the face inward.
const FACES: [([usize; 3], usize); 4] = [
    ([1, 2, 3], 0),
    ([0, 2, 3], 1),
    ([0, 1, 3], 2),
    ([0, 1, 2], 3),
];

#[inline]
fn sub(a: Point3, b: Point3) -> Point3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
fn cross(a: Point3, b: Point3) -> Point3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[inline]
fn dot(a: Point3, b: Point3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// First nonzero component is positive.
#[inline]
fn lex_positive(n: Point3) -> bool {
    for c in n {
        if c > 0.0 {
            return true;
        }
        if c < 0.0 {
            return false;
        }
    }
    false
}

/// Subdomain polyhedron defined by 8 corner points.
#[derive(Clone, Debug, PartialEq)]
pub struct Octagon {
    corners: [Point3; 8],
}

impl Octagon {
    /// Build from the 8 corners, indexed by offset bits
    /// `i = off_x·4 + off_y·2 + off_z`.
    pub fn new(corners: [Point3; 8]) -> Self {
        Self { corners }
    }

    /// The corner points.
    #[inline]
    pub fn corners(&self) -> &[Point3; 8] {
        &self.corners
    }

    /// Half-open containment test; see the module docs for the boundary
    /// convention.
    pub fn contains(&self, p: &Point3) -> bool {
        TETS.iter().any(|tet| self.tet_contains(tet, p))
    }

    fn tet_contains(&self, tet: &[usize; 4], p: &Point3) -> bool {
        for (face, opp) in FACES.iter() {
            let a = self.corners[tet[face[0]]];
            let b = self.corners[tet[face[1]]];
            let c = self.corners[tet[face[2]]];
            let opposite = self.corners[tet[*opp]];

            let mut n = cross(sub(b, a), sub(c, a));
            let side = dot(n, sub(opposite, a));
            if side == 0.0 {
                // Degenerate (flat) tetrahedron; contributes no volume.
                return false;
            }
            if side < 0.0 {
                n = [-n[0], -n[1], -n[2]];
            }

            let d = dot(n, sub(*p, a));
            if d < 0.0 {
                return false;
            }
            if d == 0.0 && !lex_positive(n) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Axis-aligned corners with the partitioner's bit convention:
    /// a set bit selects the low coordinate in that dimension.
    fn cube(lo: Point3, hi: Point3) -> Octagon {
        let mut corners = [[0.0; 3]; 8];
        for (i, corner) in corners.iter_mut().enumerate() {
            let off = [(i >> 2) & 1, (i >> 1) & 1, i & 1];
            for d in 0..3 {
                corner[d] = if off[d] == 1 { lo[d] } else { hi[d] };
            }
        }
        Octagon::new(corners)
    }

    #[test]
    fn unit_cube_contains_interior() {
        let oct = cube([0.0; 3], [1.0; 3]);
        assert!(oct.contains(&[0.5, 0.5, 0.5]));
        assert!(oct.contains(&[0.1, 0.9, 0.3]));
        assert!(!oct.contains(&[1.5, 0.5, 0.5]));
        assert!(!oct.contains(&[-0.1, 0.5, 0.5]));
    }

    #[test]
    fn boundary_is_half_open() {
        let oct = cube([0.0; 3], [1.0; 3]);
        // Low faces belong to the cube...
        assert!(oct.contains(&[0.0, 0.5, 0.5]));
        assert!(oct.contains(&[0.5, 0.0, 0.5]));
        assert!(oct.contains(&[0.5, 0.5, 0.0]));
        // ...high faces do not.
        assert!(!oct.contains(&[1.0, 0.5, 0.5]));
        assert!(!oct.contains(&[0.5, 1.0, 0.5]));
        assert!(!oct.contains(&[0.5, 0.5, 1.0]));
        // Corners follow the same rule.
        assert!(oct.contains(&[0.0, 0.0, 0.0]));
        assert!(!oct.contains(&[1.0, 1.0, 1.0]));
    }

    #[test]
    fn adjacent_cubes_claim_shared_face_once() {
        let a = cube([0.0; 3], [1.0; 3]);
        let b = cube([1.0, 0.0, 0.0], [2.0, 1.0, 1.0]);
        for p in [[1.0, 0.5, 0.5], [1.0, 0.25, 0.75], [1.0, 0.0, 0.0]] {
            assert!(!a.contains(&p), "{p:?} claimed by lower cube");
            assert!(b.contains(&p), "{p:?} not claimed by upper cube");
        }
    }

    #[test]
    fn internal_decomposition_faces_are_covered() {
        let oct = cube([0.0; 3], [1.0; 3]);
        // The main diagonal and the interior triangulation planes must not
        // open gaps between tetrahedra.
        for t in [0.25, 0.5, 0.75] {
            assert!(oct.contains(&[t, t, t]));
        }
        assert!(oct.contains(&[0.5, 0.5, 0.25]));
        assert!(oct.contains(&[0.5, 0.25, 0.5]));
    }

    #[test]
    fn warped_octagon_tracks_moved_corner() {
        let mut oct = cube([0.0; 3], [1.0; 3]);
        // Pull the upper-right-back corner inward.
        let mut corners = *oct.corners();
        corners[0] = [0.6, 0.6, 0.6];
        oct = Octagon::new(corners);
        assert!(oct.contains(&[0.2, 0.2, 0.2]));
        assert!(!oct.contains(&[0.9, 0.9, 0.9]));
        // Regions near untouched corners stay covered.
        assert!(oct.contains(&[0.1, 0.8, 0.1]));
    }

    #[test]
    fn grid_of_cubes_tiles_midpoints_exactly_once() {
        // 2x2x2 cubes over [0,2)^3; every probe point is owned by exactly
        // one cube, including points on shared faces and edges.
        let mut cubes = Vec::new();
        for x in 0..2 {
            for y in 0..2 {
                for z in 0..2 {
                    let lo = [x as f64, y as f64, z as f64];
                    let hi = [lo[0] + 1.0, lo[1] + 1.0, lo[2] + 1.0];
                    cubes.push(cube(lo, hi));
                }
            }
        }
        let probes = [
            [0.5, 0.5, 0.5],
            [1.0, 0.5, 0.5],
            [0.5, 1.0, 0.5],
            [1.0, 1.0, 0.5],
            [1.0, 1.0, 1.0],
            [0.0, 0.0, 0.0],
            [1.5, 1.0, 0.25],
        ];
        for p in probes {
            let owners = cubes.iter().filter(|c| c.contains(&p)).count();
            assert_eq!(owners, 1, "point {p:?} owned by {owners} cubes");
        }
    }
}
