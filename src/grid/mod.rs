//! Geometry of the global cell grid and of process subdomains.

pub mod cart;
pub mod globox;
pub mod octagon;

/// A point or vector in the simulation box.
pub type Point3 = [f64; 3];

pub use cart::CartGrid;
pub use globox::GlobalBox;
pub use octagon::Octagon;
