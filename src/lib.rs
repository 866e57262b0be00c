//! Ghost-particle halo exchange and linked-cell neighbor lists for particles
//! stored per tile on a distributed, optionally periodic mesh.

pub mod neighbor;
pub use neighbor::{
    Geometry, IntBox, NeighborConfig, NeighborError, NeighborList, NeighborParticles, ParticleLayout, TileKey,
    TileLayout,
};
