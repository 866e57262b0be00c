//! Neighbor-particle engine internals and public API.

mod arena;
pub mod comm;
mod engine;
mod error;
mod exchange;
mod geometry;
mod layout;
mod neighbor_list;
mod sync;
mod tile;
mod tile_cache;

pub use arena::{Particle, ParticleArray, ParticleMut, ParticleRef};
pub use comm::{Communicator, SerialComm, ThreadComm, run_ranks};
pub use engine::{NeighborConfig, NeighborParticles};
pub use error::NeighborError;
pub use exchange::{ExchangeStats, RecvLayout, RecvSegment, STREAM_HEADER_BYTES, TILE_HEADER_BYTES};
pub use geometry::{Geometry, IntBox, IntVect};
pub use layout::{CPU_INDEX, ID_INDEX, MAX_DIM, NUM_IDENTITY_INTS, ParticleLayout, Real};
pub use neighbor_list::{Blocks, NO_PARTICLE, NeighborList};
pub use tile::{CopyTag, TileInfo, TileKey, TileLayout, Topology};
pub use tile_cache::{
    GeometricTagGenerator, RoundPlan, SendLayout, SendSection, TagCache, TagContext, TagGenerator, ThreadTags,
    neighbor_ranks,
};
