//! Construction-time errors.
//!
//! Only misconfiguration is reported through `Result`. Violations of the
//! round invariants (slot out of range, malformed receive stream, unknown
//! peer) mean the sizing contract was broken and abort via `panic!`.

use thiserror::Error;

use super::tile::TileKey;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NeighborError {
    #[error("spatial dimension must be in 1..=3, got {0}")]
    Dimension(usize),

    #[error("real mask has {got} entries but the record has {expected} real fields")]
    RealMaskLength { expected: usize, got: usize },

    #[error("int mask has {got} entries but the record has {expected} int fields")]
    IntMaskLength { expected: usize, got: usize },

    #[error("topology defines no levels")]
    NoLevels,

    #[error("level {level}: geometry is {got}-D but particles are {expected}-D")]
    GeometryDimension {
        level: usize,
        expected: usize,
        got: usize,
    },

    #[error("level {level}: refinement ratio to level 0 must be positive, got {ratio:?}")]
    RefRatio { level: usize, ratio: [i32; 3] },

    #[error("level {level} does not exist (topology has {num_levels})")]
    UnknownLevel { level: usize, num_levels: usize },

    #[error("level {level}: tile {key:?} is defined twice")]
    DuplicateTile { level: usize, key: TileKey },

    #[error("level {level}: tile {key:?} is owned by rank {owner} but there are only {num_ranks} ranks")]
    OwnerOutOfRange {
        level: usize,
        key: TileKey,
        owner: usize,
        num_ranks: usize,
    },

    #[error("level {level}: tile {key:?} does not lie inside the level domain")]
    TileOutsideDomain { level: usize, key: TileKey },

    #[error("topology spans {topology} ranks but the communicator has {comm}")]
    RankCount { topology: usize, comm: usize },

    #[error("level {level}: tile {key:?} is not owned by rank {rank}")]
    NotLocal {
        level: usize,
        key: TileKey,
        rank: usize,
    },

    #[error("record needs {expected_real} reals and {expected_int} ints, got {got_real} and {got_int}")]
    RecordShape {
        expected_real: usize,
        expected_int: usize,
        got_real: usize,
        got_int: usize,
    },

    #[error("invalid problem domain along dimension {dim}: [{lo}, {hi})")]
    ProblemDomain { dim: usize, lo: f64, hi: f64 },

    #[error("failed to build worker thread pool: {0}")]
    ThreadPool(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_offending_values() {
        let err = NeighborError::OwnerOutOfRange {
            level: 1,
            key: TileKey::new(4, 2),
            owner: 9,
            num_ranks: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("rank 9"));
        assert!(msg.contains("only 4 ranks"));
    }

    #[test]
    fn error_trait_works() {
        let err = NeighborError::Dimension(7);
        let dyn_err: &dyn std::error::Error = &err;
        assert_eq!(dyn_err.to_string(), "spatial dimension must be in 1..=3, got 7");
    }
}
