//! Tile identity, copy instructions and the mesh topology seam.
//!
//! The mesh hierarchy itself lives outside this crate. The engine only needs
//! to iterate tiles per level, look up who owns a tile, and ask the level
//! geometry about periodicity and binning; `Topology` is that surface.
//! `TileLayout` is a plain in-memory topology used by the driver and tests.

use std::collections::HashMap;

use super::error::NeighborError;
use super::geometry::{Geometry, IntBox, IntVect};
use super::layout::MAX_DIM;

/// `(grid index, local tile index)` of a tile within one level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub grid: i32,
    pub tile: i32,
}

impl TileKey {
    #[inline]
    pub const fn new(grid: i32, tile: i32) -> Self {
        Self { grid, tile }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileInfo {
    pub key: TileKey,
    pub owner: usize,
    /// Cells covered by the tile at its own level.
    pub tilebox: IntBox,
}

/// One particle replication: source slot to destination slot, optionally
/// through a periodic image.
///
/// For a same-process destination `dst_index` is the slot in that tile's
/// ghost buffer. For another process it is the byte offset of the compact
/// record inside the send buffer for that process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyTag {
    pub src_level: u32,
    pub src_key: TileKey,
    pub src_index: usize,
    pub level: u32,
    pub dst_key: TileKey,
    pub dst_index: usize,
    /// Image offset in domain lengths; the copied position moves by
    /// `periodic_shift[d] * L[d]` along periodic dimensions.
    pub periodic_shift: [i8; MAX_DIM],
}

pub trait Topology: Send + Sync {
    fn num_levels(&self) -> usize;

    fn num_ranks(&self) -> usize;

    fn geometry(&self, level: usize) -> &Geometry;

    /// Refinement ratio from `level` down to level 0.
    fn ref_ratio_to_base(&self, level: usize) -> IntVect;

    /// Every tile on `level`, on every process, in iteration order.
    fn tiles(&self, level: usize) -> &[TileInfo];

    fn tile(&self, level: usize, key: TileKey) -> Option<&TileInfo>;

    fn owner(&self, level: usize, key: TileKey) -> Option<usize> {
        self.tile(level, key).map(|t| t.owner)
    }
}

struct LevelLayout {
    geometry: Geometry,
    ref_ratio: IntVect,
    tiles: Vec<TileInfo>,
    index: HashMap<TileKey, usize>,
}

pub struct TileLayout {
    num_ranks: usize,
    levels: Vec<LevelLayout>,
}

impl TileLayout {
    pub fn new(num_ranks: usize) -> Self {
        Self {
            num_ranks: num_ranks.max(1),
            levels: Vec::new(),
        }
    }

    /// Append a level and return its index.
    pub fn add_level(&mut self, geometry: Geometry, ref_ratio_to_base: IntVect) -> Result<usize, NeighborError> {
        let level = self.levels.len();
        if ref_ratio_to_base.iter().any(|r| *r <= 0) {
            return Err(NeighborError::RefRatio {
                level,
                ratio: ref_ratio_to_base,
            });
        }
        if let Some(base) = self.levels.first() {
            if base.geometry.dim() != geometry.dim() {
                return Err(NeighborError::GeometryDimension {
                    level,
                    expected: base.geometry.dim(),
                    got: geometry.dim(),
                });
            }
        }
        self.levels.push(LevelLayout {
            geometry,
            ref_ratio: ref_ratio_to_base,
            tiles: Vec::new(),
            index: HashMap::new(),
        });
        Ok(level)
    }

    pub fn add_tile(&mut self, level: usize, key: TileKey, owner: usize, tilebox: IntBox) -> Result<(), NeighborError> {
        let num_levels = self.levels.len();
        let num_ranks = self.num_ranks;
        let lev = self
            .levels
            .get_mut(level)
            .ok_or(NeighborError::UnknownLevel { level, num_levels })?;
        if owner >= num_ranks {
            return Err(NeighborError::OwnerOutOfRange {
                level,
                key,
                owner,
                num_ranks,
            });
        }
        if tilebox.is_empty() || !lev.geometry.domain().contains_box(&tilebox) {
            return Err(NeighborError::TileOutsideDomain { level, key });
        }
        if lev.index.contains_key(&key) {
            return Err(NeighborError::DuplicateTile { level, key });
        }
        lev.index.insert(key, lev.tiles.len());
        lev.tiles.push(TileInfo { key, owner, tilebox });
        Ok(())
    }

    /// Single-level layout: the domain is chopped into grids of `grid_size`
    /// cells, each grid into tiles of `tile_size` cells, and grids are dealt
    /// to ranks in contiguous blocks.
    pub fn chopped(geometry: Geometry, grid_size: i32, tile_size: i32, num_ranks: usize) -> Result<Self, NeighborError> {
        let mut layout = Self::new(num_ranks);
        let dim = geometry.dim();
        let domain = *geometry.domain();
        layout.add_level(geometry, [1; MAX_DIM])?;

        let grids = chop(&domain, grid_size.max(1), dim);
        let num_grids = grids.len();
        for (g, grid_box) in grids.iter().enumerate() {
            let owner = g * layout.num_ranks / num_grids.max(1);
            for (t, tilebox) in chop(grid_box, tile_size.max(1), dim).into_iter().enumerate() {
                layout.add_tile(0, TileKey::new(g as i32, t as i32), owner, tilebox)?;
            }
        }
        Ok(layout)
    }
}

/// Split `bx` into boxes of at most `size` cells along each of the first `dim`
/// dimensions, dimension 0 fastest.
fn chop(bx: &IntBox, size: i32, dim: usize) -> Vec<IntBox> {
    let mut counts = [1i32; MAX_DIM];
    for d in 0..dim {
        counts[d] = (bx.length(d) + size - 1) / size;
    }
    let blocks = IntBox::new([0; MAX_DIM], [counts[0] - 1, counts[1] - 1, counts[2] - 1]);
    blocks
        .cells()
        .map(|b| {
            let mut out = *bx;
            for d in 0..dim {
                out.lo[d] = bx.lo[d] + b[d] * size;
                out.hi[d] = (out.lo[d] + size - 1).min(bx.hi[d]);
            }
            out
        })
        .collect()
}

impl Topology for TileLayout {
    fn num_levels(&self) -> usize {
        self.levels.len()
    }

    fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    fn geometry(&self, level: usize) -> &Geometry {
        &self.levels[level].geometry
    }

    fn ref_ratio_to_base(&self, level: usize) -> IntVect {
        self.levels[level].ref_ratio
    }

    fn tiles(&self, level: usize) -> &[TileInfo] {
        &self.levels[level].tiles
    }

    fn tile(&self, level: usize, key: TileKey) -> Option<&TileInfo> {
        let lev = self.levels.get(level)?;
        lev.index.get(&key).map(|&i| &lev.tiles[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom_2d(n: i32) -> Geometry {
        Geometry::new(IntBox::from_slices(&[0, 0], &[n - 1, n - 1]), &[0.0, 0.0], &[1.0, 1.0]).unwrap()
    }

    #[test]
    fn chopped_covers_domain_without_overlap() {
        let layout = TileLayout::chopped(geom_2d(10), 5, 3, 2).unwrap();
        let tiles = layout.tiles(0);
        let covered: usize = tiles.iter().map(|t| t.tilebox.num_cells()).sum();
        assert_eq!(covered, 100);
        for (i, a) in tiles.iter().enumerate() {
            for b in &tiles[i + 1..] {
                assert!(!a.tilebox.intersects(&b.tilebox), "{a:?} overlaps {b:?}");
            }
        }
        // Four 5x5 grids split between two ranks in blocks.
        let owners: Vec<usize> = (0..4)
            .map(|g| layout.owner(0, TileKey::new(g, 0)).unwrap())
            .collect();
        assert_eq!(owners, vec![0, 0, 1, 1]);
    }

    #[test]
    fn add_tile_validates_owner_and_duplicates() {
        let mut layout = TileLayout::new(2);
        let level = layout.add_level(geom_2d(4), [1, 1, 1]).unwrap();
        let bx = IntBox::from_slices(&[0, 0], &[1, 1]);
        layout.add_tile(level, TileKey::new(0, 0), 1, bx).unwrap();
        assert_eq!(
            layout.add_tile(level, TileKey::new(0, 0), 0, bx),
            Err(NeighborError::DuplicateTile {
                level,
                key: TileKey::new(0, 0)
            })
        );
        assert!(matches!(
            layout.add_tile(level, TileKey::new(1, 0), 2, bx),
            Err(NeighborError::OwnerOutOfRange { owner: 2, .. })
        ));
        assert!(matches!(
            layout.add_tile(level, TileKey::new(2, 0), 0, IntBox::from_slices(&[3, 3], &[4, 4])),
            Err(NeighborError::TileOutsideDomain { .. })
        ));
        assert!(matches!(
            layout.add_tile(5, TileKey::new(0, 0), 0, bx),
            Err(NeighborError::UnknownLevel { level: 5, .. })
        ));
    }

    #[test]
    fn tile_keys_order_by_grid_then_tile() {
        let mut keys = vec![TileKey::new(1, 0), TileKey::new(0, 2), TileKey::new(0, 1)];
        keys.sort();
        assert_eq!(keys, vec![TileKey::new(0, 1), TileKey::new(0, 2), TileKey::new(1, 0)]);
    }
}
