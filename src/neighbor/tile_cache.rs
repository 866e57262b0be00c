//! Copy-tag cache and per-round sizing tables.
//!
//! A `RoundPlan` is everything the fill needs to run without growing a
//! single buffer: the tags (per level, per source tile, per worker thread),
//! the exact ghost count of every local destination tile, and the byte
//! layout of every send buffer. Plans are produced by a `TagGenerator` and
//! reused until the topology, the particle set or the interaction radius
//! changes.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;

use super::arena::ParticleArray;
use super::exchange::{STREAM_HEADER_BYTES, TILE_HEADER_BYTES, write_i32};
use super::geometry::IntBox;
use super::layout::{MAX_DIM, ParticleLayout};
use super::tile::{CopyTag, TileKey, Topology};

/// Tags for one source tile, split by worker partition.
pub type ThreadTags = Vec<Vec<CopyTag>>;

#[derive(Clone, Debug, Default)]
pub struct TagCache {
    levels: Vec<BTreeMap<TileKey, ThreadTags>>,
}

impl TagCache {
    pub fn new(num_levels: usize) -> Self {
        Self {
            levels: vec![BTreeMap::new(); num_levels],
        }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn insert(&mut self, level: usize, key: TileKey, tags: ThreadTags) {
        self.levels[level].insert(key, tags);
    }

    pub fn tile(&self, level: usize, key: TileKey) -> Option<&ThreadTags> {
        self.levels.get(level)?.get(&key)
    }

    /// Source tiles of `level` with their per-thread tag lists, in key order.
    pub fn level(&self, level: usize) -> impl Iterator<Item = (&TileKey, &ThreadTags)> + '_ {
        self.levels[level].iter()
    }

    pub fn num_tags(&self) -> usize {
        self.levels
            .iter()
            .flat_map(|lev| lev.values())
            .flat_map(|threads| threads.iter())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_tags() == 0
    }
}

/// One destination tile inside a send buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendSection {
    pub level: u32,
    pub key: TileKey,
    /// Offset of the first compact record; the section header sits just before it.
    pub data_offset: usize,
    pub bytes: usize,
}

/// Byte layout of the buffer sent to one process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendLayout {
    pub total_bytes: usize,
    pub sections: Vec<SendSection>,
}

impl SendLayout {
    /// Write the stream header and every section header. Record bytes are
    /// left for the fill.
    pub fn write_headers(&self, buf: &mut [u8]) {
        assert_eq!(
            buf.len(),
            self.total_bytes,
            "send buffer length does not match its layout"
        );
        write_i32(buf, 0, self.sections.len() as i32);
        for section in &self.sections {
            let at = section.data_offset - TILE_HEADER_BYTES;
            write_i32(buf, at, section.level as i32);
            write_i32(buf, at + 4, section.key.grid);
            write_i32(buf, at + 8, section.key.tile);
            write_i32(buf, at + 12, section.bytes as i32);
        }
    }
}

/// Tags plus the exact sizes every buffer must have before the fill starts.
#[derive(Clone, Debug, Default)]
pub struct RoundPlan {
    pub tags: TagCache,
    /// Same-process ghost count per local destination tile, per level.
    pub ghost_sizes: Vec<BTreeMap<TileKey, usize>>,
    /// Send buffer layout per destination rank; only ranks with tags appear.
    pub send_layouts: BTreeMap<usize, SendLayout>,
    /// Number of tags whose destination lives on another process.
    pub remote_tags: usize,
}

impl RoundPlan {
    pub fn empty(num_levels: usize) -> Self {
        Self {
            tags: TagCache::new(num_levels),
            ghost_sizes: vec![BTreeMap::new(); num_levels],
            send_layouts: BTreeMap::new(),
            remote_tags: 0,
        }
    }

    pub fn ghost_size(&self, level: usize, key: TileKey) -> usize {
        self.ghost_sizes
            .get(level)
            .and_then(|lev| lev.get(&key))
            .copied()
            .unwrap_or(0)
    }

    /// Bytes this process will send to `rank` this round.
    pub fn send_bytes(&self, rank: usize) -> usize {
        self.send_layouts.get(&rank).map_or(0, |l| l.total_bytes)
    }
}

/// Read-only inputs for tag generation.
pub struct TagContext<'a> {
    pub topology: &'a dyn Topology,
    pub layout: &'a ParticleLayout,
    /// Owned particles of every local tile, per level.
    pub particles: &'a [BTreeMap<TileKey, ParticleArray>],
    pub rank: usize,
    pub num_threads: usize,
    pub num_neighbor_cells: i32,
}

/// Producer of copy tags and buffer sizes.
///
/// Implementations must hand out destination slots (ghost index or send
/// byte offset) that are unique across all tags of the plan, and size
/// `ghost_sizes` / `send_layouts` so every slot is in range. The fill
/// relies on both to write without synchronization.
pub trait TagGenerator: Send + Sync {
    fn generate(&self, ctx: &TagContext<'_>) -> RoundPlan;
}

/// Tags every particle whose cell, or a periodic image of it, falls within
/// `num_neighbor_cells` of another tile on the same level.
#[derive(Clone, Copy, Debug, Default)]
pub struct GeometricTagGenerator;

/// Discovery result: source slot, destination tile index on the level, image.
type Hit = (usize, usize, [i8; MAX_DIM]);

impl GeometricTagGenerator {
    fn discover(&self, ctx: &TagContext<'_>, level: usize, key: TileKey, particles: &ParticleArray) -> Vec<Vec<Hit>> {
        let geom = ctx.topology.geometry(level);
        let dim = geom.dim();
        let tiles = ctx.topology.tiles(level);
        let n = particles.len();
        let num_threads = ctx.num_threads.max(1);

        let cells: Vec<_> = (0..n)
            .into_par_iter()
            .map(|i| {
                let p = particles.get(i);
                geom.cell_index(&p.real()[..dim])
            })
            .collect();
        let Some(bbox) = bounding_box(&cells) else {
            return vec![Vec::new(); num_threads];
        };

        // Candidate (destination, image) pairs for this source tile.
        let mut candidates = Vec::new();
        for shift in geom.periodic_shifts() {
            let by = geom.shift_cells(shift);
            let image = bbox.shift(by);
            for (t, dst) in tiles.iter().enumerate() {
                if dst.key == key && shift == [0; MAX_DIM] {
                    continue;
                }
                let reach = dst.tilebox.grow(ctx.num_neighbor_cells, dim);
                if reach.intersects(&image) {
                    candidates.push((t, shift, by, reach));
                }
            }
        }

        (0..num_threads)
            .into_par_iter()
            .map(|t| {
                let start = t * n / num_threads;
                let end = (t + 1) * n / num_threads;
                let mut hits = Vec::new();
                for i in start..end {
                    let cell = cells[i];
                    for (dst, shift, by, reach) in &candidates {
                        let image = [cell[0] + by[0], cell[1] + by[1], cell[2] + by[2]];
                        if reach.contains(image) {
                            hits.push((i, *dst, *shift));
                        }
                    }
                }
                hits
            })
            .collect()
    }
}

impl TagGenerator for GeometricTagGenerator {
    fn generate(&self, ctx: &TagContext<'_>) -> RoundPlan {
        let num_levels = ctx.topology.num_levels();
        let cdata = ctx.layout.cdata_size();

        // Parallel discovery, serial slot assignment.
        let mut found: Vec<Vec<(TileKey, Vec<Vec<Hit>>)>> = Vec::with_capacity(num_levels);
        for level in 0..num_levels {
            let mut per_tile = Vec::new();
            if let Some(owned) = ctx.particles.get(level) {
                for (key, particles) in owned {
                    if particles.is_empty() {
                        continue;
                    }
                    per_tile.push((*key, self.discover(ctx, level, *key, particles)));
                }
            }
            found.push(per_tile);
        }

        // Pass 1: counts per destination.
        let mut plan = RoundPlan::empty(num_levels);
        let mut remote_counts: BTreeMap<usize, BTreeMap<(u32, TileKey), usize>> = BTreeMap::new();
        for (level, per_tile) in found.iter().enumerate() {
            let tiles = ctx.topology.tiles(level);
            for (_, threads) in per_tile {
                for &(_, dst, _) in threads.iter().flatten() {
                    let info = &tiles[dst];
                    if info.owner == ctx.rank {
                        *plan.ghost_sizes[level].entry(info.key).or_insert(0) += 1;
                    } else {
                        *remote_counts
                            .entry(info.owner)
                            .or_default()
                            .entry((level as u32, info.key))
                            .or_insert(0) += 1;
                        plan.remote_tags += 1;
                    }
                }
            }
        }

        // Send layouts: stream header, then per tile a header and its records.
        let mut cursors: BTreeMap<(usize, u32, TileKey), usize> = BTreeMap::new();
        for (rank, sections) in &remote_counts {
            let mut offset = STREAM_HEADER_BYTES;
            let mut layout = SendLayout::default();
            for (&(level, key), &count) in sections {
                offset += TILE_HEADER_BYTES;
                let bytes = count * cdata;
                layout.sections.push(SendSection {
                    level,
                    key,
                    data_offset: offset,
                    bytes,
                });
                cursors.insert((*rank, level, key), offset);
                offset += bytes;
            }
            layout.total_bytes = offset;
            plan.send_layouts.insert(*rank, layout);
        }

        // Pass 2: hand out slots in the same order.
        let mut ghost_cursors: Vec<BTreeMap<TileKey, usize>> = vec![BTreeMap::new(); num_levels];
        for (level, per_tile) in found.into_iter().enumerate() {
            let tiles = ctx.topology.tiles(level);
            for (key, threads) in per_tile {
                let tags: ThreadTags = threads
                    .into_iter()
                    .map(|hits| {
                        hits.into_iter()
                            .map(|(src_index, dst, periodic_shift)| {
                                let info = &tiles[dst];
                                let dst_index = if info.owner == ctx.rank {
                                    let slot = ghost_cursors[level].entry(info.key).or_insert(0);
                                    let index = *slot;
                                    *slot += 1;
                                    index
                                } else {
                                    let slot = cursors
                                        .get_mut(&(info.owner, level as u32, info.key))
                                        .unwrap_or_else(|| unreachable!("remote destination without a section"));
                                    let offset = *slot;
                                    *slot += cdata;
                                    offset
                                };
                                CopyTag {
                                    src_level: level as u32,
                                    src_key: key,
                                    src_index,
                                    level: level as u32,
                                    dst_key: info.key,
                                    dst_index,
                                    periodic_shift,
                                }
                            })
                            .collect()
                    })
                    .collect();
                plan.tags.insert(level, key, tags);
            }
        }
        plan
    }
}

fn bounding_box(cells: &[[i32; MAX_DIM]]) -> Option<IntBox> {
    let (first, rest) = cells.split_first()?;
    let mut bx = IntBox::cell(*first);
    for c in rest {
        for d in 0..MAX_DIM {
            bx.lo[d] = bx.lo[d].min(c[d]);
            bx.hi[d] = bx.hi[d].max(c[d]);
        }
    }
    Some(bx)
}

/// Every other process owning a tile within `num_neighbor_cells` of one of
/// `rank`'s tiles, periodic images included. The relation is symmetric.
pub fn neighbor_ranks(topology: &dyn Topology, rank: usize, num_neighbor_cells: i32) -> BTreeSet<usize> {
    let mut ranks = BTreeSet::new();
    for level in 0..topology.num_levels() {
        let geom = topology.geometry(level);
        let dim = geom.dim();
        let shifts: Vec<_> = geom
            .periodic_shifts()
            .into_iter()
            .map(|s| geom.shift_cells(s))
            .collect();
        let tiles = topology.tiles(level);
        for local in tiles.iter().filter(|t| t.owner == rank) {
            let reach = local.tilebox.grow(num_neighbor_cells, dim);
            for other in tiles.iter().filter(|t| t.owner != rank) {
                if ranks.contains(&other.owner) {
                    continue;
                }
                if shifts.iter().any(|by| reach.intersects(&other.tilebox.shift(*by))) {
                    ranks.insert(other.owner);
                }
            }
        }
    }
    ranks
}
