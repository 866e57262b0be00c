//! Linked-cell neighbor lists.
//!
//! Owned and ghost particles of one tile are binned into level-0 cells;
//! each bucket is a singly linked list threaded through a `next` array
//! (`NO_PARTICLE` terminates). For every owned particle the buckets within
//! `num_neighbor_cells` are scanned and accepted partners are recorded as
//! 1-based indices into the combined owned-then-ghost sequence.

use std::io::{self, Write};

use super::arena::{ParticleArray, ParticleRef};
use super::geometry::{Geometry, IntBox, IntVect};
use super::layout::MAX_DIM;

pub const NO_PARTICLE: i32 = -1;

/// Flat `[count, idx_1 .. idx_count]` blocks, one per owned particle, in
/// owned order. Indices are 1-based: owned particle `k` is `k + 1`, ghost
/// `g` is `num_owned + g + 1`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NeighborList {
    data: Vec<i32>,
}

impl NeighborList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of blocks (owned particles) in the list.
    pub fn num_particles(&self) -> usize {
        self.blocks().count()
    }

    pub fn blocks(&self) -> Blocks<'_> {
        Blocks { data: &self.data }
    }

    /// Partners of owned particle `i`. Linear in `i`.
    pub fn neighbors_of(&self, i: usize) -> Option<&[i32]> {
        self.blocks().nth(i)
    }

    /// Text dump: per owned particle `count: \n \t` then every index
    /// followed by a space, then a newline.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for block in self.blocks() {
            write!(out, "{}: \n \t", block.len())?;
            for idx in block {
                write!(out, "{idx} ")?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

pub struct Blocks<'a> {
    data: &'a [i32],
}

impl<'a> Iterator for Blocks<'a> {
    type Item = &'a [i32];

    fn next(&mut self) -> Option<&'a [i32]> {
        let (&count, rest) = self.data.split_first()?;
        let count = count as usize;
        assert!(count <= rest.len(), "neighbor list block claims {count} entries, {} remain", rest.len());
        let (block, tail) = rest.split_at(count);
        self.data = tail;
        Some(block)
    }
}

/// Inputs for one tile's list.
pub struct TileSearch<'a> {
    pub owned: &'a ParticleArray,
    pub ghosts: Option<&'a ParticleArray>,
    /// Tile box at its own level.
    pub tilebox: IntBox,
    /// Refinement ratio from the tile's level to level 0.
    pub ref_ratio: IntVect,
    pub base_geometry: &'a Geometry,
    pub num_neighbor_cells: i32,
}

impl<'a> TileSearch<'a> {
    fn num_owned(&self) -> usize {
        self.owned.len()
    }

    fn len(&self) -> usize {
        self.owned.len() + self.ghosts.map_or(0, ParticleArray::len)
    }

    #[inline]
    fn get(&self, i: usize) -> ParticleRef<'a> {
        let np = self.owned.len();
        if i < np {
            self.owned.get(i)
        } else {
            match self.ghosts {
                Some(ghosts) => ghosts.get(i - np),
                None => unreachable!("index {i} past {np} owned particles without ghosts"),
            }
        }
    }
}

/// Build the list for one tile. `check_pair(i, j)` is asked once for every
/// candidate `j != i` in range; accepted `j` are recorded. With `sort` each
/// block is ascending; otherwise block order is unspecified.
pub fn build_tile<F>(search: &TileSearch<'_>, check_pair: &F, sort: bool) -> NeighborList
where
    F: Fn(ParticleRef<'_>, ParticleRef<'_>) -> bool + ?Sized,
{
    let geom = search.base_geometry;
    let dim = geom.dim();
    let n = search.len();
    let np = search.num_owned();
    let reach = search.num_neighbor_cells;

    let cells: Vec<IntVect> = (0..n)
        .map(|i| geom.cell_index(&search.get(i).real()[..dim]))
        .collect();

    // The extra cell absorbs roundoff at tile faces. Owned particles that
    // have drifted past the tile still get a full search neighborhood.
    let mut bucket_box = search.tilebox.coarsen(search.ref_ratio).grow(reach + 1, dim);
    for cell in &cells[..np] {
        let around = IntBox::cell(*cell).grow(reach, dim);
        for d in 0..MAX_DIM {
            bucket_box.lo[d] = bucket_box.lo[d].min(around.lo[d]);
            bucket_box.hi[d] = bucket_box.hi[d].max(around.hi[d]);
        }
    }

    let mut head = vec![NO_PARTICLE; bucket_box.num_cells()];
    let mut next = vec![NO_PARTICLE; n];
    for (i, cell) in cells.iter().enumerate() {
        // Ghosts outside the bucket box are out of reach of every owned particle.
        if let Some(b) = bucket_box.linear_index(*cell) {
            next[i] = head[b];
            head[b] = i as i32;
        }
    }

    let mut data = Vec::new();
    for i in 0..np {
        let p = search.get(i);
        let count_at = data.len();
        data.push(0);
        for iv in IntBox::cell(cells[i]).grow(reach, dim).cells() {
            let Some(b) = bucket_box.linear_index(iv) else {
                continue;
            };
            let mut j = head[b];
            while j != NO_PARTICLE {
                let ju = j as usize;
                if ju != i && check_pair(p, search.get(ju)) {
                    data.push(j + 1);
                }
                j = next[ju];
            }
        }
        let block = &mut data[count_at + 1..];
        if sort {
            block.sort_unstable();
        }
        data[count_at] = (data.len() - count_at - 1) as i32;
    }
    NeighborList { data }
}
