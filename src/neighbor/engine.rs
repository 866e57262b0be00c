use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use std::sync::OnceLock;

use log::{debug, warn};
use rayon::prelude::*;

use super::arena::{ParticleArray, ParticleRef};
use super::comm::Communicator;
use super::error::NeighborError;
use super::exchange::{ExchangeState, ExchangeStats, transfer, unpack};
use super::layout::{ParticleLayout, Real};
use super::neighbor_list::{NeighborList, TileSearch, build_tile};
use super::sync::{FillTargets, fill_from_cache};
use super::tile::{TileKey, Topology};
use super::tile_cache::{GeometricTagGenerator, RoundPlan, TagContext, TagGenerator, neighbor_ranks};

static PHYSICAL_CORES: OnceLock<usize> = OnceLock::new();

#[inline]
fn physical_core_count() -> usize {
    *PHYSICAL_CORES.get_or_init(|| num_cpus::get_physical().max(1))
}

#[inline]
fn auto_pool_thread_count_for_physical(physical: usize) -> usize {
    let physical = physical.max(1);
    if physical <= 8 {
        physical
    } else {
        physical.div_ceil(2).max(6)
    }
}

/// Resolve the thread count from a config, falling back to auto-detect.
fn resolve_thread_count(config: &NeighborConfig) -> usize {
    let mut threads = config
        .thread_count
        .unwrap_or_else(|| auto_pool_thread_count_for_physical(physical_core_count()));
    if let Some(cap) = config.max_threads {
        threads = threads.min(cap);
    }
    threads.max(1)
}

/// Configuration for a neighbor-particle container.
///
/// Use `NeighborConfig::default()` for auto-detected threads and a one-cell
/// interaction radius, or customise individual knobs via the builder methods.
#[derive(Clone, Debug)]
pub struct NeighborConfig {
    /// Worker threads for tag discovery, the fill and list building.
    /// `None` means auto-detect from physical cores.
    pub thread_count: Option<usize>,
    /// Hard upper bound on threads regardless of auto-detection.
    pub max_threads: Option<usize>,
    /// Interaction radius in cells.
    pub num_neighbor_cells: i32,
}

impl Default for NeighborConfig {
    fn default() -> Self {
        Self {
            thread_count: None,
            max_threads: None,
            num_neighbor_cells: 1,
        }
    }
}

impl NeighborConfig {
    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = Some(n.max(1));
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = Some(n.max(1));
        self
    }

    pub fn num_neighbor_cells(mut self, n: i32) -> Self {
        self.num_neighbor_cells = n.max(0);
        self
    }
}

type TileMap<T> = Vec<BTreeMap<TileKey, T>>;

/// Particles of this process's tiles plus their ghost halo.
///
/// A round (`fill_neighbors` / `update_neighbors`) resizes every local ghost
/// buffer to its same-process ghost count, fills it and the per-rank send
/// buffers in parallel from the tag cache, negotiates receive counts with the
/// neighbor ranks and appends whatever arrives. Every process of the
/// communicator must run the same sequence of rounds.
pub struct NeighborParticles<C: Communicator> {
    layout: ParticleLayout,
    topology: Arc<dyn Topology>,
    comm: C,
    pool: rayon::ThreadPool,
    num_threads: usize,
    num_neighbor_cells: i32,
    tag_generator: Box<dyn TagGenerator>,
    particles: TileMap<ParticleArray>,
    ghosts: TileMap<ParticleArray>,
    neighbor_lists: TileMap<NeighborList>,
    plan: Option<RoundPlan>,
    neighbor_ranks: BTreeSet<usize>,
    exchange: ExchangeState,
    stats: ExchangeStats,
}

impl<C: Communicator> NeighborParticles<C> {
    pub fn new(layout: ParticleLayout, topology: Arc<dyn Topology>, comm: C) -> Result<Self, NeighborError> {
        Self::with_config(layout, topology, comm, NeighborConfig::default())
    }

    pub fn with_config(
        layout: ParticleLayout,
        topology: Arc<dyn Topology>,
        comm: C,
        config: NeighborConfig,
    ) -> Result<Self, NeighborError> {
        let num_levels = topology.num_levels();
        if num_levels == 0 {
            return Err(NeighborError::NoLevels);
        }
        for level in 0..num_levels {
            let got = topology.geometry(level).dim();
            if got != layout.dim() {
                return Err(NeighborError::GeometryDimension {
                    level,
                    expected: layout.dim(),
                    got,
                });
            }
            let ratio = topology.ref_ratio_to_base(level);
            if ratio.iter().any(|r| *r <= 0) {
                return Err(NeighborError::RefRatio { level, ratio });
            }
        }
        if topology.num_ranks() != comm.size() {
            return Err(NeighborError::RankCount {
                topology: topology.num_ranks(),
                comm: comm.size(),
            });
        }

        let threads = resolve_thread_count(&config);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| NeighborError::ThreadPool(e.to_string()))?;

        let rank = comm.rank();
        let empty_tiles = |topology: &dyn Topology| -> TileMap<ParticleArray> {
            (0..num_levels)
                .map(|level| {
                    topology
                        .tiles(level)
                        .iter()
                        .filter(|t| t.owner == rank)
                        .map(|t| (t.key, ParticleArray::new(&layout)))
                        .collect()
                })
                .collect()
        };
        let particles = empty_tiles(&*topology);
        let ghosts = empty_tiles(&*topology);
        let neighbor_ranks = neighbor_ranks(&*topology, rank, config.num_neighbor_cells);
        debug!(
            "rank {rank}: {threads} threads, {} neighbor cells, neighbor ranks {neighbor_ranks:?}",
            config.num_neighbor_cells
        );

        Ok(Self {
            layout,
            topology,
            comm,
            pool,
            num_threads: threads,
            num_neighbor_cells: config.num_neighbor_cells,
            tag_generator: Box::new(GeometricTagGenerator),
            particles,
            ghosts,
            neighbor_lists: vec![BTreeMap::new(); num_levels],
            plan: None,
            neighbor_ranks,
            exchange: ExchangeState::default(),
            stats: ExchangeStats::default(),
        })
    }

    /// Replace the tag producer. Drops any cached plan.
    pub fn with_tag_generator(mut self, generator: impl TagGenerator + 'static) -> Self {
        self.tag_generator = Box::new(generator);
        self.plan = None;
        self
    }

    // ── accessors ──

    #[inline]
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn layout(&self) -> &ParticleLayout {
        &self.layout
    }

    pub fn topology(&self) -> &dyn Topology {
        &*self.topology
    }

    pub fn num_levels(&self) -> usize {
        self.particles.len()
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn num_neighbor_cells(&self) -> i32 {
        self.num_neighbor_cells
    }

    /// Ranks this process exchanges control words with every round.
    pub fn neighbor_ranks(&self) -> &BTreeSet<usize> {
        &self.neighbor_ranks
    }

    /// Keys of this process's tiles on `level`, in iteration order.
    pub fn local_tiles(&self, level: usize) -> impl Iterator<Item = TileKey> + '_ {
        self.particles[level].keys().copied()
    }

    pub fn particles(&self, level: usize, key: TileKey) -> Option<&ParticleArray> {
        self.particles.get(level)?.get(&key)
    }

    /// Mutable owned particles, e.g. to move them. Adding or removing
    /// particles invalidates the cached tags; follow with `fill_neighbors`.
    pub fn particles_mut(&mut self, level: usize, key: TileKey) -> Option<&mut ParticleArray> {
        self.particles.get_mut(level)?.get_mut(&key)
    }

    pub fn ghosts(&self, level: usize, key: TileKey) -> Option<&ParticleArray> {
        self.ghosts.get(level)?.get(&key)
    }

    pub fn neighbor_list(&self, level: usize, key: TileKey) -> Option<&NeighborList> {
        self.neighbor_lists.get(level)?.get(&key)
    }

    pub fn num_particles(&self) -> usize {
        self.particles.iter().flat_map(|l| l.values()).map(ParticleArray::len).sum()
    }

    pub fn num_ghosts(&self) -> usize {
        self.ghosts.iter().flat_map(|l| l.values()).map(ParticleArray::len).sum()
    }

    pub fn stats(&self) -> ExchangeStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ExchangeStats::default();
    }

    /// Change the interaction radius. Collective: every rank must make the
    /// same call before the next round.
    pub fn set_num_neighbor_cells(&mut self, n: i32) {
        let n = n.max(0);
        if n == self.num_neighbor_cells {
            return;
        }
        self.num_neighbor_cells = n;
        self.neighbor_ranks = neighbor_ranks(&*self.topology, self.comm.rank(), n);
        self.plan = None;
        self.exchange.reset();
    }

    // ── particles ──

    /// Append an owned particle to a local tile and return its slot.
    pub fn add_particle(&mut self, level: usize, key: TileKey, real: &[Real], int: &[i32]) -> Result<usize, NeighborError> {
        self.check_shape(real, int)?;
        let num_levels = self.particles.len();
        let rank = self.comm.rank();
        let tiles = self
            .particles
            .get_mut(level)
            .ok_or(NeighborError::UnknownLevel { level, num_levels })?;
        let arr = tiles.get_mut(&key).ok_or(NeighborError::NotLocal { level, key, rank })?;
        self.plan = None;
        Ok(arr.push(real, int))
    }

    /// Append `p` to whichever local tile on `level` contains its position.
    pub fn add_particle_at(&mut self, level: usize, p: ParticleRef<'_>) -> Result<(TileKey, usize), NeighborError> {
        self.check_shape(p.real(), p.int())?;
        if level >= self.particles.len() {
            return Err(NeighborError::UnknownLevel {
                level,
                num_levels: self.particles.len(),
            });
        }
        let geom = self.topology.geometry(level);
        let cell = geom.cell_index(&p.real()[..geom.dim()]);
        let rank = self.comm.rank();
        let Some(info) = self
            .topology
            .tiles(level)
            .iter()
            .find(|t| t.tilebox.contains(cell))
        else {
            return Err(NeighborError::TileOutsideDomain {
                level,
                key: TileKey::new(-1, -1),
            });
        };
        if info.owner != rank {
            return Err(NeighborError::NotLocal {
                level,
                key: info.key,
                rank,
            });
        }
        let key = info.key;
        let slot = self.add_particle(level, key, p.real(), p.int())?;
        Ok((key, slot))
    }

    fn check_shape(&self, real: &[Real], int: &[i32]) -> Result<(), NeighborError> {
        if real.len() != self.layout.real_stride() || int.len() != self.layout.int_stride() {
            return Err(NeighborError::RecordShape {
                expected_real: self.layout.real_stride(),
                expected_int: self.layout.int_stride(),
                got_real: real.len(),
                got_int: int.len(),
            });
        }
        Ok(())
    }

    // ── rounds ──

    /// Regenerate tags and buffer sizes, then run a full round.
    pub fn fill_neighbors(&mut self) {
        self.regenerate_plan();
        self.update_neighbors(false);
    }

    /// Rerun the fill and exchange from the cached tags, refreshing ghost
    /// contents from the current owned particles. Ghost membership only
    /// changes when the tags were invalidated (`add_particle`,
    /// `set_num_neighbor_cells`, `clear_neighbors`) and are regenerated here.
    ///
    /// With `reuse_counts` the count negotiation is skipped and the last
    /// negotiated receive sizes are trusted. Panics if the current tags would
    /// send any peer a different number of bytes than was negotiated.
    pub fn update_neighbors(&mut self, reuse_counts: bool) {
        if self.plan.is_none() {
            debug!("rank {}: tags were invalidated, regenerating", self.comm.rank());
            self.regenerate_plan();
        }
        let Some(plan) = self.plan.as_ref() else {
            return;
        };
        let rank = self.comm.rank();

        // Size everything before any write.
        for (level, tiles) in self.ghosts.iter_mut().enumerate() {
            for (key, arr) in tiles.iter_mut() {
                arr.clear();
                arr.resize(plan.ghost_size(level, *key));
            }
        }
        let mut send_buffers: BTreeMap<usize, Vec<u8>> = plan
            .send_layouts
            .iter()
            .map(|(dst, send)| {
                let mut buf = vec![0u8; send.total_bytes];
                send.write_headers(&mut buf);
                (*dst, buf)
            })
            .collect();

        {
            let targets = FillTargets::new(&mut self.ghosts, &mut send_buffers);
            let layout = &self.layout;
            let topology = &*self.topology;
            let particles = &self.particles;
            self.pool
                .install(|| fill_from_cache(layout, topology, rank, &plan.tags, particles, &targets));
        }
        self.stats.rounds += 1;

        let proceed = if reuse_counts && self.exchange.counts_valid() {
            self.exchange.assert_reusable(rank, plan);
            true
        } else {
            if reuse_counts {
                if self.exchange.has_negotiated() {
                    debug!("rank {rank}: last negotiation was skipped, negotiating again");
                } else {
                    warn!("rank {rank}: asked to reuse receive counts before any were negotiated");
                }
            }
            self.exchange
                .negotiate(&self.comm, &self.neighbor_ranks, plan, &mut self.stats)
        };
        if !proceed {
            self.stats.skipped_rounds += 1;
            debug!(
                "rank {rank}: round {} local only, {} ghosts",
                self.stats.rounds,
                self.num_ghosts()
            );
            return;
        }

        let recv_layout = self.exchange.recv_layout();
        let recv_buf = transfer(&self.comm, &send_buffers, &recv_layout, &mut self.stats);
        let received = unpack(&self.layout, &recv_buf, &recv_layout, &mut self.ghosts);
        debug!(
            "rank {rank}: round {}: {} tags ({} remote), sent to {} ranks, received {received} ghosts from {} ranks",
            self.stats.rounds,
            plan.tags.num_tags(),
            plan.remote_tags,
            send_buffers.len(),
            recv_layout.segments.len()
        );
    }

    /// Drop every ghost, the cached tags, the negotiated counts, the
    /// neighbor lists and the statistics. Only owned particles are kept.
    pub fn clear_neighbors(&mut self) {
        for arr in self.ghosts.iter_mut().flat_map(|l| l.values_mut()) {
            arr.clear();
        }
        for lists in &mut self.neighbor_lists {
            lists.clear();
        }
        self.plan = None;
        self.exchange.reset();
        self.stats = ExchangeStats::default();
    }

    fn regenerate_plan(&mut self) {
        let ctx = TagContext {
            topology: &*self.topology,
            layout: &self.layout,
            particles: &self.particles,
            rank: self.comm.rank(),
            num_threads: self.num_threads,
            num_neighbor_cells: self.num_neighbor_cells,
        };
        let generator = &*self.tag_generator;
        let plan = self.pool.install(|| generator.generate(&ctx));
        debug!(
            "rank {}: generated {} tags, {} off-process to {} ranks",
            self.comm.rank(),
            plan.tags.num_tags(),
            plan.remote_tags,
            plan.send_layouts.len()
        );
        self.plan = Some(plan);
    }

    // ── neighbor lists ──

    /// Rebuild every local tile's neighbor list from its owned particles and
    /// current ghosts. `check_pair` decides membership; `sort` orders each
    /// particle's partners ascending.
    pub fn build_neighbor_list<F>(&mut self, check_pair: F, sort: bool)
    where
        F: Fn(ParticleRef<'_>, ParticleRef<'_>) -> bool + Sync,
    {
        let base_geometry = self.topology.geometry(0);
        for level in 0..self.particles.len() {
            let ref_ratio = self.topology.ref_ratio_to_base(level);
            let jobs: Vec<(TileKey, TileSearch<'_>)> = self.particles[level]
                .iter()
                .filter_map(|(key, owned)| {
                    let info = self.topology.tile(level, *key)?;
                    let search = TileSearch {
                        owned,
                        ghosts: self.ghosts[level].get(key),
                        tilebox: info.tilebox,
                        ref_ratio,
                        base_geometry,
                        num_neighbor_cells: self.num_neighbor_cells,
                    };
                    Some((*key, search))
                })
                .collect();
            let check_pair = &check_pair;
            let lists: BTreeMap<TileKey, NeighborList> = self.pool.install(|| {
                jobs.par_iter()
                    .map(|(key, search)| (*key, build_tile(search, check_pair, sort)))
                    .collect()
            });
            self.neighbor_lists[level] = lists;
        }
    }

    /// Write each level's lists to `<prefix>_level_<level>.<rank>`. Tiles
    /// with empty lists are skipped; a level with nothing to write creates
    /// no file.
    pub fn write_neighbor_lists(&self, prefix: &str) -> io::Result<()> {
        let rank = self.comm.rank();
        for (level, lists) in self.neighbor_lists.iter().enumerate() {
            if lists.values().all(NeighborList::is_empty) {
                continue;
            }
            let path = format!("{prefix}_level_{level}.{rank}");
            let mut out = BufWriter::new(File::create(&path)?);
            for list in lists.values().filter(|l| !l.is_empty()) {
                list.write_to(&mut out)?;
            }
            out.flush()?;
            debug!("rank {rank}: wrote neighbor lists for level {level} to {path}");
        }
        Ok(())
    }
}
