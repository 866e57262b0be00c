#[cfg(feature = "mimalloc-global")]
#[global_allocator]
static GLOBAL_ALLOCATOR: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use log::info;
use neighbor_particles::neighbor::{
    Communicator, ExchangeStats, Geometry, IntBox, NeighborConfig, NeighborParticles, ParticleLayout, TileLayout,
    Topology, run_ranks,
};
use rand::{Rng, SeedableRng};

type BoxError = Box<dyn Error + Send + Sync>;

/// Scatter random particles over a periodic unit square split across ranks,
/// build the ghost halo and neighbor lists, then refresh the halo a few times.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct Args {
    /// In-process ranks to run (ignored with --mpi)
    #[arg(short, long, default_value_t = 4)]
    ranks: usize,
    /// Particles generated per rank
    #[arg(short, long, default_value_t = 20_000)]
    particles: usize,
    /// Worker threads per rank (default: auto-detect)
    #[arg(short, long)]
    threads: Option<usize>,
    /// Interaction radius in cells
    #[arg(short, long, default_value_t = 1)]
    cells: i32,
    /// Domain cells per side
    #[arg(long, default_value_t = 128)]
    domain: i32,
    /// Grid size in cells; grids are dealt to ranks in blocks
    #[arg(long, default_value_t = 32)]
    grid: i32,
    /// Tile size in cells within a grid
    #[arg(long, default_value_t = 16)]
    tile: i32,
    /// Halo refreshes after the first full round
    #[arg(long, default_value_t = 5)]
    steps: usize,
    #[arg(long, default_value_t = 0x5EED_1234)]
    seed: u64,
    /// Sort each particle's partners
    #[arg(long)]
    sort: bool,
    /// Write neighbor lists to <DUMP>_level_<lev>.<rank>
    #[arg(long, value_name = "PREFIX")]
    dump: Option<String>,
    /// Run one rank per MPI process
    #[cfg(feature = "mpi")]
    #[arg(long)]
    mpi: bool,
}

#[derive(Debug)]
struct RankReport {
    rank: usize,
    owned: usize,
    ghosts: usize,
    pairs: usize,
    fill_ms: f64,
    list_ms: f64,
    update_ms: f64,
    stats: ExchangeStats,
}

fn build_topology(args: &Args, num_ranks: usize) -> Result<Arc<dyn Topology>, BoxError> {
    let n = args.domain.max(1);
    let geom = Geometry::new(IntBox::from_slices(&[0, 0], &[n - 1, n - 1]), &[0.0, 0.0], &[1.0, 1.0])?
        .with_periodicity(&[true, true]);
    Ok(Arc::new(TileLayout::chopped(geom, args.grid, args.tile, num_ranks)?))
}

fn run_rank<C: Communicator>(comm: C, args: &Args, topology: Arc<dyn Topology>) -> Result<RankReport, BoxError> {
    let rank = comm.rank();
    let layout = ParticleLayout::new(2, 2, 1)?.with_masks(&[true, true, true, false], &[true, true, false])?;
    let mut config = NeighborConfig::default().num_neighbor_cells(args.cells);
    if let Some(n) = args.threads {
        config = config.thread_count(n);
    }
    let mut pc = NeighborParticles::with_config(layout, Arc::clone(&topology), comm, config)?;

    let geom = topology.geometry(0);
    let dx = [geom.cell_size(0), geom.cell_size(1)];
    let local: Vec<_> = topology.tiles(0).iter().filter(|t| t.owner == rank).cloned().collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(args.seed ^ (rank as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    if !local.is_empty() {
        for i in 0..args.particles {
            let tile = &local[rng.random_range(0..local.len())];
            let bx = tile.tilebox;
            let x = geom.prob_lo(0) + dx[0] * rng.random_range(bx.lo[0] as f64..(bx.hi[0] + 1) as f64);
            let y = geom.prob_lo(1) + dx[1] * rng.random_range(bx.lo[1] as f64..(bx.hi[1] + 1) as f64);
            let mass = rng.random_range(0.5..1.5);
            let id = (rank * args.particles + i) as i32 + 1;
            pc.add_particle(0, tile.key, &[x, y, mass, 0.0], &[id, rank as i32, 0])?;
        }
    }

    let start = Instant::now();
    pc.fill_neighbors();
    let fill_ms = start.elapsed().as_secs_f64() * 1000.0;

    let cutoff = args.cells as f64 * dx[0].min(dx[1]);
    let cutoff2 = cutoff * cutoff;
    let start = Instant::now();
    pc.build_neighbor_list(
        |a, b| {
            let dx = a.pos(0) - b.pos(0);
            let dy = a.pos(1) - b.pos(1);
            dx * dx + dy * dy <= cutoff2
        },
        args.sort,
    );
    let list_ms = start.elapsed().as_secs_f64() * 1000.0;

    let start = Instant::now();
    for _ in 0..args.steps {
        pc.update_neighbors(true);
    }
    let update_ms = start.elapsed().as_secs_f64() * 1000.0 / args.steps.max(1) as f64;

    if let Some(prefix) = &args.dump {
        pc.write_neighbor_lists(prefix)?;
    }

    let pairs = pc
        .local_tiles(0)
        .filter_map(|key| pc.neighbor_list(0, key))
        .flat_map(|list| list.blocks())
        .map(<[i32]>::len)
        .sum();
    let report = RankReport {
        rank,
        owned: pc.num_particles(),
        ghosts: pc.num_ghosts(),
        pairs,
        fill_ms,
        list_ms,
        update_ms,
        stats: pc.stats(),
    };
    info!("rank {rank}: {report:?}");
    Ok(report)
}

fn print_summary(reports: &[RankReport]) {
    println!("rank      owned     ghosts      pairs   fill ms   list ms  update ms  sends  bytes out");
    for r in reports {
        println!(
            "{:>4} {:>10} {:>10} {:>10} {:>9.3} {:>9.3} {:>10.3} {:>6} {:>10}",
            r.rank,
            r.owned,
            r.ghosts,
            r.pairs,
            r.fill_ms,
            r.list_ms,
            r.update_ms,
            r.stats.data_sends,
            r.stats.bytes_sent
        );
    }
    let ghosts: usize = reports.iter().map(|r| r.ghosts).sum();
    let pairs: usize = reports.iter().map(|r| r.pairs).sum();
    println!("\n--- Summary ({} ranks) ---", reports.len());
    println!("ghosts: {ghosts}, neighbor pairs: {pairs}");
}

#[cfg(feature = "mpi")]
fn run_mpi(args: &Args) -> Result<(), BoxError> {
    use neighbor_particles::neighbor::comm::MpiComm;

    let _universe = mpi::initialize().ok_or("MPI is already initialized")?;
    let comm = MpiComm::world();
    let topology = build_topology(args, comm.size())?;
    let report = run_rank(comm, args, topology)?;
    print_summary(std::slice::from_ref(&report));
    Ok(())
}

fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();

    #[cfg(feature = "mpi")]
    if args.mpi {
        return run_mpi(&args);
    }

    let ranks = args.ranks.max(1);
    let topology = build_topology(&args, ranks)?;
    info!(
        "{ranks} ranks, {} tiles, {} particles per rank",
        topology.tiles(0).len(),
        args.particles
    );
    let reports = run_ranks(ranks, |comm| run_rank(comm, &args, Arc::clone(&topology)))
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;
    print_summary(&reports);
    Ok(())
}
