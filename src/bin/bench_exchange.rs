use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Instant;
use neighbor_particles::neighbor::{
    Communicator, Geometry, IntBox, NeighborConfig, NeighborParticles, ParticleLayout, TileLayout, Topology,
    run_ranks,
};

const DOMAIN_CELLS: i32 = 256;
const PARTICLES_PER_RANK: usize = 100_000;
const ROUNDS: usize = 10;

fn bench_ranks(ranks: usize, compact: bool) -> (f64, f64, u64) {
    let geom = Geometry::new(
        IntBox::from_slices(&[0, 0], &[DOMAIN_CELLS - 1, DOMAIN_CELLS - 1]),
        &[0.0, 0.0],
        &[1.0, 1.0],
    )
    .expect("valid geometry")
    .with_periodicity(&[true, true]);
    let topology: Arc<dyn Topology> =
        Arc::new(TileLayout::chopped(geom, 32, 32, ranks).expect("valid layout"));

    let per_rank = run_ranks(ranks, |comm| {
        let rank = comm.rank();
        let mut layout = ParticleLayout::new(2, 4, 2).expect("valid layout");
        if compact {
            layout = layout
                .with_masks(&[true, true, true, false, false, false], &[true, true, false, false])
                .expect("mask lengths");
        }
        let config = NeighborConfig::default().thread_count(2);
        let mut pc = NeighborParticles::with_config(layout, Arc::clone(&topology), comm, config)
            .expect("container");

        let local: Vec<_> = topology.tiles(0).iter().filter(|t| t.owner == rank).cloned().collect();
        let dx = 1.0 / DOMAIN_CELLS as f64;
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED_0000 + rank as u64);
        for i in 0..PARTICLES_PER_RANK {
            let tile = &local[rng.random_range(0..local.len())];
            let bx = tile.tilebox;
            let x = dx * rng.random_range(bx.lo[0] as f64..(bx.hi[0] + 1) as f64);
            let y = dx * rng.random_range(bx.lo[1] as f64..(bx.hi[1] + 1) as f64);
            pc.add_particle(0, tile.key, &[x, y, 1.0, 0.0, 0.0, 0.0], &[i as i32, rank as i32, 0, 0])
                .expect("local tile");
        }

        let start = Instant::now();
        pc.fill_neighbors();
        let fill_ms = start.elapsed().as_secs_f64() * 1000.0;

        let start = Instant::now();
        for _ in 0..ROUNDS {
            pc.update_neighbors(true);
        }
        let update_ms = start.elapsed().as_secs_f64() * 1000.0 / ROUNDS as f64;
        (fill_ms, update_ms, pc.stats().bytes_sent)
    });

    let fill_ms = per_rank.iter().map(|r| r.0).fold(0.0, f64::max);
    let update_ms = per_rank.iter().map(|r| r.1).fold(0.0, f64::max);
    let bytes = per_rank.iter().map(|r| r.2).sum();
    (fill_ms, update_ms, bytes)
}

fn main() {
    println!(
        "{:<8} {:>8} {:>12} {:>12} {:>14}",
        "Ranks", "Compact", "Fill(ms)", "Update(ms)", "Bytes sent"
    );
    println!("{}", "-".repeat(58));

    for ranks in [2usize, 4, 8] {
        for compact in [false, true] {
            let (fill_ms, update_ms, bytes) = bench_ranks(ranks, compact);
            println!("{:<8} {:>8} {:>12.2} {:>12.3} {:>14}", ranks, compact, fill_ms, update_ms, bytes);
        }
    }
}
