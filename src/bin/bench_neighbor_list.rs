use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Instant;
use neighbor_particles::neighbor::{
    Geometry, IntBox, NeighborConfig, NeighborParticles, ParticleLayout, SerialComm, TileKey, TileLayout, Topology,
};

const DOMAIN_CELLS: i32 = 128;
const ROUNDS: usize = 5;

fn bench_list(particles: usize, threads: usize) -> (f64, f64, usize) {
    let geom = Geometry::new(
        IntBox::from_slices(&[0, 0], &[DOMAIN_CELLS - 1, DOMAIN_CELLS - 1]),
        &[0.0, 0.0],
        &[1.0, 1.0],
    )
    .expect("valid geometry")
    .with_periodicity(&[true, true]);
    let topology: Arc<dyn Topology> =
        Arc::new(TileLayout::chopped(geom, 32, 16, 1).expect("valid layout"));
    let layout = ParticleLayout::new(2, 0, 0).expect("valid layout");
    let config = NeighborConfig::default().thread_count(threads);
    let mut pc = NeighborParticles::with_config(layout, Arc::clone(&topology), SerialComm, config)
        .expect("container");

    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED_1234_ABCD_EF01);
    for i in 0..particles {
        let x: f64 = rng.random_range(0.0..1.0);
        let y: f64 = rng.random_range(0.0..1.0);
        let p = neighbor_particles::neighbor::Particle {
            real: vec![x, y],
            int: vec![i as i32 + 1, 0],
        };
        pc.add_particle_at(0, p.as_ref()).expect("particle inside domain");
    }

    let start = Instant::now();
    pc.fill_neighbors();
    let fill_ms = start.elapsed().as_secs_f64() * 1000.0;

    let cutoff2 = (1.0 / DOMAIN_CELLS as f64).powi(2);
    let start = Instant::now();
    for _ in 0..ROUNDS {
        pc.build_neighbor_list(
            |a, b| {
                let dx = a.pos(0) - b.pos(0);
                let dy = a.pos(1) - b.pos(1);
                dx * dx + dy * dy <= cutoff2
            },
            false,
        );
    }
    let list_ms = start.elapsed().as_secs_f64() * 1000.0 / ROUNDS as f64;

    let keys: Vec<TileKey> = pc.local_tiles(0).collect();
    let pairs = keys
        .iter()
        .filter_map(|k| pc.neighbor_list(0, *k))
        .flat_map(|l| l.blocks())
        .map(<[i32]>::len)
        .sum();
    (fill_ms, list_ms, pairs)
}

fn main() {
    let scales: &[usize] = &[10_000, 50_000, 200_000, 1_000_000];
    let threads: &[usize] = &[1, 2, 4, 8];

    println!(
        "{:<12} {:>8} {:>12} {:>12} {:>12}",
        "Particles", "Threads", "Fill(ms)", "List(ms)", "Pairs"
    );
    println!("{}", "-".repeat(60));

    for &n in scales {
        for &t in threads {
            let (fill_ms, list_ms, pairs) = bench_list(n, t);
            println!("{:<12} {:>8} {:>12.2} {:>12.2} {:>12}", n, t, fill_ms, list_ms, pairs);
        }
    }
}
