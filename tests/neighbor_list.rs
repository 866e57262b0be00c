use std::collections::HashSet;
use std::sync::Arc;

use neighbor_particles::neighbor::{
    Geometry, IntBox, NeighborConfig, NeighborParticles, ParticleArray, ParticleLayout, ParticleRef, SerialComm,
    TileKey, TileLayout, Topology,
};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};

fn periodic_square(cells: i32, grid: i32, tile: i32) -> Arc<dyn Topology> {
    let geom = Geometry::new(IntBox::from_slices(&[0, 0], &[cells - 1, cells - 1]), &[0.0, 0.0], &[1.0, 1.0])
        .unwrap()
        .with_periodicity(&[true, true]);
    Arc::new(TileLayout::chopped(geom, grid, tile, 1).unwrap())
}

fn within(cutoff: f64) -> impl Fn(ParticleRef<'_>, ParticleRef<'_>) -> bool + Sync {
    move |a, b| {
        let dx = a.pos(0) - b.pos(0);
        let dy = a.pos(1) - b.pos(1);
        dx * dx + dy * dy <= cutoff * cutoff
    }
}

fn container(topology: &Arc<dyn Topology>, cells: i32, threads: usize) -> NeighborParticles<SerialComm> {
    let layout = ParticleLayout::new(2, 0, 0).unwrap();
    let config = NeighborConfig::default().thread_count(threads).num_neighbor_cells(cells);
    NeighborParticles::with_config(layout, Arc::clone(topology), SerialComm, config).unwrap()
}

fn add_all(pc: &mut NeighborParticles<SerialComm>, level: usize, pts: &[(f64, f64)]) {
    for (i, (x, y)) in pts.iter().enumerate() {
        let real = [*x, *y];
        let int = [i as i32 + 1, 0];
        pc.add_particle_at(level, ParticleRef::new(&real, &int)).unwrap();
    }
}

fn combined<'a>(owned: &'a ParticleArray, ghosts: Option<&'a ParticleArray>) -> Vec<ParticleRef<'a>> {
    owned.iter().chain(ghosts.into_iter().flat_map(|g| g.iter())).collect()
}

/// Partners of owned particle `i`: every other particle within `reach`
/// level-0 cells that `check_pair` accepts, as sorted 1-based indices.
fn brute_force(
    base: &Geometry,
    all: &[ParticleRef<'_>],
    i: usize,
    reach: i32,
    check_pair: &dyn Fn(ParticleRef<'_>, ParticleRef<'_>) -> bool,
) -> Vec<i32> {
    let ci = base.cell_index(&all[i].real()[..2]);
    let mut out = Vec::new();
    for (j, p) in all.iter().enumerate() {
        if j == i {
            continue;
        }
        let cj = base.cell_index(&p.real()[..2]);
        let near = (0..2).all(|d| (ci[d] - cj[d]).abs() <= reach);
        if near && check_pair(all[i], *p) {
            out.push(j as i32 + 1);
        }
    }
    out
}

fn check_lists(
    pc: &NeighborParticles<SerialComm>,
    level: usize,
    check_pair: &dyn Fn(ParticleRef<'_>, ParticleRef<'_>) -> bool,
) -> usize {
    let base = pc.topology().geometry(0).clone();
    let reach = pc.num_neighbor_cells();
    let mut pairs = 0;
    for key in pc.local_tiles(level) {
        let owned = pc.particles(level, key).unwrap();
        let all = combined(owned, pc.ghosts(level, key));
        let list = pc.neighbor_list(level, key).unwrap();
        assert_eq!(list.num_particles(), owned.len(), "one block per owned particle in {key:?}");
        for (i, block) in list.blocks().enumerate() {
            let unique: HashSet<i32> = block.iter().copied().collect();
            assert_eq!(unique.len(), block.len(), "duplicate partner for {i} in {key:?}");
            assert!(!block.contains(&(i as i32 + 1)), "{i} lists itself in {key:?}");
            assert!(block.iter().all(|j| *j >= 1 && (*j as usize) <= all.len()));
            assert!(block.windows(2).all(|w| w[0] < w[1]), "block {i} in {key:?} is not sorted");
            assert_eq!(block, brute_force(&base, &all, i, reach, check_pair).as_slice(), "particle {i} in {key:?}");
            pairs += block.len();
        }
    }
    pairs
}

#[test]
fn random_cloud_matches_brute_force() {
    let topology = periodic_square(16, 8, 4);
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xC0FFEE);
    let pts: Vec<(f64, f64)> = (0..600)
        .map(|_| (rng.random_range(0.0..1.0), rng.random_range(0.0..1.0)))
        .collect();
    let mut pc = container(&topology, 1, 4);
    add_all(&mut pc, 0, &pts);
    pc.fill_neighbors();
    assert!(pc.num_ghosts() > 0);

    let cutoff = 1.0 / 16.0;
    let check_pair = within(cutoff);
    pc.build_neighbor_list(&check_pair, true);
    let pairs = check_lists(&pc, 0, &check_pair);
    assert!(pairs > 0);
}

#[test]
fn accept_all_lists_every_particle_in_reach() {
    let topology = periodic_square(16, 8, 4);
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let pts: Vec<(f64, f64)> = (0..200)
        .map(|_| (rng.random_range(0.0..1.0), rng.random_range(0.0..1.0)))
        .collect();
    let mut pc = container(&topology, 2, 2);
    add_all(&mut pc, 0, &pts);
    pc.fill_neighbors();

    let always = |_: ParticleRef<'_>, _: ParticleRef<'_>| true;
    pc.build_neighbor_list(always, true);
    check_lists(&pc, 0, &always);
}

#[test]
fn unsorted_blocks_hold_the_same_partners() {
    let topology = periodic_square(16, 8, 4);
    let mut rng = rand::rngs::StdRng::seed_from_u64(99);
    let pts: Vec<(f64, f64)> = (0..300)
        .map(|_| (rng.random_range(0.0..1.0), rng.random_range(0.0..1.0)))
        .collect();
    let mut pc = container(&topology, 1, 3);
    add_all(&mut pc, 0, &pts);
    pc.fill_neighbors();
    let check_pair = within(0.05);

    pc.build_neighbor_list(&check_pair, true);
    let keys: Vec<TileKey> = pc.local_tiles(0).collect();
    let sorted: Vec<_> = keys.iter().map(|k| pc.neighbor_list(0, *k).unwrap().clone()).collect();

    pc.build_neighbor_list(&check_pair, false);
    for (key, want) in keys.iter().zip(&sorted) {
        let got = pc.neighbor_list(0, *key).unwrap();
        for (mut block, want) in got.blocks().map(<[i32]>::to_vec).zip(want.blocks()) {
            block.sort_unstable();
            assert_eq!(block, want);
        }
    }
}

#[test]
fn lists_do_not_depend_on_thread_count() {
    let topology = periodic_square(16, 8, 4);
    let mut rng = rand::rngs::StdRng::seed_from_u64(1234);
    let pts: Vec<(f64, f64)> = (0..400)
        .map(|_| (rng.random_range(0.0..1.0), rng.random_range(0.0..1.0)))
        .collect();
    let check_pair = within(0.06);
    let lists: Vec<Vec<_>> = [1, 6]
        .into_iter()
        .map(|threads| {
            let mut pc = container(&topology, 1, threads);
            add_all(&mut pc, 0, &pts);
            pc.fill_neighbors();
            pc.build_neighbor_list(&check_pair, true);
            let keys: Vec<TileKey> = pc.local_tiles(0).collect();
            keys.into_iter()
                .map(|k| pc.neighbor_list(0, k).unwrap().clone())
                .collect()
        })
        .collect();
    assert_eq!(lists[0], lists[1]);
}

#[test]
fn fine_level_tiles_bin_at_level_zero() {
    let base = Geometry::new(IntBox::from_slices(&[0, 0], &[7, 7]), &[0.0, 0.0], &[1.0, 1.0])
        .unwrap()
        .with_periodicity(&[true, true]);
    let mut layout = TileLayout::new(1);
    layout.add_level(base.clone(), [1, 1, 1]).unwrap();
    layout.add_tile(0, TileKey::new(0, 0), 0, *base.domain()).unwrap();
    let fine = base.refine([2, 2, 1]);
    layout.add_level(fine, [2, 2, 1]).unwrap();
    // Lower-left quarter of the domain, four 4x4 tiles at level 1.
    for (t, (x, y)) in [(0, 0), (4, 0), (0, 4), (4, 4)].into_iter().enumerate() {
        let bx = IntBox::from_slices(&[x, y], &[x + 3, y + 3]);
        layout.add_tile(1, TileKey::new(0, t as i32), 0, bx).unwrap();
    }
    let topology: Arc<dyn Topology> = Arc::new(layout);

    let mut rng = rand::rngs::StdRng::seed_from_u64(5);
    let pts: Vec<(f64, f64)> = (0..150)
        .map(|_| (rng.random_range(0.0..0.5), rng.random_range(0.0..0.5)))
        .collect();
    let mut pc = container(&topology, 1, 2);
    add_all(&mut pc, 1, &pts);
    pc.fill_neighbors();
    assert!(pc.ghosts(1, TileKey::new(0, 0)).is_some_and(|g| !g.is_empty()));

    let check_pair = within(1.0 / 8.0);
    pc.build_neighbor_list(&check_pair, true);
    check_lists(&pc, 1, &check_pair);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn lists_are_complete_and_exact(
        pts in prop::collection::vec((0.0f64..1.0, 0.0f64..1.0), 0..80),
        reach in 0i32..3,
        cutoff in 0.0f64..0.3,
    ) {
        let topology = periodic_square(8, 4, 4);
        let mut pc = container(&topology, reach, 2);
        add_all(&mut pc, 0, &pts);
        pc.fill_neighbors();
        let check_pair = within(cutoff);
        pc.build_neighbor_list(&check_pair, true);
        check_lists(&pc, 0, &check_pair);
    }
}
