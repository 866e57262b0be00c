use std::sync::Arc;

use neighbor_particles::neighbor::{
    ExchangeStats, Geometry, IntBox, NeighborConfig, NeighborParticles, ParticleLayout, ThreadComm, TileKey,
    TileLayout, Topology, run_ranks,
};

const LEFT: TileKey = TileKey::new(0, 0);
const RIGHT: TileKey = TileKey::new(1, 0);

/// Periodic line [0, 10) with ten cells, split into two five-cell tiles.
fn periodic_line(num_ranks: usize) -> Arc<dyn Topology> {
    let geom = Geometry::new(IntBox::from_slices(&[0], &[9]), &[0.0], &[10.0])
        .unwrap()
        .with_periodicity(&[true]);
    Arc::new(TileLayout::chopped(geom, 5, 5, num_ranks).unwrap())
}

fn container(topology: &Arc<dyn Topology>, comm: ThreadComm) -> NeighborParticles<ThreadComm> {
    let layout = ParticleLayout::new(1, 1, 0).unwrap();
    let config = NeighborConfig::default().thread_count(2);
    NeighborParticles::with_config(layout, Arc::clone(topology), comm, config).unwrap()
}

/// (id, x) of every ghost in `key`, sorted by id.
fn ghost_xs(pc: &NeighborParticles<ThreadComm>, key: TileKey) -> Vec<(i32, f64)> {
    let Some(ghosts) = pc.ghosts(0, key) else {
        return Vec::new();
    };
    let mut out: Vec<_> = ghosts.iter().map(|p| (p.id(), p.pos(0))).collect();
    out.sort_by_key(|(id, _)| *id);
    out
}

fn assert_close(got: f64, want: f64) {
    assert!((got - want).abs() < 1e-12, "expected {want}, got {got}");
}

#[test]
fn boundary_and_periodic_image_reach_the_other_rank() {
    let topology = periodic_line(2);
    let results = run_ranks(2, |comm| {
        let mut pc = container(&topology, comm);
        if pc.rank() == 0 {
            pc.add_particle(0, LEFT, &[4.5, 1.0], &[1, 0]).unwrap();
            pc.add_particle(0, LEFT, &[0.3, 2.0], &[2, 0]).unwrap();
        }
        pc.fill_neighbors();
        (ghost_xs(&pc, LEFT), ghost_xs(&pc, RIGHT), pc.num_ghosts(), pc.stats())
    });

    let (left, _, ghosts, stats) = &results[0];
    assert!(left.is_empty());
    assert_eq!(*ghosts, 0);
    assert_eq!(stats.control_sends, 1);
    assert_eq!(stats.data_sends, 1);
    assert_eq!(stats.control_sends + stats.data_sends, 2);
    // Stream header, one tile header, two 24-byte records.
    assert_eq!(stats.bytes_sent, 4 + 16 + 2 * 24);

    let (_, right, ghosts, stats) = &results[1];
    assert_eq!(*ghosts, 2);
    assert_eq!(right.len(), 2);
    assert_eq!(right[0].0, 1);
    assert_close(right[0].1, 4.5);
    assert_eq!(right[1].0, 2);
    assert_close(right[1].1, 10.3);
    assert_eq!(stats.control_sends, 1);
    assert_eq!(stats.data_sends, 0);
    assert_eq!(stats.bytes_received, 4 + 16 + 2 * 24);
}

#[test]
fn interior_particles_skip_the_transfer_everywhere() {
    let topology = periodic_line(2);
    let results = run_ranks(2, |comm| {
        let mut pc = container(&topology, comm);
        if pc.rank() == 0 {
            pc.add_particle(0, LEFT, &[2.0, 0.0], &[1, 0]).unwrap();
        } else {
            pc.add_particle(0, RIGHT, &[7.0, 0.0], &[2, 1]).unwrap();
        }
        pc.fill_neighbors();
        (pc.num_ghosts(), pc.stats())
    });

    for (ghosts, stats) in results {
        assert_eq!(ghosts, 0);
        assert_eq!(
            stats,
            ExchangeStats {
                rounds: 1,
                skipped_rounds: 1,
                control_sends: 1,
                ..ExchangeStats::default()
            }
        );
    }
}

#[test]
fn control_words_flow_both_ways_every_round() {
    let topology = periodic_line(2);
    let results = run_ranks(2, |comm| {
        let mut pc = container(&topology, comm);
        if pc.rank() == 1 {
            pc.add_particle(0, RIGHT, &[5.2, 0.0], &[7, 1]).unwrap();
        }
        pc.fill_neighbors();
        pc.update_neighbors(false);
        pc.update_neighbors(false);
        (ghost_xs(&pc, LEFT), pc.stats())
    });

    let (left, stats) = &results[0];
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].0, 7);
    assert_close(left[0].1, 5.2);
    // Rank 0 has nothing to send but still answers every round.
    assert_eq!(stats.control_sends, 3);
    assert_eq!(stats.data_sends, 0);
    assert_eq!(results[1].1.control_sends, 3);
    assert_eq!(results[1].1.data_sends, 3);
}

#[test]
fn reused_counts_refresh_contents_without_negotiating() {
    let topology = periodic_line(2);
    let results = run_ranks(2, |comm| {
        let mut pc = container(&topology, comm);
        if pc.rank() == 0 {
            pc.add_particle(0, LEFT, &[4.5, 1.0], &[1, 0]).unwrap();
        }
        pc.fill_neighbors();
        if pc.rank() == 0 {
            let owned = pc.particles_mut(0, LEFT).unwrap();
            owned.get_mut(0).set_pos(0, 4.7);
        }
        pc.update_neighbors(true);
        (ghost_xs(&pc, RIGHT), pc.stats())
    });

    let (_, stats) = &results[0];
    assert_eq!(stats.rounds, 2);
    assert_eq!(stats.control_sends, 1);
    assert_eq!(stats.data_sends, 2);

    let (right, stats) = &results[1];
    assert_eq!(stats.control_sends, 1);
    assert_eq!(right.len(), 1);
    assert_close(right[0].1, 4.7);
}

#[test]
fn reused_counts_survive_an_interior_addition() {
    let topology = periodic_line(2);
    let results = run_ranks(2, |comm| {
        let mut pc = container(&topology, comm);
        if pc.rank() == 0 {
            pc.add_particle(0, LEFT, &[4.5, 1.0], &[1, 0]).unwrap();
        }
        pc.fill_neighbors();
        if pc.rank() == 0 {
            pc.add_particle(0, LEFT, &[2.0, 1.0], &[2, 0]).unwrap();
        }
        pc.update_neighbors(true);
        (ghost_xs(&pc, RIGHT), pc.stats())
    });

    for (_, stats) in &results {
        assert_eq!(stats.rounds, 2);
        assert_eq!(stats.control_sends, 1);
    }
    let right = &results[1].0;
    assert_eq!(right.len(), 1);
    assert_close(right[0].1, 4.5);
}

#[test]
#[should_panic(expected = "were negotiated")]
fn reused_counts_reject_a_grown_send() {
    let topology = periodic_line(2);
    run_ranks(2, |comm| {
        let mut pc = container(&topology, comm);
        if pc.rank() == 0 {
            pc.add_particle(0, LEFT, &[4.5, 1.0], &[1, 0]).unwrap();
        }
        pc.fill_neighbors();
        if pc.rank() == 0 {
            // Second boundary particle, 24 more bytes for rank 1.
            pc.add_particle(0, LEFT, &[4.2, 1.0], &[2, 0]).unwrap();
        }
        pc.update_neighbors(true);
    });
}

#[test]
fn reuse_after_a_skipped_round_negotiates_again() {
    let topology = periodic_line(2);
    let results = run_ranks(2, |comm| {
        let mut pc = container(&topology, comm);
        if pc.rank() == 0 {
            pc.add_particle(0, LEFT, &[2.0, 0.0], &[1, 0]).unwrap();
        }
        pc.fill_neighbors();
        pc.update_neighbors(true);
        pc.stats()
    });
    for stats in results {
        assert_eq!(stats.rounds, 2);
        assert_eq!(stats.skipped_rounds, 2);
        assert_eq!(stats.control_sends, 2);
    }
}

#[test]
fn refilling_replaces_ghosts_instead_of_accumulating() {
    let topology = periodic_line(2);
    let results = run_ranks(2, |comm| {
        let mut pc = container(&topology, comm);
        let rank = pc.rank();
        let (key, xs) = if rank == 0 {
            (LEFT, [0.1, 0.9, 4.2, 4.95])
        } else {
            (RIGHT, [5.0, 5.5, 9.1, 9.99])
        };
        for (i, x) in xs.iter().enumerate() {
            let id = (rank * 10 + i) as i32 + 1;
            pc.add_particle(0, key, &[*x, 0.0], &[id, rank as i32]).unwrap();
        }

        pc.fill_neighbors();
        let first = (ghost_xs(&pc, LEFT), ghost_xs(&pc, RIGHT));
        pc.fill_neighbors();
        let second = (ghost_xs(&pc, LEFT), ghost_xs(&pc, RIGHT));

        pc.clear_neighbors();
        let cleared = pc.num_ghosts();
        let kept = pc.stats();
        pc.fill_neighbors();
        let third = (ghost_xs(&pc, LEFT), ghost_xs(&pc, RIGHT));
        (first, second, third, cleared, kept)
    });

    for (first, second, third, cleared, kept) in results {
        assert_eq!(first, second);
        assert_eq!(first, third);
        assert_eq!(cleared, 0);
        assert_eq!(kept, ExchangeStats::default());
        assert_eq!(first.0.len() + first.1.len(), 4);
    }
}

#[test]
fn widening_the_radius_pulls_in_deeper_particles() {
    let topology = periodic_line(2);
    let results = run_ranks(2, |comm| {
        let mut pc = container(&topology, comm);
        if pc.rank() == 0 {
            pc.add_particle(0, LEFT, &[3.5, 0.0], &[1, 0]).unwrap();
        }
        pc.fill_neighbors();
        let narrow = pc.num_ghosts();
        pc.set_num_neighbor_cells(2);
        pc.fill_neighbors();
        (narrow, ghost_xs(&pc, RIGHT))
    });

    assert_eq!(results[1].0, 0);
    let wide = &results[1].1;
    assert_eq!(wide.len(), 1);
    assert_close(wide[0].1, 3.5);
    assert!(results[0].1.is_empty());
}
