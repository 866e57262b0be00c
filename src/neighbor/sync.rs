//! Ghost fill from the tag cache.
//!
//! Every buffer is sized before this runs and every tag owns a distinct
//! destination slot, so worker threads write through raw pointers without
//! locks. Slots are still bounds-checked: an out-of-range slot means the
//! plan and the buffers disagree, which is fatal.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use rayon::prelude::*;

use super::arena::{Particle, ParticleArray, ParticleMut, ParticleRef};
use super::layout::{ParticleLayout, Real};
use super::tile::{CopyTag, TileKey, Topology};
use super::tile_cache::TagCache;

struct SendPtr<T> {
    inner: *mut T,
}
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}
impl<T> Copy for SendPtr<T> {}
impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> SendPtr<T> {
    #[inline(always)]
    fn new(ptr: *mut T) -> Self {
        Self { inner: ptr }
    }
    #[inline(always)]
    fn get(&self) -> *mut T {
        self.inner
    }
}

struct GhostTarget {
    reals: SendPtr<Real>,
    ints: SendPtr<i32>,
    len: usize,
    real_stride: usize,
    int_stride: usize,
}

struct SendTarget {
    bytes: SendPtr<u8>,
    len: usize,
}

/// Write access to this round's ghost and send buffers, shareable across
/// worker threads. Holds the buffers mutably borrowed for `'a`, so nothing
/// can resize them while the fill runs.
pub struct FillTargets<'a> {
    ghosts: Vec<BTreeMap<TileKey, GhostTarget>>,
    sends: BTreeMap<usize, SendTarget>,
    _borrow: PhantomData<&'a mut ()>,
}

impl<'a> FillTargets<'a> {
    pub fn new(ghosts: &'a mut [BTreeMap<TileKey, ParticleArray>], send_buffers: &'a mut BTreeMap<usize, Vec<u8>>) -> Self {
        let ghosts = ghosts
            .iter_mut()
            .map(|level| {
                level
                    .iter_mut()
                    .map(|(key, arr)| {
                        let (real_stride, int_stride) = (arr.real_stride(), arr.int_stride());
                        let (reals, ints, len) = arr.raw_parts_mut();
                        let target = GhostTarget {
                            reals: SendPtr::new(reals),
                            ints: SendPtr::new(ints),
                            len,
                            real_stride,
                            int_stride,
                        };
                        (*key, target)
                    })
                    .collect()
            })
            .collect();
        let sends = send_buffers
            .iter_mut()
            .map(|(rank, buf)| {
                let target = SendTarget {
                    bytes: SendPtr::new(buf.as_mut_ptr()),
                    len: buf.len(),
                };
                (*rank, target)
            })
            .collect();
        Self {
            ghosts,
            sends,
            _borrow: PhantomData,
        }
    }

    fn write_ghost(&self, level: usize, key: TileKey, slot: usize, p: ParticleRef<'_>) {
        let Some(target) = self.ghosts.get(level).and_then(|lev| lev.get(&key)) else {
            panic!("no ghost buffer for local tile {key:?} on level {level}");
        };
        assert!(
            slot < target.len,
            "ghost slot {slot} out of range for tile {key:?} on level {level} ({} slots)",
            target.len
        );
        // SAFETY: `slot` is in bounds, the buffer is borrowed for `'a` and
        // the plan gives every tag a distinct slot.
        let mut dst = unsafe {
            let real = std::slice::from_raw_parts_mut(target.reals.get().add(slot * target.real_stride), target.real_stride);
            let int = std::slice::from_raw_parts_mut(target.ints.get().add(slot * target.int_stride), target.int_stride);
            ParticleMut::from_raw(real, int)
        };
        dst.copy_from(p);
    }

    fn write_remote(&self, layout: &ParticleLayout, rank: usize, offset: usize, p: ParticleRef<'_>) {
        let Some(target) = self.sends.get(&rank) else {
            panic!("no send buffer for rank {rank}");
        };
        let cdata = layout.cdata_size();
        assert!(
            offset + cdata <= target.len,
            "send offset {offset} + {cdata} bytes out of range for rank {rank} ({} bytes)",
            target.len
        );
        // SAFETY: range checked above; byte ranges of distinct tags never overlap.
        let dst = unsafe { std::slice::from_raw_parts_mut(target.bytes.get().add(offset), cdata) };
        layout.pack(p, dst);
    }
}

/// Replicate every cached tag into its destination. Same-process
/// destinations get the full record; other processes get the compact
/// encoding at the tag's byte offset. Periodic images move positions only.
pub fn fill_from_cache(
    layout: &ParticleLayout,
    topology: &dyn Topology,
    rank: usize,
    tags: &TagCache,
    particles: &[BTreeMap<TileKey, ParticleArray>],
    targets: &FillTargets<'_>,
) {
    let work: Vec<&[CopyTag]> = (0..tags.num_levels())
        .flat_map(|level| tags.level(level))
        .flat_map(|(_, threads)| threads.iter().map(Vec::as_slice))
        .filter(|t| !t.is_empty())
        .collect();

    work.par_iter().for_each_init(
        || Particle::zeroed(layout),
        |scratch, chunk| {
            for tag in chunk.iter() {
                copy_one(layout, topology, rank, particles, targets, tag, scratch);
            }
        },
    );
}

fn copy_one(
    layout: &ParticleLayout,
    topology: &dyn Topology,
    rank: usize,
    particles: &[BTreeMap<TileKey, ParticleArray>],
    targets: &FillTargets<'_>,
    tag: &CopyTag,
    scratch: &mut Particle,
) {
    let src_level = tag.src_level as usize;
    let Some(src_tile) = particles.get(src_level).and_then(|lev| lev.get(&tag.src_key)) else {
        panic!("tag source tile {:?} on level {src_level} is not local", tag.src_key);
    };
    assert!(
        tag.src_index < src_tile.len(),
        "tag source slot {} out of range for tile {:?} ({} particles)",
        tag.src_index,
        tag.src_key,
        src_tile.len()
    );
    scratch.as_mut().copy_from(src_tile.get(tag.src_index));

    let level = tag.level as usize;
    let geom = topology.geometry(level);
    for d in 0..layout.dim() {
        let s = tag.periodic_shift[d];
        if s != 0 && geom.is_periodic(d) {
            scratch.real[d] += Real::from(s) * geom.length(d);
        }
    }

    let Some(owner) = topology.owner(level, tag.dst_key) else {
        panic!("tag destination tile {:?} does not exist on level {level}", tag.dst_key);
    };
    if owner == rank {
        targets.write_ghost(level, tag.dst_key, tag.dst_index, scratch.as_ref());
    } else {
        targets.write_remote(layout, owner, tag.dst_index, scratch.as_ref());
    }
}
