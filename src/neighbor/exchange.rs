//! Count negotiation, bulk transfer and unpack.
//!
//! Wire format of one send buffer (all integers little-endian `i32`):
//!
//! ```text
//! tile_count
//! repeated tile_count times:
//!     level grid tile byte_size
//!     byte_size bytes of compact records
//! ```
//!
//! Control words are one little-endian `u64` per peer: the number of bytes
//! the sender will ship to that peer in the data phase, zero included.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, trace};

use super::arena::ParticleArray;
use super::comm::{CONTROL_TAG, Communicator, DATA_TAG};
use super::layout::ParticleLayout;
use super::tile::TileKey;
use super::tile_cache::RoundPlan;

pub const STREAM_HEADER_BYTES: usize = 4;
pub const TILE_HEADER_BYTES: usize = 16;
const CONTROL_BYTES: usize = 8;

#[inline]
pub fn write_i32(buf: &mut [u8], at: usize, value: i32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Sequential reader over one peer's segment.
struct WireReader<'a> {
    src: usize,
    buf: &'a [u8],
    at: usize,
}

impl<'a> WireReader<'a> {
    fn new(src: usize, buf: &'a [u8]) -> Self {
        Self { src, buf, at: 0 }
    }

    fn take(&mut self, len: usize) -> &'a [u8] {
        assert!(
            self.at + len <= self.buf.len(),
            "stream from rank {} truncated: need {len} bytes at offset {}, segment has {}",
            self.src,
            self.at,
            self.buf.len()
        );
        let out = &self.buf[self.at..self.at + len];
        self.at += len;
        out
    }

    fn read_i32(&mut self) -> i32 {
        let raw = self.take(4);
        i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.at
    }
}

/// Counters accumulated over the lifetime of a container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Rounds that reached the exchange step.
    pub rounds: u64,
    /// Rounds where no process had anything to send.
    pub skipped_rounds: u64,
    pub control_sends: u64,
    pub data_sends: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecvSegment {
    pub rank: usize,
    pub offset: usize,
    pub bytes: usize,
}

/// Placement of every incoming payload inside one contiguous allocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecvLayout {
    pub segments: Vec<RecvSegment>,
    pub total_bytes: usize,
}

impl RecvLayout {
    /// Peers with a nonzero count, in increasing rank order, packed without gaps.
    pub fn from_counts(counts: &BTreeMap<usize, usize>) -> Self {
        let mut layout = Self::default();
        for (&rank, &bytes) in counts.iter().filter(|(_, b)| **b > 0) {
            layout.segments.push(RecvSegment {
                rank,
                offset: layout.total_bytes,
                bytes,
            });
            layout.total_bytes += bytes;
        }
        layout
    }
}

/// Receive counts carried between rounds.
#[derive(Clone, Debug, Default)]
pub struct ExchangeState {
    recv_counts: BTreeMap<usize, usize>,
    /// Bytes this rank announced to each neighbor.
    send_counts: BTreeMap<usize, usize>,
    counts_valid: bool,
    negotiated: bool,
}

impl ExchangeState {
    /// Counts from the last negotiation that was not globally skipped.
    pub fn counts_valid(&self) -> bool {
        self.counts_valid
    }

    pub fn has_negotiated(&self) -> bool {
        self.negotiated
    }

    pub fn recv_counts(&self) -> &BTreeMap<usize, usize> {
        &self.recv_counts
    }

    pub fn recv_layout(&self) -> RecvLayout {
        RecvLayout::from_counts(&self.recv_counts)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Panics unless `plan` sends every peer exactly the bytes announced in
    /// the last negotiation.
    pub fn assert_reusable(&self, rank: usize, plan: &RoundPlan) {
        for (&peer, &announced) in &self.send_counts {
            let bytes = plan.send_bytes(peer);
            assert_eq!(
                bytes, announced,
                "rank {rank}: reusing receive counts, but the current tags send {bytes} bytes to rank {peer} \
                 where {announced} were negotiated"
            );
        }
        for peer in plan.send_layouts.keys() {
            assert!(
                self.send_counts.contains_key(peer),
                "rank {rank}: reusing receive counts, but rank {peer} was not part of the last negotiation"
            );
        }
    }

    /// Swap byte counts with every neighbor rank, then agree globally on
    /// whether any process has off-process tags. Returns `false` when the
    /// whole universe can skip the data phase.
    pub fn negotiate<C: Communicator + ?Sized>(
        &mut self,
        comm: &C,
        neighbors: &BTreeSet<usize>,
        plan: &RoundPlan,
        stats: &mut ExchangeStats,
    ) -> bool {
        for &dst in plan.send_layouts.keys() {
            assert!(
                neighbors.contains(&dst),
                "rank {}: send destination rank {dst} is not in the neighbor set {neighbors:?}",
                comm.rank()
            );
        }

        self.send_counts = neighbors.iter().map(|&peer| (peer, plan.send_bytes(peer))).collect();
        let words: Vec<(usize, [u8; CONTROL_BYTES])> = self
            .send_counts
            .iter()
            .map(|(&peer, &bytes)| (peer, (bytes as u64).to_le_bytes()))
            .collect();
        let sends: Vec<(usize, &[u8])> = words.iter().map(|(peer, w)| (*peer, &w[..])).collect();
        let mut incoming = vec![[0u8; CONTROL_BYTES]; neighbors.len()];
        let mut recvs: Vec<(usize, &mut [u8])> = neighbors
            .iter()
            .zip(incoming.iter_mut())
            .map(|(&peer, w)| (peer, &mut w[..]))
            .collect();
        comm.exchange(CONTROL_TAG, &sends, &mut recvs);
        drop(recvs);
        stats.control_sends += sends.len() as u64;

        self.recv_counts = neighbors
            .iter()
            .zip(&incoming)
            .map(|(&peer, w)| (peer, u64::from_le_bytes(*w) as usize))
            .collect();
        for (peer, bytes) in &self.recv_counts {
            trace!("rank {}: expecting {bytes} bytes from rank {peer}", comm.rank());
        }

        self.negotiated = true;
        let global_max = comm.all_reduce_max(plan.remote_tags as u64);
        self.counts_valid = global_max > 0;
        if !self.counts_valid {
            debug!("rank {}: no off-process tags anywhere, skipping transfer", comm.rank());
        }
        self.counts_valid
    }
}

/// Ship every nonempty send buffer and receive every negotiated payload.
pub fn transfer<C: Communicator + ?Sized>(
    comm: &C,
    send_buffers: &BTreeMap<usize, Vec<u8>>,
    layout: &RecvLayout,
    stats: &mut ExchangeStats,
) -> Vec<u8> {
    let mut recv_buf = vec![0u8; layout.total_bytes];
    let mut recvs: Vec<(usize, &mut [u8])> = Vec::with_capacity(layout.segments.len());
    let mut rest = &mut recv_buf[..];
    for segment in &layout.segments {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(segment.bytes);
        recvs.push((segment.rank, head));
        rest = tail;
    }
    let sends: Vec<(usize, &[u8])> = send_buffers
        .iter()
        .filter(|(_, buf)| !buf.is_empty())
        .map(|(rank, buf)| (*rank, &buf[..]))
        .collect();

    comm.exchange(DATA_TAG, &sends, &mut recvs);
    drop(recvs);

    stats.data_sends += sends.len() as u64;
    stats.bytes_sent += sends.iter().map(|(_, b)| b.len() as u64).sum::<u64>();
    stats.bytes_received += layout.total_bytes as u64;
    recv_buf
}

/// Append every received record to its tile's ghost buffer, expanding the
/// compact encoding. Unmasked fields of remote ghosts are zero.
pub fn unpack(
    layout: &ParticleLayout,
    recv_buf: &[u8],
    recv_layout: &RecvLayout,
    ghosts: &mut [BTreeMap<TileKey, ParticleArray>],
) -> usize {
    let cdata = layout.cdata_size();
    let mut received = 0;
    for segment in &recv_layout.segments {
        let src = segment.rank;
        let mut reader = WireReader::new(src, &recv_buf[segment.offset..segment.offset + segment.bytes]);
        let num_tiles = reader.read_i32();
        assert!(num_tiles >= 0, "rank {src} sent a negative tile count {num_tiles}");
        for _ in 0..num_tiles {
            let level = reader.read_i32();
            let key = TileKey::new(reader.read_i32(), reader.read_i32());
            let size = reader.read_i32();
            assert!(
                level >= 0 && (level as usize) < ghosts.len(),
                "rank {src} sent level {level}, only {} levels exist",
                ghosts.len()
            );
            assert!(size >= 0, "rank {src} sent a negative byte size {size} for tile {key:?}");
            let size = size as usize;
            let data = reader.take(size);
            if size == 0 {
                continue;
            }
            assert!(
                cdata > 0 && size % cdata == 0,
                "rank {src} sent {size} bytes for tile {key:?} on level {level}, not a multiple of the {cdata}-byte record"
            );
            let Some(tile_ghosts) = ghosts[level as usize].get_mut(&key) else {
                panic!("rank {src} sent ghosts for tile {key:?} on level {level}, which is not local");
            };
            let count = size / cdata;
            let first = tile_ghosts.extend_zeroed(count);
            for (k, record) in data.chunks_exact(cdata).enumerate() {
                layout.unpack(record, tile_ghosts.get_mut(first + k));
            }
            received += count;
        }
        assert_eq!(
            reader.remaining(),
            0,
            "rank {src} sent {} trailing bytes",
            reader.remaining()
        );
    }
    received
}
