//! Message passing between processes.
//!
//! The engine only needs two primitives: a tagged point-to-point exchange
//! with a known peer set (receives posted first, blocking sends, then wait
//! for every receive) and a global maximum. `ThreadComm` runs a whole
//! universe of ranks as threads in one process; `MpiComm` (feature `mpi`)
//! maps the same calls onto MPI.
//!
//! There are no timeouts. A rank that panics aborts the universe, and every
//! rank blocked in a receive panics in turn instead of waiting forever.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

pub type Tag = u16;

/// Per-pair byte counts ahead of a data round.
pub const CONTROL_TAG: Tag = 11;
/// Packed ghost records.
pub const DATA_TAG: Tag = 12;
const REDUCE_TAG: Tag = u16::MAX;

pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Receive one message from every `(source, buffer)` in `recvs` and send
    /// every `(destination, bytes)` in `sends`. Each receive must match its
    /// buffer length exactly. Returns once every receive has completed.
    fn exchange(&self, tag: Tag, sends: &[(usize, &[u8])], recvs: &mut [(usize, &mut [u8])]);

    /// Maximum of `value` over every rank.
    fn all_reduce_max(&self, value: u64) -> u64;
}

// ── single process ──

/// One rank, no peers.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn exchange(&self, _tag: Tag, sends: &[(usize, &[u8])], recvs: &mut [(usize, &mut [u8])]) {
        if let Some((peer, _)) = sends.first() {
            panic!("serial communicator has no peer rank {peer} to send to");
        }
        if let Some((peer, _)) = recvs.first() {
            panic!("serial communicator has no peer rank {peer} to receive from");
        }
    }

    fn all_reduce_max(&self, value: u64) -> u64 {
        value
    }
}

// ── in-process universe ──

const NOT_ABORTED: usize = usize::MAX;

#[derive(Default)]
struct Mailbox {
    queues: Mutex<HashMap<(usize, Tag), VecDeque<Vec<u8>>>>,
    ready: Condvar,
}

impl Mailbox {
    fn lock(&self) -> MutexGuard<'_, HashMap<(usize, Tag), VecDeque<Vec<u8>>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Universe {
    mailboxes: Vec<Mailbox>,
    aborted: AtomicBool,
    aborted_by: AtomicUsize,
}

impl Universe {
    fn new(size: usize) -> Self {
        Self {
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
            aborted: AtomicBool::new(false),
            aborted_by: AtomicUsize::new(NOT_ABORTED),
        }
    }

    fn abort(&self, rank: usize) {
        let _ = self
            .aborted_by
            .compare_exchange(NOT_ABORTED, rank, Ordering::SeqCst, Ordering::SeqCst);
        self.aborted.store(true, Ordering::SeqCst);
        for mailbox in &self.mailboxes {
            let _queues = mailbox.lock();
            mailbox.ready.notify_all();
        }
    }
}

/// Handle of one rank in a thread-backed universe. Sends are eager: the
/// payload is queued in the receiver's mailbox, FIFO per `(source, tag)`.
pub struct ThreadComm {
    rank: usize,
    universe: Arc<Universe>,
}

impl ThreadComm {
    fn check_peer(&self, peer: usize) {
        assert!(
            peer < self.universe.mailboxes.len(),
            "rank {}: peer rank {peer} outside 0..{}",
            self.rank,
            self.universe.mailboxes.len()
        );
    }

    fn send(&self, dst: usize, tag: Tag, data: &[u8]) {
        self.check_peer(dst);
        let mailbox = &self.universe.mailboxes[dst];
        mailbox
            .lock()
            .entry((self.rank, tag))
            .or_default()
            .push_back(data.to_vec());
        mailbox.ready.notify_all();
    }

    fn recv(&self, src: usize, tag: Tag) -> Vec<u8> {
        self.check_peer(src);
        let mailbox = &self.universe.mailboxes[self.rank];
        let mut queues = mailbox.lock();
        loop {
            if let Some(msg) = queues.get_mut(&(src, tag)).and_then(VecDeque::pop_front) {
                return msg;
            }
            if self.universe.aborted.load(Ordering::SeqCst) {
                drop(queues);
                panic!(
                    "rank {}: universe aborted by rank {} while waiting on rank {src}",
                    self.rank,
                    self.universe.aborted_by.load(Ordering::SeqCst)
                );
            }
            queues = mailbox.ready.wait(queues).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.universe.mailboxes.len()
    }

    fn exchange(&self, tag: Tag, sends: &[(usize, &[u8])], recvs: &mut [(usize, &mut [u8])]) {
        for (dst, data) in sends {
            self.send(*dst, tag, data);
        }
        for (src, buf) in recvs.iter_mut() {
            let msg = self.recv(*src, tag);
            assert_eq!(
                msg.len(),
                buf.len(),
                "rank {}: message from rank {src} (tag {tag}) has {} bytes, receive posted for {}",
                self.rank,
                msg.len(),
                buf.len()
            );
            buf.copy_from_slice(&msg);
        }
    }

    fn all_reduce_max(&self, value: u64) -> u64 {
        let bytes = value.to_le_bytes();
        for peer in (0..self.size()).filter(|p| *p != self.rank) {
            self.send(peer, REDUCE_TAG, &bytes);
        }
        let mut max = value;
        for peer in (0..self.size()).filter(|p| *p != self.rank) {
            let msg = self.recv(peer, REDUCE_TAG);
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&msg);
            max = max.max(u64::from_le_bytes(raw));
        }
        max
    }
}

struct AbortOnPanic {
    rank: usize,
    universe: Arc<Universe>,
}

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.universe.abort(self.rank);
        }
    }
}

/// Run `f` once per rank of an `n`-rank universe, each on its own thread,
/// and return the results in rank order.
///
/// If any rank panics the universe is aborted and the panic of the first
/// rank to fail is resumed on the caller.
pub fn run_ranks<F, R>(n: usize, f: F) -> Vec<R>
where
    F: Fn(ThreadComm) -> R + Sync,
    R: Send,
{
    let n = n.max(1);
    let universe = Arc::new(Universe::new(n));
    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..n)
            .map(|rank| {
                let universe = Arc::clone(&universe);
                let f = &f;
                s.spawn(move || {
                    let _guard = AbortOnPanic {
                        rank,
                        universe: Arc::clone(&universe),
                    };
                    f(ThreadComm { rank, universe })
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    });

    let first = universe.aborted_by.load(Ordering::SeqCst);
    let mut out = Vec::with_capacity(n);
    let mut failure = None;
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(value) => out.push(value),
            Err(payload) => {
                if failure.is_none() || rank == first {
                    failure = Some(payload);
                }
            }
        }
    }
    if let Some(payload) = failure {
        std::panic::resume_unwind(payload);
    }
    out
}

// ── MPI ──

#[cfg(feature = "mpi")]
pub use mpi_backend::MpiComm;

#[cfg(feature = "mpi")]
mod mpi_backend {
    use ::mpi::collective::SystemOperation;
    use ::mpi::request::{RequestCollection, multiple_scope};
    use ::mpi::topology::SimpleCommunicator;
    use ::mpi::traits::{Communicator as _, CommunicatorCollectives as _, Destination as _, Source as _};

    use super::{Communicator, Tag};

    /// World communicator of an initialized MPI universe.
    pub struct MpiComm {
        world: SimpleCommunicator,
    }

    impl MpiComm {
        /// Call after `mpi::initialize()`.
        pub fn world() -> Self {
            Self {
                world: SimpleCommunicator::world(),
            }
        }
    }

    impl Communicator for MpiComm {
        fn rank(&self) -> usize {
            self.world.rank() as usize
        }

        fn size(&self) -> usize {
            self.world.size() as usize
        }

        fn exchange(&self, tag: Tag, sends: &[(usize, &[u8])], recvs: &mut [(usize, &mut [u8])]) {
            let world = &self.world;
            let tag = tag as i32;
            multiple_scope(recvs.len(), |scope, coll: &mut RequestCollection<'_, [u8]>| {
                for (src, buf) in recvs.iter_mut() {
                    let req = world
                        .process_at_rank(*src as i32)
                        .immediate_receive_into_with_tag(scope, &mut buf[..], tag);
                    coll.add(req);
                }
                for (dst, data) in sends {
                    world.process_at_rank(*dst as i32).send_with_tag(*data, tag);
                }
                let mut statuses = Vec::with_capacity(coll.incomplete());
                coll.wait_all(&mut statuses);
            });
        }

        fn all_reduce_max(&self, value: u64) -> u64 {
            let mut global = 0u64;
            self.world.all_reduce_into(&value, &mut global, SystemOperation::max());
            global
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_reduce_is_identity() {
        assert_eq!(SerialComm.all_reduce_max(42), 42);
        SerialComm.exchange(CONTROL_TAG, &[], &mut []);
    }

    #[test]
    #[should_panic(expected = "no peer rank 1")]
    fn serial_rejects_peers() {
        SerialComm.exchange(DATA_TAG, &[(1, &[0u8][..])], &mut []);
    }

    #[test]
    fn ring_exchange_delivers_in_rank_order() {
        let got = run_ranks(4, |comm| {
            let n = comm.size();
            let right = (comm.rank() + 1) % n;
            let left = (comm.rank() + n - 1) % n;
            let payload = [comm.rank() as u8; 3];
            let mut buf = [0u8; 3];
            comm.exchange(DATA_TAG, &[(right, &payload[..])], &mut [(left, &mut buf[..])]);
            buf[0] as usize
        });
        assert_eq!(got, vec![3, 0, 1, 2]);
    }

    #[test]
    fn reduce_agrees_across_ranks_and_rounds() {
        let got = run_ranks(3, |comm| {
            let a = comm.all_reduce_max(comm.rank() as u64 * 10);
            let b = comm.all_reduce_max(100 - comm.rank() as u64);
            (a, b)
        });
        assert!(got.iter().all(|r| *r == (20, 100)));
    }

    #[test]
    fn same_tag_messages_stay_fifo() {
        let got = run_ranks(2, |comm| {
            let peer = 1 - comm.rank();
            let mut out = Vec::new();
            for round in 0..5u8 {
                let mut buf = [0u8; 1];
                comm.exchange(CONTROL_TAG, &[(peer, &[round][..])], &mut [(peer, &mut buf[..])]);
                out.push(buf[0]);
            }
            out
        });
        assert_eq!(got[0], vec![0, 1, 2, 3, 4]);
        assert_eq!(got[1], vec![0, 1, 2, 3, 4]);
    }

    #[test]
    #[should_panic(expected = "rank 1 exploded")]
    fn panic_on_one_rank_releases_the_others() {
        run_ranks(3, |comm| {
            if comm.rank() == 1 {
                panic!("rank 1 exploded");
            }
            // Waits on a message rank 1 never sends.
            let mut buf = [0u8; 1];
            comm.exchange(DATA_TAG, &[], &mut [(1, &mut buf[..])]);
        });
    }

    #[test]
    #[should_panic(expected = "peer rank 5 outside 0..2")]
    fn peer_outside_universe_is_fatal() {
        run_ranks(2, |comm| comm.exchange(DATA_TAG, &[(5, &[1u8][..])], &mut []));
    }
}
