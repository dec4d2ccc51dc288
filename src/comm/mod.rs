//! Communication abstraction for in-process (thread) and inter-process
//! (MPI) message passing.
//!
//! Wire format conventions (for the collectives built on top):
//! - All scalars are LE fixed width (`f64` loads and positions, `u64`
//!   counts and ranks).
//! - Buffers are `bytemuck::Pod`-safe contiguous arrays; no framing or
//!   versioning beyond the matched send/recv pair itself.
//! - Message sizes are agreed out of band: fixed per collective, or
//!   exchanged in a counts round first (varcount operations).

use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

pub mod collectives;

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Non-blocking communication interface (minimal by design).
///
/// Implementors provide asynchronous send/receive operations and waitable
/// handles. Everything lcgrid needs from a message-passing layer — the
/// collectives in [`collectives`] and the neighbor-collectives in
/// [`crate::graph`] — is built from these primitives, so a backend only
/// has to provide matched point-to-point delivery with FIFO order per
/// `(source, destination, tag)` channel.
pub trait Communicator: Send + Sync {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Post a buffered, non-blocking send of `buf` to `peer`.
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a non-blocking receive of exactly `len` bytes from `peer`.
    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle;

    /// Rank of this process (0..size-1).
    fn rank(&self) -> usize;
    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Synchronization barrier (default: no-op for serial backends).
    fn barrier(&self) {}
}

/// Tag newtype for safer tag arithmetic.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CommTag(u16);

impl CommTag {
    /// Create a new tag from a raw `u16`.
    #[inline]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    /// Return the underlying `u16` value.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Safely offset the tag by `dx`, wrapping on overflow.
    #[inline]
    pub const fn offset(self, dx: u16) -> Self {
        Self(self.0.wrapping_add(dx))
    }
}

impl From<u16> for CommTag {
    #[inline]
    fn from(x: u16) -> Self {
        CommTag::new(x)
    }
}

/// Compile-time no-op comm for single-rank use and serial unit tests.
///
/// Sends to self are delivered through a local queue so that collectives
/// behave identically to a size-1 [`ThreadComm`] universe.
#[derive(Debug, Default)]
pub struct NoComm {
    queues: Mutex<HashMap<u16, VecDeque<Vec<u8>>>>,
}

impl NoComm {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct NoCommSendHandle;

impl Wait for NoCommSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

pub struct NoCommRecvHandle {
    msg: Vec<u8>,
}

impl Wait for NoCommRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        Some(self.msg)
    }
}

impl Communicator for NoComm {
    type SendHandle = NoCommSendHandle;
    type RecvHandle = NoCommRecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        assert_eq!(peer, 0, "NoComm has a single rank");
        let mut q = self.queues.lock().expect("NoComm queue poisoned");
        q.entry(tag).or_default().push_back(buf.to_vec());
        NoCommSendHandle
    }

    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle {
        assert_eq!(peer, 0, "NoComm has a single rank");
        let mut q = self.queues.lock().expect("NoComm queue poisoned");
        let mut msg = q
            .get_mut(&tag)
            .and_then(|q| q.pop_front())
            .expect("NoComm receive without a matching self-send");
        msg.truncate(len);
        NoCommRecvHandle { msg }
    }

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }
}

// --- ThreadComm: in-process universes, one std thread per rank ---

/// Mailbox key: (universe, src, dst, tag).
type Key = (u64, usize, usize, u16);

#[derive(Default)]
struct Slot {
    q: VecDeque<Vec<u8>>,
}

struct Mailbox {
    map: Mutex<HashMap<Key, Arc<(Mutex<Slot>, Condvar)>>>,
}

static MAILBOX: Lazy<Mailbox> = Lazy::new(|| Mailbox {
    map: Mutex::new(HashMap::new()),
});

fn mailbox_entry(key: Key) -> Arc<(Mutex<Slot>, Condvar)> {
    let mut g = MAILBOX.map.lock().expect("MAILBOX poisoned");
    g.entry(key)
        .or_insert_with(|| Arc::new((Mutex::new(Slot::default()), Condvar::new())))
        .clone()
}

struct EpochBarrier {
    size: usize,
    arrived: usize,
    epoch: usize,
}

static BARRIERS: Lazy<Mutex<HashMap<u64, Arc<(Mutex<EpochBarrier>, Condvar)>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn barrier_entry(universe: u64, size: usize) -> Arc<(Mutex<EpochBarrier>, Condvar)> {
    let mut g = BARRIERS.lock().expect("BARRIERS poisoned");
    g.entry(universe)
        .or_insert_with(|| {
            Arc::new((
                Mutex::new(EpochBarrier {
                    size,
                    arrived: 0,
                    epoch: 0,
                }),
                Condvar::new(),
            ))
        })
        .clone()
}

static NEXT_UNIVERSE: AtomicU64 = AtomicU64::new(0);

/// In-process communicator: a *universe* of `size` ranks sharing a mailbox.
///
/// Each universe gets a fresh id, so concurrently running universes (e.g.
/// parallel test cases) cannot cross-talk even though the mailbox storage
/// is a process-wide static. Run one rank per thread:
///
/// ```
/// use lcgrid::comm::{Communicator, ThreadComm, Wait};
///
/// let comms = ThreadComm::universe(2);
/// std::thread::scope(|s| {
///     for comm in comms {
///         s.spawn(move || {
///             let peer = 1 - comm.rank();
///             let _ = comm.isend(peer, 7, &[comm.rank() as u8]);
///             let got = comm.irecv(peer, 7, 1).wait().unwrap();
///             assert_eq!(got[0] as usize, peer);
///         });
///     }
/// });
/// ```
#[derive(Clone, Debug)]
pub struct ThreadComm {
    universe: u64,
    rank: usize,
    size: usize,
}

impl ThreadComm {
    /// Create a fresh universe of `size` ranks, one communicator per rank.
    pub fn universe(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "universe needs at least one rank");
        let universe = NEXT_UNIVERSE.fetch_add(1, Ordering::Relaxed);
        (0..size)
            .map(|rank| ThreadComm {
                universe,
                rank,
                size,
            })
            .collect()
    }
}

pub struct ThreadSendHandle;

impl Wait for ThreadSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

pub struct ThreadRecvHandle {
    cell: Arc<(Mutex<Slot>, Condvar)>,
    want_len: usize,
}

impl Wait for ThreadRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let (lock, cv) = &*self.cell;
        let mut slot = lock.lock().expect("Slot poisoned");
        while slot.q.is_empty() {
            slot = cv.wait(slot).expect("Condvar poisoned");
        }
        let mut msg = slot.q.pop_front().expect("q non-empty");
        msg.truncate(self.want_len.min(msg.len()));
        Some(msg)
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ThreadSendHandle;
    type RecvHandle = ThreadRecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.universe, self.rank, peer, tag);
        let entry = mailbox_entry(key);
        let (lock, cv) = &*entry;
        {
            let mut slot = lock.lock().expect("Slot poisoned");
            slot.q.push_back(buf.to_vec());
        }
        cv.notify_all();
        ThreadSendHandle
    }

    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle {
        let key = (self.universe, peer, self.rank, tag);
        ThreadRecvHandle {
            cell: mailbox_entry(key),
            want_len: len,
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        let entry = barrier_entry(self.universe, self.size);
        let (lock, cv) = &*entry;
        let mut b = lock.lock().expect("EpochBarrier poisoned");
        let e = b.epoch;
        b.arrived += 1;
        if b.arrived == b.size {
            b.arrived = 0;
            b.epoch += 1;
            cv.notify_all();
        } else {
            while e == b.epoch {
                b = cv.wait(b).expect("EpochBarrier condvar poisoned");
            }
        }
    }
}

// --- MPI backend ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use core::ptr::NonNull;
    use mpi::point_to_point::{Destination, Source};
    use mpi::topology::{Communicator as _, SimpleCommunicator};

    /// Adapter from an rsmpi communicator to [`Communicator`].
    ///
    /// lcgrid never initializes MPI itself; the caller owns the universe
    /// and hands in a duplicated communicator.
    pub struct MpiComm {
        pub world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl MpiComm {
        pub fn new(world: SimpleCommunicator) -> Self {
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self { world, rank, size }
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
            use mpi::request::StaticScope;
            let boxed = buf.to_vec().into_boxed_slice();
            let raw: *mut [u8] = Box::into_raw(boxed);
            let slice: &[u8] = unsafe { &*raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, slice, tag as i32);
            MpiSendHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
            }
        }

        fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle {
            use mpi::request::StaticScope;
            let boxed = vec![0u8; len].into_boxed_slice();
            let raw: *mut [u8] = Box::into_raw(boxed);
            let slice_mut: &mut [u8] = unsafe { &mut *raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, slice_mut, tag as i32);
            MpiRecvHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
                len,
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }
        fn barrier(&self) {
            use mpi::collective::CommunicatorCollectives;
            self.world.barrier();
        }
    }

    pub struct MpiSendHandle {
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
        buf: Option<NonNull<[u8]>>,
    }
    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
            None
        }
    }
    impl Drop for MpiSendHandle {
        fn drop(&mut self) {
            if let Some(r) = self.req.take() {
                let _ = r.test();
                #[cfg(debug_assertions)]
                eprintln!("[MpiSendHandle::drop] send not explicitly waited");
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
        }
    }

    pub struct MpiRecvHandle {
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
        buf: Option<NonNull<[u8]>>,
        len: usize,
    }
    impl Wait for MpiRecvHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            let ptr = self.buf.take().expect("buffer missing");
            let boxed: Box<[u8]> = unsafe { Box::from_raw(ptr.as_ptr()) };
            let mut v = Vec::from(boxed);
            v.truncate(self.len);
            Some(v)
        }
    }
    impl Drop for MpiRecvHandle {
        fn drop(&mut self) {
            if let Some(r) = self.req.take() {
                let _ = r.test();
                #[cfg(debug_assertions)]
                eprintln!("[MpiRecvHandle::drop] recv not explicitly waited");
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_round_trip() {
        let comms = ThreadComm::universe(2);
        std::thread::scope(|s| {
            for comm in comms {
                s.spawn(move || {
                    let peer = 1 - comm.rank();
                    let msg = [comm.rank() as u8; 5];
                    let _ = comm.isend(peer, 0x10, &msg);
                    let got = comm.irecv(peer, 0x10, 5).wait().unwrap();
                    assert_eq!(got, vec![peer as u8; 5]);
                });
            }
        });
    }

    #[test]
    fn thread_fifo_order() {
        let comms = ThreadComm::universe(2);
        std::thread::scope(|s| {
            for comm in comms {
                s.spawn(move || {
                    let peer = 1 - comm.rank();
                    for i in 0..10u8 {
                        let _ = comm.isend(peer, 0x11, &[i]);
                    }
                    let mut out = Vec::new();
                    for _ in 0..10 {
                        out.push(comm.irecv(peer, 0x11, 1).wait().unwrap()[0]);
                    }
                    assert_eq!(out, (0u8..10u8).collect::<Vec<_>>());
                });
            }
        });
    }

    #[test]
    fn universes_do_not_cross_talk() {
        let a = ThreadComm::universe(2);
        let b = ThreadComm::universe(2);
        std::thread::scope(|s| {
            for (comm, payload) in a.into_iter().zip([1u8, 2]).chain(b.into_iter().zip([3u8, 4])) {
                s.spawn(move || {
                    let peer = 1 - comm.rank();
                    let _ = comm.isend(peer, 0x12, &[payload]);
                    let got = comm.irecv(peer, 0x12, 1).wait().unwrap()[0];
                    // Peer payload from the same universe only.
                    assert_eq!(got.abs_diff(payload), 1);
                });
            }
        });
    }

    #[test]
    fn no_comm_self_delivery() {
        let comm = NoComm::new();
        let _ = comm.isend(0, 0x13, &[9, 9]);
        let got = comm.irecv(0, 0x13, 2).wait().unwrap();
        assert_eq!(got, vec![9, 9]);
    }

    #[test]
    fn truncation_is_ok() {
        let comms = ThreadComm::universe(2);
        std::thread::scope(|s| {
            for comm in comms {
                s.spawn(move || {
                    let peer = 1 - comm.rank();
                    let _ = comm.isend(peer, 0x14, &[1, 2, 3, 4, 5, 6]);
                    let got = comm.irecv(peer, 0x14, 4).wait().unwrap();
                    assert_eq!(got, vec![1, 2, 3, 4]);
                });
            }
        });
    }
}
