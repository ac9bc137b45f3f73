//! Distributed Directory for Cache Coherence
//!
//! Each memory line has a home tile whose directory slice tracks the line's
//! sharers in a bit-vector. Entries move between UNCACHED, SHARED, and
//! EXCLUSIVE; mutations for one slice are serialized through that home
//! tile's request queue (a single-writer mpsc channel drained by a server
//! thread).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use fnv::FnvHashMap;
use log::debug;

/// Fixed-size bit-vector over tile ranks
#[derive(Debug, Clone)]
pub struct BitVector {
    words: Vec<u64>,
    size: usize,
}

impl BitVector {
    pub fn new(size: usize) -> Self {
        BitVector { words: vec![0; size.div_ceil(64)], size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set(&mut self, bit: usize) {
        assert!(bit < self.size, "bit index out of range");
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    pub fn clear(&mut self, bit: usize) {
        assert!(bit < self.size, "bit index out of range");
        self.words[bit / 64] &= !(1 << (bit % 64));
    }

    pub fn test(&self, bit: usize) -> bool {
        assert!(bit < self.size, "bit index out of range");
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Ranks of all set bits, ascending
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.size).filter(|&i| self.test(i))
    }
}

/// Directory entry state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryState {
    Uncached,
    Shared,
    Exclusive,
}

/// Sharer bookkeeping for one memory line.
///
/// Invariants: in UNCACHED the bit-vector is empty; in EXCLUSIVE exactly one
/// bit is set and it names the exclusive owner; in SHARED at least one bit
/// is set; `num_sharers` always equals the bit-vector's popcount.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    state: DirectoryState,
    sharers: BitVector,
    num_sharers: usize,
    exclusive_sharer_rank: Option<u32>,
    /// Line-aligned address, kept for diagnostics only; the directory map's
    /// key is the canonical owner.
    mem_line_address: u64,
    max_sharers: usize,
}

impl DirectoryEntry {
    pub fn new(mem_line_address: u64, num_tiles: usize, max_sharers: usize) -> Self {
        assert!(max_sharers >= 1 && max_sharers <= num_tiles);
        DirectoryEntry {
            state: DirectoryState::Uncached,
            sharers: BitVector::new(num_tiles),
            num_sharers: 0,
            exclusive_sharer_rank: None,
            mem_line_address,
            max_sharers,
        }
    }

    pub fn dstate(&self) -> DirectoryState {
        self.state
    }

    pub fn num_sharers(&self) -> usize {
        self.num_sharers
    }

    pub fn mem_line_address(&self) -> u64 {
        self.mem_line_address
    }

    pub fn exclusive_sharer_rank(&self) -> Option<u32> {
        self.exclusive_sharer_rank
    }

    pub fn is_sharer(&self, rank: u32) -> bool {
        self.sharers.test(rank as usize)
    }

    pub fn sharers_list(&self) -> Vec<u32> {
        self.sharers.iter_set().map(|r| r as u32).collect()
    }

    /// Add `rank` as a shared holder of the line.
    ///
    /// Returns `false` (not fatal) when the sharer vector is at capacity;
    /// the caller must evict an existing sharer first. From EXCLUSIVE the
    /// previous owner's implicit bit is cleared before `rank` is installed.
    pub fn add_sharer(&mut self, rank: u32) -> bool {
        match self.state {
            DirectoryState::Uncached => {
                self.sharers.set(rank as usize);
                self.num_sharers = 1;
                self.state = DirectoryState::Shared;
                true
            }
            DirectoryState::Shared => {
                if self.sharers.test(rank as usize) {
                    return true;
                }
                if self.num_sharers >= self.max_sharers {
                    return false;
                }
                self.sharers.set(rank as usize);
                self.num_sharers += 1;
                true
            }
            DirectoryState::Exclusive => {
                self.sharers.clear_all();
                self.sharers.set(rank as usize);
                self.num_sharers = 1;
                self.exclusive_sharer_rank = None;
                self.state = DirectoryState::Shared;
                true
            }
        }
    }

    /// Make `rank` the exclusive owner. Legal only from UNCACHED, or as an
    /// idempotent repeat from the current owner.
    pub fn add_exclusive_sharer(&mut self, rank: u32) {
        match self.state {
            DirectoryState::Uncached => {
                self.sharers.set(rank as usize);
                self.num_sharers = 1;
                self.exclusive_sharer_rank = Some(rank);
                self.state = DirectoryState::Exclusive;
            }
            DirectoryState::Exclusive if self.exclusive_sharer_rank == Some(rank) => {}
            _ => panic!(
                "illegal exclusive grant for line {:#x}: rank {} in state {:?}",
                self.mem_line_address, rank, self.state
            ),
        }
    }

    /// Drop `rank` from the sharer set. A no-op in UNCACHED or when the bit
    /// is already clear; removing a non-owner from EXCLUSIVE is fatal.
    pub fn remove_sharer(&mut self, rank: u32) {
        match self.state {
            DirectoryState::Uncached => {}
            DirectoryState::Shared => {
                if self.sharers.test(rank as usize) {
                    self.sharers.clear(rank as usize);
                    self.num_sharers -= 1;
                    if self.num_sharers == 0 {
                        self.state = DirectoryState::Uncached;
                    }
                }
            }
            DirectoryState::Exclusive => {
                assert!(
                    self.exclusive_sharer_rank == Some(rank),
                    "removing rank {} from exclusively-owned line {:#x} (owner {:?})",
                    rank,
                    self.mem_line_address,
                    self.exclusive_sharer_rank
                );
                self.sharers.clear(rank as usize);
                self.num_sharers = 0;
                self.exclusive_sharer_rank = None;
                self.state = DirectoryState::Uncached;
            }
        }
    }
}

/// Coherence operation carried to a home directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryOp {
    /// Requester wants a shared copy (load miss fill)
    ReadShared,
    /// Requester wants exclusive ownership (store miss fill / upgrade)
    ReadExclusive,
    /// Requester dropped its copy (cache eviction or invalidation)
    Evict,
}

/// Reply from the home directory
#[derive(Debug, Clone, Copy)]
pub struct DirectoryReply {
    pub state: DirectoryState,
    /// Copies the directory had to drop elsewhere to satisfy this request
    pub forced_invalidations: u32,
}

enum DirectoryRequest {
    Op {
        line_addr: u64,
        requester: u32,
        op: DirectoryOp,
        reply: mpsc::Sender<DirectoryReply>,
    },
    Shutdown,
}

/// Counters shared between the slice servers and the summary output
#[derive(Debug, Default)]
pub struct DirectoryStats {
    pub requests: AtomicU64,
    pub forced_invalidations: AtomicU64,
}

/// Cloneable client side of the directory. Blocking request/response;
/// requests for distinct home tiles proceed in parallel.
#[derive(Clone)]
pub struct DirectoryHandle {
    queues: Vec<mpsc::Sender<DirectoryRequest>>,
    line_shift: u32,
    stats: Arc<DirectoryStats>,
}

impl DirectoryHandle {
    pub fn home_tile(&self, line_addr: u64) -> usize {
        ((line_addr >> self.line_shift) % self.queues.len() as u64) as usize
    }

    /// Send one coherence operation to the line's home tile and wait for
    /// the reply. Returns `None` once the directory has shut down.
    pub fn request(&self, op: DirectoryOp, line_addr: u64, requester: u32) -> Option<DirectoryReply> {
        let home = self.home_tile(line_addr);
        let (reply_tx, reply_rx) = mpsc::channel();
        let request = DirectoryRequest::Op { line_addr, requester, op, reply: reply_tx };
        if self.queues[home].send(request).is_err() {
            return None;
        }
        reply_rx.recv().ok()
    }

    pub fn stats(&self) -> &DirectoryStats {
        &self.stats
    }
}

/// The server half: one slice-draining thread per tile.
pub struct Directory {
    servers: Vec<thread::JoinHandle<()>>,
    handle: Option<DirectoryHandle>,
    stats: Arc<DirectoryStats>,
}

impl Directory {
    /// Spawn one slice server per tile. `line_shift` must match the dcache
    /// line size so homes are derived from line-aligned addresses.
    pub fn spawn(num_tiles: usize, max_sharers: usize, line_shift: u32) -> Self {
        let stats = Arc::new(DirectoryStats::default());
        let mut queues = Vec::with_capacity(num_tiles);
        let mut servers = Vec::with_capacity(num_tiles);

        for home in 0..num_tiles {
            let (tx, rx) = mpsc::channel::<DirectoryRequest>();
            queues.push(tx);
            let stats = Arc::clone(&stats);
            let server = thread::Builder::new()
                .name(format!("dir-slice-{home}"))
                .spawn(move || slice_server(home, rx, num_tiles, max_sharers, stats))
                .expect("failed to spawn directory slice thread");
            servers.push(server);
        }

        Directory {
            servers,
            handle: Some(DirectoryHandle {
                queues,
                line_shift,
                stats: Arc::clone(&stats),
            }),
            stats,
        }
    }

    pub fn handle(&self) -> DirectoryHandle {
        self.handle.as_ref().expect("directory already shut down").clone()
    }

    pub fn stats(&self) -> &DirectoryStats {
        &self.stats
    }

    /// Stop the slice servers and join them. Outstanding handles survive;
    /// requests made through them afterwards return `None`.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            for queue in &handle.queues {
                let _ = queue.send(DirectoryRequest::Shutdown);
            }
        }
        for server in self.servers.drain(..) {
            let _ = server.join();
        }
        debug!("directory slices joined");
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        if !self.servers.is_empty() {
            self.shutdown();
        }
    }
}

fn slice_server(
    home: usize,
    rx: mpsc::Receiver<DirectoryRequest>,
    num_tiles: usize,
    max_sharers: usize,
    stats: Arc<DirectoryStats>,
) {
    let mut entries: FnvHashMap<u64, DirectoryEntry> = FnvHashMap::default();

    while let Ok(request) = rx.recv() {
        let DirectoryRequest::Op { line_addr, requester, op, reply } = request else {
            break;
        };

        stats.requests.fetch_add(1, Ordering::Relaxed);
        let entry = entries
            .entry(line_addr)
            .or_insert_with(|| DirectoryEntry::new(line_addr, num_tiles, max_sharers));

        let mut forced = 0u32;
        match op {
            DirectoryOp::ReadShared => {
                if entry.dstate() == DirectoryState::Exclusive
                    && entry.exclusive_sharer_rank() != Some(requester)
                {
                    // the previous owner's copy is dropped by the demotion
                    forced += 1;
                }
                if !entry.add_sharer(requester) {
                    // sharer vector full: evict the lowest-ranked current
                    // sharer and retry
                    let victim = entry.sharers_list()[0];
                    entry.remove_sharer(victim);
                    forced += 1;
                    let ok = entry.add_sharer(requester);
                    assert!(ok, "sharer add must succeed after eviction");
                }
            }
            DirectoryOp::ReadExclusive => {
                match entry.dstate() {
                    DirectoryState::Uncached => entry.add_exclusive_sharer(requester),
                    DirectoryState::Shared => {
                        for rank in entry.sharers_list() {
                            if rank != requester {
                                forced += 1;
                            }
                            entry.remove_sharer(rank);
                        }
                        entry.add_exclusive_sharer(requester);
                    }
                    DirectoryState::Exclusive => {
                        if entry.exclusive_sharer_rank() != Some(requester) {
                            let owner = entry.exclusive_sharer_rank().unwrap();
                            entry.remove_sharer(owner);
                            forced += 1;
                            entry.add_exclusive_sharer(requester);
                        }
                    }
                }
            }
            DirectoryOp::Evict => {
                // a stale eviction may arrive after the directory already
                // dropped this sharer; only live copies are removed
                if entry.is_sharer(requester) {
                    entry.remove_sharer(requester);
                }
            }
        }

        if forced > 0 {
            stats.forced_invalidations.fetch_add(u64::from(forced), Ordering::Relaxed);
            debug!(
                "dir[{home}] line {line_addr:#x}: {forced} forced invalidation(s) for rank {requester}"
            );
        }

        let response = DirectoryReply { state: entry.dstate(), forced_invalidations: forced };
        if entry.dstate() == DirectoryState::Uncached {
            entries.remove(&line_addr);
        }
        // a requester that vanished mid-teardown is fine
        let _ = reply.send(response);
    }

    debug!("dir[{home}] slice server exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_vector_basics() {
        let mut bv = BitVector::new(70);
        assert!(bv.is_empty());
        bv.set(0);
        bv.set(65);
        assert!(bv.test(0) && bv.test(65));
        assert!(!bv.test(64));
        assert_eq!(bv.count_ones(), 2);
        assert_eq!(bv.iter_set().collect::<Vec<_>>(), vec![0, 65]);
        bv.clear(0);
        assert_eq!(bv.count_ones(), 1);
    }

    #[test]
    fn test_shared_to_uncached() {
        let mut entry = DirectoryEntry::new(0x1000, 4, 4);
        assert!(entry.add_sharer(1));
        assert!(entry.add_sharer(3));
        assert_eq!(entry.dstate(), DirectoryState::Shared);
        assert_eq!(entry.sharers_list(), vec![1, 3]);

        entry.remove_sharer(1);
        assert_eq!(entry.dstate(), DirectoryState::Shared);
        assert_eq!(entry.sharers_list(), vec![3]);

        entry.remove_sharer(3);
        assert_eq!(entry.dstate(), DirectoryState::Uncached);
        assert_eq!(entry.num_sharers(), 0);
    }

    #[test]
    fn test_popcount_matches_num_sharers() {
        let mut entry = DirectoryEntry::new(0x2000, 8, 8);
        for rank in [0u32, 2, 5, 7] {
            entry.add_sharer(rank);
            assert_eq!(entry.num_sharers(), entry.sharers_list().len());
        }
        entry.remove_sharer(2);
        assert_eq!(entry.num_sharers(), entry.sharers_list().len());
    }

    #[test]
    fn test_exclusive_invariant() {
        let mut entry = DirectoryEntry::new(0x3000, 4, 4);
        entry.add_exclusive_sharer(2);
        assert_eq!(entry.dstate(), DirectoryState::Exclusive);
        assert_eq!(entry.num_sharers(), 1);
        assert_eq!(entry.exclusive_sharer_rank(), Some(2));
        assert_eq!(entry.sharers_list(), vec![2]);
        // idempotent repeat from the owner
        entry.add_exclusive_sharer(2);
        assert_eq!(entry.num_sharers(), 1);
    }

    #[test]
    fn test_exclusive_demoted_by_add_sharer() {
        let mut entry = DirectoryEntry::new(0x4000, 4, 4);
        entry.add_exclusive_sharer(0);
        assert!(entry.add_sharer(3));
        assert_eq!(entry.dstate(), DirectoryState::Shared);
        assert_eq!(entry.sharers_list(), vec![3]);
        assert_eq!(entry.exclusive_sharer_rank(), None);
    }

    #[test]
    #[should_panic(expected = "illegal exclusive grant")]
    fn test_exclusive_from_shared_is_fatal() {
        let mut entry = DirectoryEntry::new(0x5000, 4, 4);
        entry.add_sharer(1);
        entry.add_exclusive_sharer(2);
    }

    #[test]
    #[should_panic(expected = "removing rank")]
    fn test_remove_non_owner_from_exclusive_is_fatal() {
        let mut entry = DirectoryEntry::new(0x6000, 4, 4);
        entry.add_exclusive_sharer(1);
        entry.remove_sharer(2);
    }

    #[test]
    fn test_capacity_overflow_returns_false() {
        let mut entry = DirectoryEntry::new(0x7000, 4, 2);
        assert!(entry.add_sharer(0));
        assert!(entry.add_sharer(1));
        assert!(!entry.add_sharer(2));
        // existing sharers are unaffected
        assert_eq!(entry.sharers_list(), vec![0, 1]);
        // and re-adding an existing sharer still succeeds
        assert!(entry.add_sharer(0));
    }

    #[test]
    fn test_slice_server_round_trip() {
        let mut directory = Directory::spawn(4, 4, 5);
        let handle = directory.handle();

        let line = 0x40u64;
        let r = handle.request(DirectoryOp::ReadShared, line, 0).unwrap();
        assert_eq!(r.state, DirectoryState::Shared);
        assert_eq!(r.forced_invalidations, 0);

        let r = handle.request(DirectoryOp::ReadShared, line, 1).unwrap();
        assert_eq!(r.state, DirectoryState::Shared);

        // an exclusive upgrade invalidates the other sharer
        let r = handle.request(DirectoryOp::ReadExclusive, line, 0).unwrap();
        assert_eq!(r.state, DirectoryState::Exclusive);
        assert_eq!(r.forced_invalidations, 1);

        let r = handle.request(DirectoryOp::Evict, line, 0).unwrap();
        assert_eq!(r.state, DirectoryState::Uncached);

        drop(handle);
        directory.shutdown();
    }

    #[test]
    fn test_slice_server_capacity_eviction() {
        let mut directory = Directory::spawn(4, 2, 5);
        let handle = directory.handle();

        let line = 0x80u64;
        handle.request(DirectoryOp::ReadShared, line, 0).unwrap();
        handle.request(DirectoryOp::ReadShared, line, 1).unwrap();
        // third sharer forces the lowest-ranked one out
        let r = handle.request(DirectoryOp::ReadShared, line, 2).unwrap();
        assert_eq!(r.state, DirectoryState::Shared);
        assert_eq!(r.forced_invalidations, 1);

        drop(handle);
        directory.shutdown();
    }
}
