//! Set-Associative Cache Model
//!
//! Models a parameterizable cache with a real data store:
//! - Tag + data blocks per set, round-robin replacement
//! - Bounded inter-set probe chains (skewed-associative style) via per-set
//!   overflow pointers
//! - Fill / eviction-capture protocol for data movement on misses
//! - Dynamic associativity resize for the organic cache
//!
//! All geometry parameters are runtime fields validated at construction;
//! the hot path reads them as immutable state.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Counter type for hit/miss statistics
pub type CacheStats = u64;

/// Sentinel tag value for an empty slot
const INVALID_TAG: u64 = !0;

/// Sentinel overflow pointer: the probe chain ends here
pub const SET_PTR_NONE: u32 = u32::MAX;

/// Caches are built during single-threaded startup; a process-local counter
/// gives each one a distinct, reproducible PRNG seed.
static CACHE_SEED_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Load,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    ICache,
    DCache,
}

/// Store-miss allocation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAllocation {
    StoreAllocate,
    StoreNoAllocate,
}

/// Coherence state of a cached line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Invalid,
    Shared,
    Exclusive,
    Modified,
}

/// One tag slot: tag bits plus the line's coherence state.
///
/// A slot holding the all-ones sentinel is empty. Equality of two tags is
/// equality of their tag bits; the state does not participate.
#[derive(Debug, Clone, Copy)]
pub struct CacheTag {
    tag: u64,
    state: LineState,
}

impl CacheTag {
    pub fn new(tag: u64, state: LineState) -> Self {
        CacheTag { tag, state }
    }

    pub fn empty() -> Self {
        CacheTag { tag: INVALID_TAG, state: LineState::Invalid }
    }

    pub fn is_valid(&self) -> bool {
        self.tag != INVALID_TAG
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn state(&self) -> LineState {
        self.state
    }

    pub fn set_state(&mut self, state: LineState) {
        self.state = state;
    }
}

/// A captured eviction: the reconstructed line address and the old data.
#[derive(Debug, Clone)]
pub struct EvictedLine {
    pub addr: u64,
    pub state: LineState,
    pub data: Vec<u8>,
}

/// Outcome of `access_single_line`
#[derive(Debug, Default)]
pub struct CacheAccessResult {
    pub hit: bool,
    /// Set when the lookup missed, a fill notice was requested, and no fill
    /// buffer was supplied; the cache state is untouched in that case.
    pub need_fill: bool,
    /// Snapshot of the accessed line's tag, valid until the next mutating
    /// call on this cache.
    pub tag: Option<CacheTag>,
    pub evicted: Option<EvictedLine>,
}

/// Payload moved between the caller and the accessed line
pub enum Payload<'a> {
    None,
    /// Copy bytes out of the line at the access offset (loads)
    Read(&'a mut [u8]),
    /// Copy bytes into the line at the access offset (stores)
    Write(&'a [u8]),
}

/// Options for one `access_single_line` call
pub struct AccessRequest<'a> {
    /// Ask for a `need_fill` notice instead of allocating when no fill
    /// buffer is supplied
    pub fill_notice: bool,
    /// Full line of data to install on a miss
    pub fill_buffer: Option<&'a [u8]>,
    pub payload: Payload<'a>,
    /// Capture the evicted line's address and data, if any
    pub capture_eviction: bool,
}

impl<'a> AccessRequest<'a> {
    /// Plain timing access: allocate on miss, no data movement
    pub fn plain() -> Self {
        AccessRequest {
            fill_notice: false,
            fill_buffer: None,
            payload: Payload::None,
            capture_eviction: false,
        }
    }

    /// First phase of the need-fill protocol: probe, and report whether a
    /// fill is required rather than allocating
    pub fn probe() -> Self {
        AccessRequest { fill_notice: true, ..AccessRequest::plain() }
    }

    pub fn with_fill(mut self, line: &'a [u8]) -> Self {
        self.fill_buffer = Some(line);
        self
    }

    pub fn with_read(mut self, out: &'a mut [u8]) -> Self {
        self.payload = Payload::Read(out);
        self
    }

    pub fn with_write(mut self, data: &'a [u8]) -> Self {
        self.payload = Payload::Write(data);
        self
    }

    pub fn with_eviction_capture(mut self) -> Self {
        self.capture_eviction = true;
        self
    }
}

/// One set: an associativity-sized slot array with backing data blocks and a
/// round-robin replacement pointer.
///
/// Invariant: valid tags within a set are pairwise distinct.
#[derive(Debug, Clone)]
struct CacheSet {
    tags: Vec<CacheTag>,
    blocks: Vec<u8>,
    line_size: usize,
    next_replace_index: usize,
}

impl CacheSet {
    fn new(associativity: usize, line_size: usize) -> Self {
        CacheSet {
            tags: vec![CacheTag::empty(); associativity],
            blocks: vec![0u8; associativity * line_size],
            line_size,
            next_replace_index: associativity - 1,
        }
    }

    fn associativity(&self) -> usize {
        self.tags.len()
    }

    fn find(&self, tag_bits: u64) -> Option<usize> {
        self.tags.iter().position(|t| t.is_valid() && t.tag() == tag_bits)
    }

    fn read_line(&self, slot: usize, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.line_size, "read beyond line boundary");
        let base = slot * self.line_size + offset;
        out.copy_from_slice(&self.blocks[base..base + out.len()]);
    }

    fn write_line(&mut self, slot: usize, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.line_size, "write beyond line boundary");
        let base = slot * self.line_size + offset;
        self.blocks[base..base + data.len()].copy_from_slice(data);
    }

    fn invalidate_tag(&mut self, tag_bits: u64) -> bool {
        match self.find(tag_bits) {
            Some(slot) => {
                self.tags[slot] = CacheTag::empty();
                true
            }
            None => false,
        }
    }

    /// Install `tag` in the round-robin victim slot, returning the old
    /// occupant when it was valid and capture was requested. The eviction is
    /// materialized before the new data lands so the caller observes the old
    /// bytes.
    fn replace(
        &mut self,
        tag: CacheTag,
        fill_buffer: Option<&[u8]>,
        capture_eviction: bool,
    ) -> (usize, Option<(CacheTag, Vec<u8>)>) {
        let slot = self.next_replace_index;
        let victim = self.tags[slot];

        let evicted = if victim.is_valid() && capture_eviction {
            let base = slot * self.line_size;
            Some((victim, self.blocks[base..base + self.line_size].to_vec()))
        } else {
            None
        };

        self.tags[slot] = tag;
        if let Some(fill) = fill_buffer {
            assert_eq!(fill.len(), self.line_size, "fill buffer must be one full line");
            let base = slot * self.line_size;
            self.blocks[base..base + self.line_size].copy_from_slice(fill);
        }

        // condition is cheaper than a modulo here
        self.next_replace_index = if slot == 0 { self.associativity() - 1 } else { slot - 1 };

        (slot, evicted)
    }

    /// Grow adds empty slots; shrink drops the highest slots and clamps the
    /// replacement pointer. Shrink legality is the cache's responsibility.
    fn modify_associativity(&mut self, new_assoc: usize) {
        let old_assoc = self.associativity();
        if new_assoc > old_assoc {
            self.tags.resize(new_assoc, CacheTag::empty());
            self.blocks.resize(new_assoc * self.line_size, 0);
            self.next_replace_index = new_assoc - 1;
        } else if new_assoc < old_assoc {
            self.tags.truncate(new_assoc);
            self.blocks.truncate(new_assoc * self.line_size);
            if self.next_replace_index >= new_assoc {
                self.next_replace_index = new_assoc - 1;
            }
        }
    }
}

/// The cache proper: sets, probe chains, statistics, and the replacement
/// PRNG.
pub struct Cache {
    name: String,

    // geometry (immutable on the hot path; resize is the one mutator)
    cache_size: u32,
    line_size: u32,
    associativity: u32,
    line_shift: u32,
    set_mask: u64,
    max_search: u32,
    store_allocation: StoreAllocation,
    /// Shrinking a set drops live lines, which would break coherence while a
    /// shared-memory simulation is running.
    shrink_allowed: bool,

    sets: Vec<CacheSet>,
    /// Per-set overflow pointer forming the probe chain; `SET_PTR_NONE`
    /// terminates the chain.
    set_ptrs: Vec<u32>,

    rng: SmallRng,
    probe_history: Vec<u32>,

    // statistics: [access_type][hit]
    access: [[CacheStats; 2]; 2],
    set_accesses: Vec<CacheStats>,
    set_misses: Vec<CacheStats>,
    total_set_accesses: Vec<CacheStats>,
    total_set_misses: Vec<CacheStats>,
}

impl Cache {
    pub fn new(
        name: impl Into<String>,
        size: u32,
        line_size: u32,
        associativity: u32,
        max_search_depth: u32,
        store_allocation: StoreAllocation,
        shrink_allowed: bool,
    ) -> Self {
        assert!(line_size.is_power_of_two(), "line size must be a power of two");
        assert!(associativity >= 1, "associativity must be at least 1");
        assert!(max_search_depth >= 1, "max search depth must be at least 1");
        assert!(
            size % (line_size * associativity) == 0,
            "cache size must be a whole number of sets"
        );
        let num_sets = size / (line_size * associativity);
        assert!(num_sets.is_power_of_two(), "set count must be a power of two");

        let seed = CACHE_SEED_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;

        Cache {
            name: name.into(),
            cache_size: size,
            line_size,
            associativity,
            line_shift: line_size.trailing_zeros(),
            set_mask: u64::from(num_sets - 1),
            max_search: max_search_depth,
            store_allocation,
            shrink_allowed,
            sets: (0..num_sets)
                .map(|_| CacheSet::new(associativity as usize, line_size as usize))
                .collect(),
            set_ptrs: vec![SET_PTR_NONE; num_sets as usize],
            rng: SmallRng::seed_from_u64(seed),
            probe_history: Vec::with_capacity(max_search_depth as usize),
            access: [[0; 2]; 2],
            set_accesses: vec![0; num_sets as usize],
            set_misses: vec![0; num_sets as usize],
            total_set_accesses: vec![0; num_sets as usize],
            total_set_misses: vec![0; num_sets as usize],
        }
    }

    // accessors

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_size(&self) -> u32 {
        self.cache_size
    }

    pub fn line_size(&self) -> u32 {
        self.line_size
    }

    pub fn num_ways(&self) -> u32 {
        self.associativity
    }

    pub fn num_sets(&self) -> u32 {
        self.sets.len() as u32
    }

    pub fn search_depth(&self) -> u32 {
        self.max_search
    }

    pub fn set_ptr(&self, set_index: u32) -> u32 {
        self.set_ptrs[set_index as usize]
    }

    /// Chain `set_index` to `value` (or `SET_PTR_NONE` to end the chain).
    pub fn set_set_ptr(&mut self, set_index: u32, value: u32) {
        assert!(
            value == SET_PTR_NONE || value < self.num_sets(),
            "overflow pointer out of range"
        );
        self.set_ptrs[set_index as usize] = value;
    }

    // statistics

    pub fn hits(&self, access_type: AccessType) -> CacheStats {
        self.access[access_type as usize][1]
    }

    pub fn misses(&self, access_type: AccessType) -> CacheStats {
        self.access[access_type as usize][0]
    }

    pub fn accesses(&self, access_type: AccessType) -> CacheStats {
        self.hits(access_type) + self.misses(access_type)
    }

    pub fn total_hits(&self) -> CacheStats {
        self.hits(AccessType::Load) + self.hits(AccessType::Store)
    }

    pub fn total_misses(&self) -> CacheStats {
        self.misses(AccessType::Load) + self.misses(AccessType::Store)
    }

    pub fn total_accesses(&self) -> CacheStats {
        self.total_hits() + self.total_misses()
    }

    /// Cumulative `(accesses, misses)` for one set, over the cache lifetime
    pub fn set_stats(&self, set_index: u32) -> (CacheStats, CacheStats) {
        let i = set_index as usize;
        (self.total_set_accesses[i], self.total_set_misses[i])
    }

    /// Misses accumulated since the last `reset_counters`
    pub fn interval_misses(&self) -> CacheStats {
        self.set_misses.iter().sum()
    }

    /// Accesses accumulated since the last `reset_counters`
    pub fn interval_accesses(&self) -> CacheStats {
        self.set_accesses.iter().sum()
    }

    /// Zero the per-set interval counters (cumulative totals survive)
    pub fn reset_counters(&mut self) {
        for i in 0..self.sets.len() {
            self.set_accesses[i] = 0;
            self.set_misses[i] = 0;
        }
    }

    // address mapping

    fn split_address(&self, addr: u64) -> (u64, u32) {
        let tag = addr >> self.line_shift;
        let set_index = (tag & self.set_mask) as u32;
        (tag, set_index)
    }

    fn tag_to_address(&self, tag_bits: u64) -> u64 {
        tag_bits << self.line_shift
    }

    fn line_offset(&self, addr: u64) -> usize {
        (addr & u64::from(self.line_size - 1)) as usize
    }

    /// Walk the probe chain for `tag_bits` starting at `home_set`, recording
    /// visited sets in `probe_history`. Returns the hit position, if any.
    fn probe(&mut self, tag_bits: u64, home_set: u32) -> Option<(u32, usize)> {
        self.probe_history.clear();
        let mut index = home_set;
        let mut depth = 0;
        loop {
            self.probe_history.push(index);
            if let Some(slot) = self.sets[index as usize].find(tag_bits) {
                return Some((index, slot));
            }
            depth += 1;
            if depth >= self.max_search {
                return None;
            }
            let next = self.set_ptrs[index as usize];
            if next == SET_PTR_NONE {
                return None;
            }
            index = next;
        }
    }

    /// Single-line access at `addr`.
    ///
    /// On a miss, loads always allocate; stores allocate only under
    /// `StoreAllocate`. The victim set is drawn uniformly from the probed
    /// chain, then round-robin picks the way within it. Counters are bumped
    /// after the lookup result is known; an eviction is materialized before
    /// the new line's payload moves.
    pub fn access_single_line(
        &mut self,
        addr: u64,
        access_type: AccessType,
        request: AccessRequest<'_>,
    ) -> CacheAccessResult {
        let (tag_bits, home_set) = self.split_address(addr);
        let offset = self.line_offset(addr);

        let found = self.probe(tag_bits, home_set);
        let hit = found.is_some();

        // need-fill protocol: miss with no fill data leaves the cache
        // untouched and asks the caller to retry with a line buffer
        if request.fill_notice && !hit && request.fill_buffer.is_none() {
            return CacheAccessResult { need_fill: true, ..CacheAccessResult::default() };
        }

        let mut result = CacheAccessResult { hit, ..CacheAccessResult::default() };
        let mut payload = request.payload;

        if let Some((set_index, slot)) = found {
            match &mut payload {
                Payload::None => {}
                Payload::Read(out) => self.sets[set_index as usize].read_line(slot, offset, out),
                Payload::Write(data) => {
                    self.sets[set_index as usize].write_line(slot, offset, data)
                }
            }
            result.tag = Some(self.sets[set_index as usize].tags[slot]);
        } else if access_type == AccessType::Load
            || self.store_allocation == StoreAllocation::StoreAllocate
        {
            // uniform draw over the probed chain converges to the home set
            // when the chain is short
            let depth = self.probe_history.len();
            let r = self.rng.gen_range(0..depth);
            let which = self.probe_history[r];

            let new_tag = CacheTag::new(tag_bits, LineState::Shared);
            let (slot, evicted) = self.sets[which as usize].replace(
                new_tag,
                request.fill_buffer,
                request.capture_eviction,
            );

            if let Some((victim_tag, data)) = evicted {
                result.evicted = Some(EvictedLine {
                    addr: self.tag_to_address(victim_tag.tag()),
                    state: victim_tag.state(),
                    data,
                });
            }

            match &mut payload {
                Payload::None => {}
                Payload::Read(out) => self.sets[which as usize].read_line(slot, offset, out),
                Payload::Write(data) => self.sets[which as usize].write_line(slot, offset, data),
            }
            result.tag = Some(self.sets[which as usize].tags[slot]);
        }

        self.access[access_type as usize][usize::from(hit)] += 1;
        let home = home_set as usize;
        self.set_accesses[home] += 1;
        self.total_set_accesses[home] += 1;
        if !hit {
            self.set_misses[home] += 1;
            self.total_set_misses[home] += 1;
        }

        result
    }

    /// Same lookup as `access_single_line`, zero side effects.
    pub fn access_single_line_peek(&self, addr: u64) -> Option<CacheTag> {
        let (tag_bits, home_set) = self.split_address(addr);
        let mut index = home_set;
        let mut depth = 0;
        loop {
            if let Some(slot) = self.sets[index as usize].find(tag_bits) {
                return Some(self.sets[index as usize].tags[slot]);
            }
            depth += 1;
            if depth >= self.max_search {
                return None;
            }
            let next = self.set_ptrs[index as usize];
            if next == SET_PTR_NONE {
                return None;
            }
            index = next;
        }
    }

    /// Update the coherence state of a resident line. Returns whether the
    /// line was present.
    pub fn set_line_state(&mut self, addr: u64, state: LineState) -> bool {
        let (tag_bits, home_set) = self.split_address(addr);
        let mut index = home_set;
        let mut depth = 0;
        loop {
            if let Some(slot) = self.sets[index as usize].find(tag_bits) {
                self.sets[index as usize].tags[slot].set_state(state);
                return true;
            }
            depth += 1;
            if depth >= self.max_search {
                return false;
            }
            let next = self.set_ptrs[index as usize];
            if next == SET_PTR_NONE {
                return false;
            }
            index = next;
        }
    }

    /// Clear the matching tag along the probe chain. Returns whether a line
    /// was actually invalidated.
    pub fn invalidate_line(&mut self, addr: u64) -> bool {
        let (tag_bits, home_set) = self.split_address(addr);
        let mut index = home_set;
        let mut depth = 0;
        loop {
            if self.sets[index as usize].invalidate_tag(tag_bits) {
                return true;
            }
            depth += 1;
            if depth >= self.max_search {
                return false;
            }
            let next = self.set_ptrs[index as usize];
            if next == SET_PTR_NONE {
                return false;
            }
            index = next;
        }
    }

    /// Change every set's associativity. Growth adds empty slots and
    /// preserves resident lines. Shrinking drops lines and is only legal
    /// when no shared-memory simulation is active.
    pub fn resize(&mut self, new_associativity: u32) {
        assert!(new_associativity >= 1, "associativity must be at least 1");
        if new_associativity < self.associativity {
            assert!(
                self.shrink_allowed,
                "cache shrink while shared memory is simulated would lose coherent lines"
            );
        }

        for set in &mut self.sets {
            set.modify_associativity(new_associativity as usize);
        }
        self.associativity = new_associativity;
        self.cache_size = self.num_sets() * new_associativity * self.line_size;
    }

    /// Long-form statistics text, one section per access type.
    pub fn stats_long(&self, prefix: &str, kind: CacheKind) -> String {
        use std::fmt::Write;

        let kind_name = match kind {
            CacheKind::ICache => "icache",
            CacheKind::DCache => "dcache",
        };

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{prefix}{} ({kind_name}): {} B, {}-way, {} sets, {} B lines",
            self.name,
            self.cache_size,
            self.associativity,
            self.num_sets(),
            self.line_size
        );
        for (label, ty) in [("load", AccessType::Load), ("store", AccessType::Store)] {
            let hits = self.hits(ty);
            let misses = self.misses(ty);
            let accesses = hits + misses;
            let rate = if accesses > 0 { misses as f64 / accesses as f64 * 100.0 } else { 0.0 };
            let _ = writeln!(
                out,
                "{prefix}  {label}: {accesses} accesses, {hits} hits, {misses} misses ({rate:.2}% miss)"
            );
        }
        let _ = writeln!(
            out,
            "{prefix}  total: {} accesses, {} hits, {} misses",
            self.total_accesses(),
            self.total_hits(),
            self.total_misses()
        );
        if let Some(hot) = (0..self.num_sets()).max_by_key(|&s| self.set_stats(s).0) {
            let (accesses, misses) = self.set_stats(hot);
            if accesses > 0 {
                let _ = writeln!(
                    out,
                    "{prefix}  hottest set: {hot} ({accesses} accesses, {misses} misses)"
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_cache() -> Cache {
        // 4 sets, direct mapped, 16B lines
        Cache::new("test", 64, 16, 1, 1, StoreAllocation::StoreAllocate, true)
    }

    fn fill_line(cache: &mut Cache, addr: u64, byte: u8) {
        let line = vec![byte; cache.line_size() as usize];
        cache.access_single_line(addr, AccessType::Load, AccessRequest::plain().with_fill(&line));
    }

    #[test]
    fn test_icache_load_hit() {
        let mut cache = tiny_cache();
        fill_line(&mut cache, 0x100, 0);
        assert!(cache.access_single_line_peek(0x100).is_some());

        let hits_before = cache.hits(AccessType::Load);
        let result = cache.access_single_line(0x108, AccessType::Load, AccessRequest::plain());
        assert!(result.hit);
        assert_eq!(cache.hits(AccessType::Load), hits_before + 1);
    }

    #[test]
    fn test_capacity_miss_captures_eviction() {
        let mut cache = tiny_cache();
        let old_data = vec![0x5A_u8; 16];
        cache.access_single_line(0x000, AccessType::Load, AccessRequest::plain().with_fill(&old_data));

        // 0x040 maps to the same set in a 4-set cache with 16B lines
        let fill = vec![0xAA_u8; 16];
        let result = cache.access_single_line(
            0x040,
            AccessType::Load,
            AccessRequest::plain().with_fill(&fill).with_eviction_capture(),
        );
        assert!(!result.hit);
        let evicted = result.evicted.expect("eviction should be captured");
        assert_eq!(evicted.addr, 0x000);
        assert_eq!(evicted.data, old_data);
    }

    #[test]
    fn test_peek_hits_after_fill() {
        let mut cache = tiny_cache();
        assert!(cache.access_single_line_peek(0x200).is_none());
        fill_line(&mut cache, 0x200, 1);
        assert!(cache.access_single_line_peek(0x200).is_some());
    }

    #[test]
    fn test_need_fill_leaves_state_untouched() {
        let mut cache = tiny_cache();
        let result = cache.access_single_line(0x300, AccessType::Load, AccessRequest::probe());
        assert!(result.need_fill);
        assert!(!result.hit);
        assert!(result.tag.is_none());
        // no allocation and no counter movement happened
        assert!(cache.access_single_line_peek(0x300).is_none());
        assert_eq!(cache.total_accesses(), 0);
    }

    #[test]
    fn test_store_load_round_trip() {
        let mut cache = tiny_cache();
        fill_line(&mut cache, 0x080, 0);

        let payload = [1u8, 2, 3, 4];
        let result = cache.access_single_line(
            0x084,
            AccessType::Store,
            AccessRequest::plain().with_write(&payload),
        );
        assert!(result.hit);

        let mut out = [0u8; 4];
        let result = cache.access_single_line(
            0x084,
            AccessType::Load,
            AccessRequest::plain().with_read(&mut out),
        );
        assert!(result.hit);
        assert_eq!(out, payload);
    }

    #[test]
    fn test_store_no_allocate_skips_allocation() {
        let mut cache = Cache::new("wt", 64, 16, 1, 1, StoreAllocation::StoreNoAllocate, true);
        let result = cache.access_single_line(0x040, AccessType::Store, AccessRequest::plain());
        assert!(!result.hit);
        assert!(result.tag.is_none());
        assert!(cache.access_single_line_peek(0x040).is_none());
        assert_eq!(cache.misses(AccessType::Store), 1);
        // loads still allocate
        cache.access_single_line(0x040, AccessType::Load, AccessRequest::plain());
        assert!(cache.access_single_line_peek(0x040).is_some());
    }

    #[test]
    fn test_at_most_one_slot_per_address() {
        let mut cache = Cache::new("assoc", 128, 16, 2, 1, StoreAllocation::StoreAllocate, true);
        for _ in 0..4 {
            cache.access_single_line(0x500, AccessType::Load, AccessRequest::plain());
        }
        // repeated accesses to the same line must not replicate the tag
        let (tag_bits, set_index) = cache.split_address(0x500);
        let set = &cache.sets[set_index as usize];
        let copies = set.tags.iter().filter(|t| t.is_valid() && t.tag() == tag_bits).count();
        assert_eq!(copies, 1);
    }

    #[test]
    fn test_probe_chain_finds_overflowed_line() {
        // 4 sets, searched two deep: chain set 0 -> set 1
        let mut cache = Cache::new("skew", 64, 16, 1, 2, StoreAllocation::StoreAllocate, true);
        cache.set_set_ptr(0, 1);

        // place the line for 0x000 (home set 0) directly into set 1 by
        // filling through set 1's own address then rewriting its tag via
        // chained replacement: fill home set first, then a conflicting line,
        // so one of them lands chained.
        fill_line(&mut cache, 0x000, 0x11); // home set 0
        fill_line(&mut cache, 0x040, 0x22); // same home set, conflict

        // both lines must remain findable through the chain
        let hit_a = cache.access_single_line_peek(0x000).is_some();
        let hit_b = cache.access_single_line_peek(0x040).is_some();
        assert!(hit_a || hit_b);
        // and the chain-aware access path agrees with peek
        let r = cache.access_single_line(0x000, AccessType::Load, AccessRequest::plain());
        assert_eq!(r.hit, hit_a);
    }

    #[test]
    fn test_invalidate_line() {
        let mut cache = tiny_cache();
        fill_line(&mut cache, 0x0C0, 3);
        assert!(cache.invalidate_line(0x0C0));
        assert!(cache.access_single_line_peek(0x0C0).is_none());
        assert!(!cache.invalidate_line(0x0C0));
    }

    #[test]
    fn test_resize_grow_preserves_lines() {
        let mut cache = Cache::new("grow", 128, 16, 2, 1, StoreAllocation::StoreAllocate, true);
        fill_line(&mut cache, 0x100, 7);
        cache.resize(4);
        assert_eq!(cache.num_ways(), 4);
        assert_eq!(cache.cache_size(), 256);
        assert!(cache.access_single_line_peek(0x100).is_some());
    }

    #[test]
    #[should_panic(expected = "shrink")]
    fn test_resize_shrink_with_shared_memory_is_fatal() {
        let mut cache = Cache::new("shr", 128, 16, 2, 1, StoreAllocation::StoreAllocate, false);
        cache.resize(1);
    }

    #[test]
    fn test_line_state_update() {
        let mut cache = tiny_cache();
        fill_line(&mut cache, 0x010, 0);
        assert!(cache.set_line_state(0x010, LineState::Modified));
        let tag = cache.access_single_line_peek(0x010).unwrap();
        assert_eq!(tag.state(), LineState::Modified);
        assert!(!cache.set_line_state(0x900, LineState::Shared));
    }
}
