//! Organic Cache Facade
//!
//! Binds a tile's instruction cache and data cache into one unit that
//! shares a way budget. When `mutation_interval` is nonzero the facade
//! periodically compares each side's miss pressure against its thresholds
//! and moves one way from the calmer cache to the busier one.
//!
//! The dcache path is also where coherence enters: a miss that fills a line
//! registers the tile as a sharer (or exclusive owner, for stores) with the
//! line's home directory, and evictions notify the home so the sharer
//! bit-vector stays in sync.

use std::io::Write;

use log::{debug, warn};

use crate::cache::{
    AccessRequest, AccessType, Cache, CacheKind, LineState, StoreAllocation,
};
use crate::config::SimulationConfig;
use crate::core_model::IcacheModel;
use crate::directory::{DirectoryHandle, DirectoryOp};
use crate::network::Rank;

/// Per-tile icache + dcache pair with adaptive way repartitioning.
pub struct OrganicCache {
    rank: Rank,
    icache: Cache,
    dcache: Cache,

    icache_enabled: bool,
    dcache_enabled: bool,

    icache_hit_latency: u64,
    icache_miss_latency: u64,
    dcache_hit_latency: u64,
    dcache_miss_latency: u64,

    /// Accesses between repartitioning decisions; 0 disables the feature
    mutation_interval: u64,
    accesses_since_decision: u64,
    repartition_allowed: bool,
    icache_threshold_hit: u64,
    icache_threshold_miss: u64,
    dcache_threshold_hit: u64,
    dcache_threshold_miss: u64,

    directory: Option<DirectoryHandle>,

    // statistics
    evictions: u64,
    writebacks: u64,
    upgrades: u64,
    repartitions: u64,
}

impl OrganicCache {
    pub fn new(rank: Rank, config: &SimulationConfig, directory: Option<DirectoryHandle>) -> Self {
        let shrink_allowed = !config.models.shared_memory_enabled;
        let icache = Cache::new(
            format!("tile-{rank}-icache"),
            config.icache.size,
            config.icache.line_size,
            config.icache.associativity,
            config.icache.max_search_depth,
            StoreAllocation::StoreAllocate,
            shrink_allowed,
        );
        let dcache = Cache::new(
            format!("tile-{rank}-dcache"),
            config.dcache.size,
            config.dcache.line_size,
            config.dcache.associativity,
            config.dcache.max_search_depth,
            StoreAllocation::StoreAllocate,
            shrink_allowed,
        );

        let repartition_allowed = shrink_allowed;
        if config.organic.mutation_interval > 0 && !repartition_allowed {
            warn!(
                "tile {rank}: organic repartitioning disabled while shared memory is simulated"
            );
        }

        OrganicCache {
            rank,
            icache,
            dcache,
            icache_enabled: config.models.icache_modeling,
            dcache_enabled: config.models.dcache_modeling,
            icache_hit_latency: config.icache.hit_latency,
            icache_miss_latency: config.icache.miss_latency,
            dcache_hit_latency: config.dcache.hit_latency,
            dcache_miss_latency: config.dcache.miss_latency,
            mutation_interval: config.organic.mutation_interval,
            accesses_since_decision: 0,
            repartition_allowed,
            icache_threshold_hit: config.icache.threshold_hit,
            icache_threshold_miss: config.icache.threshold_miss,
            dcache_threshold_hit: config.dcache.threshold_hit,
            dcache_threshold_miss: config.dcache.threshold_miss,
            directory,
            evictions: 0,
            writebacks: 0,
            upgrades: 0,
            repartitions: 0,
        }
    }

    pub fn icache(&self) -> &Cache {
        &self.icache
    }

    pub fn dcache(&self) -> &Cache {
        &self.dcache
    }

    fn line_mask(cache: &Cache) -> u64 {
        !u64::from(cache.line_size() - 1)
    }

    /// Model an instruction fetch of `size` bytes. Returns the hit flag and
    /// the charged latency.
    pub fn run_icache_load_model(&mut self, addr: u64, size: u32) -> (bool, u64) {
        if !self.icache_enabled {
            return (true, 0);
        }

        let line_bytes = u64::from(self.icache.line_size());
        let not_line_mask = Self::line_mask(&self.icache);
        let high_addr = addr + u64::from(size);

        let mut all_hit = true;
        let mut line_addr = addr;
        while line_addr < high_addr {
            let result =
                self.icache.access_single_line(line_addr, AccessType::Load, AccessRequest::plain());
            all_hit &= result.hit;
            line_addr = (line_addr & not_line_mask) + line_bytes;
        }

        self.after_access();
        let latency = if all_hit { self.icache_hit_latency } else { self.icache_miss_latency };
        (all_hit, latency)
    }

    /// Model a data load of `size` bytes.
    pub fn run_dcache_load_model(&mut self, addr: u64, size: u32) -> (bool, u64) {
        if !self.dcache_enabled {
            return (true, 0);
        }

        let line_bytes = u64::from(self.dcache.line_size());
        let not_line_mask = Self::line_mask(&self.dcache);
        let high_addr = addr + u64::from(size);

        let mut all_hit = true;
        let mut line_addr = addr;
        while line_addr < high_addr {
            let result = self.dcache.access_single_line(
                line_addr,
                AccessType::Load,
                AccessRequest::plain().with_eviction_capture(),
            );
            self.note_eviction(&result.evicted);
            if !result.hit {
                all_hit = false;
                self.fill_shared(line_addr & not_line_mask);
            }
            line_addr = (line_addr & not_line_mask) + line_bytes;
        }

        self.after_access();
        let latency = if all_hit { self.dcache_hit_latency } else { self.dcache_miss_latency };
        (all_hit, latency)
    }

    /// Model a data store of `size` bytes.
    pub fn run_dcache_store_model(&mut self, addr: u64, size: u32) -> (bool, u64) {
        if !self.dcache_enabled {
            return (true, 0);
        }

        let line_bytes = u64::from(self.dcache.line_size());
        let not_line_mask = Self::line_mask(&self.dcache);
        let high_addr = addr + u64::from(size);

        let mut all_hit = true;
        let mut line_addr = addr;
        while line_addr < high_addr {
            let line_base = line_addr & not_line_mask;
            let result = self.dcache.access_single_line(
                line_addr,
                AccessType::Store,
                AccessRequest::plain().with_eviction_capture(),
            );
            self.note_eviction(&result.evicted);

            if result.hit {
                // writing a shared copy needs exclusive ownership first
                if result.tag.map(|t| t.state()) == Some(LineState::Shared) {
                    self.upgrade_exclusive(line_base);
                    self.upgrades += 1;
                }
            } else {
                all_hit = false;
                self.fill_exclusive(line_base);
            }
            self.dcache.set_line_state(line_addr, LineState::Modified);

            line_addr = line_base + line_bytes;
        }

        self.after_access();
        let latency = if all_hit { self.dcache_hit_latency } else { self.dcache_miss_latency };
        (all_hit, latency)
    }

    /// Drop a line from the dcache, e.g. when the home directory reclaimed
    /// this tile's copy.
    pub fn invalidate_dcache_line(&mut self, addr: u64) -> bool {
        self.dcache.invalidate_line(addr)
    }

    fn fill_shared(&mut self, line_addr: u64) {
        self.dcache.set_line_state(line_addr, LineState::Shared);
        if let Some(directory) = &self.directory {
            directory.request(DirectoryOp::ReadShared, line_addr, self.rank);
        }
    }

    fn fill_exclusive(&mut self, line_addr: u64) {
        if let Some(directory) = &self.directory {
            directory.request(DirectoryOp::ReadExclusive, line_addr, self.rank);
        }
    }

    fn upgrade_exclusive(&mut self, line_addr: u64) {
        if let Some(directory) = &self.directory {
            directory.request(DirectoryOp::ReadExclusive, line_addr, self.rank);
        }
    }

    fn note_eviction(&mut self, evicted: &Option<crate::cache::EvictedLine>) {
        if let Some(line) = evicted {
            self.evictions += 1;
            if matches!(line.state, LineState::Modified | LineState::Exclusive) {
                self.writebacks += 1;
            }
            if let Some(directory) = &self.directory {
                directory.request(DirectoryOp::Evict, line.addr, self.rank);
            }
        }
    }

    /// Repartitioning decision point, run after every modeled access.
    fn after_access(&mut self) {
        if self.mutation_interval == 0 || !self.repartition_allowed {
            return;
        }
        self.accesses_since_decision += 1;
        if self.accesses_since_decision < self.mutation_interval {
            return;
        }
        self.accesses_since_decision = 0;

        let i_misses = self.icache.interval_misses();
        let d_misses = self.dcache.interval_misses();

        if d_misses >= self.dcache_threshold_miss
            && i_misses <= self.icache_threshold_hit
            && self.icache.num_ways() > 1
        {
            let i_ways = self.icache.num_ways() - 1;
            let d_ways = self.dcache.num_ways() + 1;
            debug!(
                "tile {}: repartition i{}→{} d{}→{} (i_miss={i_misses}, d_miss={d_misses})",
                self.rank,
                self.icache.num_ways(),
                i_ways,
                self.dcache.num_ways(),
                d_ways
            );
            self.icache.resize(i_ways);
            self.dcache.resize(d_ways);
            self.repartitions += 1;
        } else if i_misses >= self.icache_threshold_miss
            && d_misses <= self.dcache_threshold_hit
            && self.dcache.num_ways() > 1
        {
            let d_ways = self.dcache.num_ways() - 1;
            let i_ways = self.icache.num_ways() + 1;
            debug!(
                "tile {}: repartition d{}→{} i{}→{} (i_miss={i_misses}, d_miss={d_misses})",
                self.rank,
                self.dcache.num_ways(),
                d_ways,
                self.icache.num_ways(),
                i_ways
            );
            self.dcache.resize(d_ways);
            self.icache.resize(i_ways);
            self.repartitions += 1;
        }

        self.icache.reset_counters();
        self.dcache.reset_counters();
    }

    pub fn output_summary(&self, out: &mut dyn Write) -> std::io::Result<()> {
        write!(out, "{}", self.icache.stats_long("  ", CacheKind::ICache))?;
        write!(out, "{}", self.dcache.stats_long("  ", CacheKind::DCache))?;
        writeln!(
            out,
            "  evictions: {} (writebacks: {}), upgrades: {}, repartitions: {}",
            self.evictions, self.writebacks, self.upgrades, self.repartitions
        )?;
        Ok(())
    }
}

/// The perf model's icache seam is the organic cache itself.
impl IcacheModel for OrganicCache {
    fn instruction_latency(&mut self, addr: u64) -> u64 {
        self.run_icache_load_model(addr, std::mem::size_of::<u64>() as u32).1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SimulationConfig {
        let mut config = SimulationConfig::small();
        // keep shrink legal so repartitioning tests can run
        config.models.shared_memory_enabled = false;
        config
    }

    #[test]
    fn test_icache_miss_then_hit_latency() {
        let config = test_config();
        let mut ocache = OrganicCache::new(0, &config, None);
        let (hit, latency) = ocache.run_icache_load_model(0x1000, 4);
        assert!(!hit);
        assert_eq!(latency, config.icache.miss_latency);
        let (hit, latency) = ocache.run_icache_load_model(0x1000, 4);
        assert!(hit);
        assert_eq!(latency, config.icache.hit_latency);
    }

    #[test]
    fn test_disabled_models_are_free() {
        let mut config = test_config();
        config.models.icache_modeling = false;
        config.models.dcache_modeling = false;
        let mut ocache = OrganicCache::new(0, &config, None);
        assert_eq!(ocache.run_icache_load_model(0x2000, 4), (true, 0));
        assert_eq!(ocache.run_dcache_load_model(0x2000, 4), (true, 0));
        assert_eq!(ocache.run_dcache_store_model(0x2000, 4), (true, 0));
        assert_eq!(ocache.icache().total_accesses(), 0);
    }

    #[test]
    fn test_store_marks_line_modified() {
        let config = test_config();
        let mut ocache = OrganicCache::new(0, &config, None);
        ocache.run_dcache_store_model(0x400, 4);
        let tag = ocache.dcache().access_single_line_peek(0x400).unwrap();
        assert_eq!(tag.state(), LineState::Modified);
    }

    #[test]
    fn test_straddling_access_touches_both_lines() {
        let config = test_config();
        let line = u64::from(config.dcache.line_size);
        let mut ocache = OrganicCache::new(0, &config, None);
        // last 2 bytes of line 0 plus first 2 bytes of line 1
        ocache.run_dcache_load_model(line - 2, 4);
        assert!(ocache.dcache().access_single_line_peek(0).is_some());
        assert!(ocache.dcache().access_single_line_peek(line).is_some());
    }

    #[test]
    fn test_repartition_moves_way_to_dcache() {
        let mut config = test_config();
        config.organic.mutation_interval = 32;
        config.dcache.threshold_miss = 1;
        config.icache.threshold_hit = u64::MAX; // icache never objects
        let mut ocache = OrganicCache::new(0, &config, None);

        let i_ways_before = ocache.icache().num_ways();
        let d_ways_before = ocache.dcache().num_ways();

        // a dcache-miss-heavy phase: conflicting lines across many sets
        for i in 0..64u64 {
            ocache.run_dcache_load_model(i * 0x1000, 4);
        }

        assert!(ocache.repartitions > 0);
        assert!(ocache.dcache().num_ways() > d_ways_before);
        assert!(ocache.icache().num_ways() < i_ways_before);
    }

    #[test]
    fn test_invalidate_dcache_line() {
        let config = test_config();
        let mut ocache = OrganicCache::new(0, &config, None);
        ocache.run_dcache_load_model(0x800, 4);
        assert!(ocache.invalidate_dcache_line(0x800));
        assert!(ocache.dcache().access_single_line_peek(0x800).is_none());
    }
}
