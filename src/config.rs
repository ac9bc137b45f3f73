//! Simulator Configuration Module
//!
//! Defines all parameterizable aspects of the simulated chip: tile count,
//! cache geometries and thresholds, core-model resources, and the model
//! enable switches. Everything here is plain data so configurations can be
//! saved, diffed, and replayed.

use serde::{Deserialize, Serialize};

/// Complete simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of simulated tiles (rank N == num_tiles is the spawner)
    pub num_tiles: usize,
    /// Model switches
    pub models: ModelConfig,
    /// Shared organic-cache pool that the icache and dcache partition
    pub cache: SharedCacheKnobs,
    /// Data cache parameters
    pub dcache: CacheKnobs,
    /// Instruction cache parameters
    pub icache: CacheKnobs,
    /// Organic cache repartitioning
    pub organic: OrganicConfig,
    /// IOCOOM core model resources
    pub iocoom: IocoomConfig,
    /// Directory / coherence parameters
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Run the performance model at all
    pub perf_model_enabled: bool,
    /// Model data-cache timing
    pub dcache_modeling: bool,
    /// Model instruction-cache timing
    pub icache_modeling: bool,
    /// Shared-memory simulation active (gates cache shrink legality)
    pub shared_memory_enabled: bool,
}

/// The way budget both caches draw from. Organic repartitioning moves ways
/// between the icache and dcache but never grows past this pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedCacheKnobs {
    /// Total capacity in bytes across both caches
    pub cache_size: u32,
    /// Line size in bytes shared by both caches
    pub line_size: u32,
    /// Total ways across both caches
    pub associativity: u32,
}

/// Per-cache geometry and timing knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheKnobs {
    /// Total capacity in bytes
    pub size: u32,
    /// Line size in bytes (power of two)
    pub line_size: u32,
    /// Ways per set
    pub associativity: u32,
    /// Maximum number of sets probed along a chain (1 = plain set-assoc)
    pub max_search_depth: u32,
    /// Latency charged on a hit, in cycles
    pub hit_latency: u64,
    /// Latency charged on a miss, in cycles
    pub miss_latency: u64,
    /// Misses per interval above which this cache wants more ways
    pub threshold_miss: u64,
    /// Misses per interval below which this cache can give a way up
    pub threshold_hit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganicConfig {
    /// Accesses between repartitioning decisions (0 = never repartition)
    pub mutation_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IocoomConfig {
    /// Store buffer entries
    pub num_store_buffer_entries: usize,
    /// Outstanding-load slots
    pub num_outstanding_loads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Maximum sharers tracked per line (0 = track every tile)
    pub max_sharers: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            num_tiles: 2,
            models: ModelConfig {
                perf_model_enabled: true,
                dcache_modeling: true,
                icache_modeling: true,
                shared_memory_enabled: true,
            },
            cache: SharedCacheKnobs {
                cache_size: 65536,
                line_size: 32,
                associativity: 8,
            },
            dcache: CacheKnobs {
                size: 32768,
                line_size: 32,
                associativity: 4,
                max_search_depth: 1,
                hit_latency: 1,
                miss_latency: 100,
                threshold_miss: 50,
                threshold_hit: 0,
            },
            icache: CacheKnobs {
                size: 32768,
                line_size: 32,
                associativity: 4,
                max_search_depth: 1,
                hit_latency: 1,
                miss_latency: 100,
                threshold_miss: 50,
                threshold_hit: 0,
            },
            organic: OrganicConfig {
                mutation_interval: 0,
            },
            iocoom: IocoomConfig {
                num_store_buffer_entries: 1,
                num_outstanding_loads: 3,
            },
            directory: DirectoryConfig { max_sharers: 0 },
        }
    }
}

impl SimulationConfig {
    /// Small configuration for unit tests and quick runs
    pub fn small() -> Self {
        let mut config = SimulationConfig::default();
        config.num_tiles = 2;
        config.dcache.size = 1024;
        config.icache.size = 1024;
        config
    }

    /// Effective sharer limit for directory entries
    pub fn max_sharers(&self) -> usize {
        if self.directory.max_sharers == 0 {
            self.num_tiles
        } else {
            self.directory.max_sharers
        }
    }

    /// Reject configurations the simulator cannot run.
    ///
    /// Configuration errors are fatal at startup; nothing past this point
    /// re-checks the knobs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_tiles == 0 {
            return Err(ConfigError::new("num_tiles must be at least 1"));
        }
        self.dcache.validate("dcache")?;
        self.icache.validate("icache")?;
        if self.dcache.line_size != self.cache.line_size
            || self.icache.line_size != self.cache.line_size
        {
            return Err(ConfigError::new(format!(
                "icache/dcache line sizes must match the shared pool line size ({})",
                self.cache.line_size
            )));
        }
        if self.dcache.associativity + self.icache.associativity > self.cache.associativity {
            return Err(ConfigError::new(format!(
                "icache + dcache ways ({} + {}) exceed the shared pool ({})",
                self.icache.associativity, self.dcache.associativity, self.cache.associativity
            )));
        }
        if self.dcache.size + self.icache.size > self.cache.cache_size {
            return Err(ConfigError::new(format!(
                "icache + dcache capacity ({} + {}) exceeds the shared pool ({})",
                self.icache.size, self.dcache.size, self.cache.cache_size
            )));
        }
        if self.directory.max_sharers > self.num_tiles {
            return Err(ConfigError::new(format!(
                "directory.max_sharers ({}) exceeds num_tiles ({})",
                self.directory.max_sharers, self.num_tiles
            )));
        }
        if self.iocoom.num_store_buffer_entries == 0 {
            return Err(ConfigError::new("iocoom.num_store_buffer_entries must be at least 1"));
        }
        if self.iocoom.num_outstanding_loads == 0 {
            return Err(ConfigError::new("iocoom.num_outstanding_loads must be at least 1"));
        }
        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, toml_str)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &str) -> std::io::Result<Self> {
        let toml_str = std::fs::read_to_string(path)?;
        toml::from_str(&toml_str).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

impl CacheKnobs {
    fn validate(&self, which: &str) -> Result<(), ConfigError> {
        if !self.line_size.is_power_of_two() {
            return Err(ConfigError::new(format!(
                "{which}.line_size ({}) must be a power of two",
                self.line_size
            )));
        }
        if self.associativity == 0 {
            return Err(ConfigError::new(format!("{which}.associativity must be at least 1")));
        }
        if self.max_search_depth == 0 {
            return Err(ConfigError::new(format!("{which}.max_search_depth must be at least 1")));
        }
        let line_x_assoc = self.line_size * self.associativity;
        if self.size == 0 || self.size % line_x_assoc != 0 {
            return Err(ConfigError::new(format!(
                "{which}.size ({}) must be a multiple of line_size * associativity ({})",
                self.size, line_x_assoc
            )));
        }
        let num_sets = self.size / line_x_assoc;
        if !num_sets.is_power_of_two() {
            return Err(ConfigError::new(format!(
                "{which}: derived set count ({num_sets}) must be a power of two"
            )));
        }
        Ok(())
    }
}

/// A rejected configuration; fatal at startup
#[derive(Debug)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        ConfigError { message: message.into() }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}
