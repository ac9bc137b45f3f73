//! Tile-Based Multicore Architectural Simulator
//!
//! Runs multithreaded workloads against a parameterized many-core model and
//! measures cycle counts, cache behavior, and on-chip traffic. Each host
//! thread is pinned to a simulated tile that owns:
//!
//! - an **IOCOOM performance model** (in-order issue, out-of-order
//!   completion) with a register scoreboard, load units, and a store buffer
//! - an **organic cache**: an icache/dcache pair sharing one way budget,
//!   repartitioned adaptively under miss pressure
//! - a **directory slice** tracking sharers of the memory lines homed here
//! - a **network endpoint** for tile-to-tile messaging
//!
//! Threads exchange data through the message-passing API (`send_w` /
//! `recv_w`) rather than shared memory; rank N is the spawner coordinator.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tilesim::prelude::*;
//!
//! let config = SimulationConfig::default(); // 2 tiles
//! let sim = Arc::new(Simulator::new(config).unwrap());
//!
//! // one host thread per tile
//! let workers: Vec<_> = (0..sim.num_tiles())
//!     .map(|_| {
//!         let sim = Arc::clone(&sim);
//!         std::thread::spawn(move || {
//!             let mut tile = sim.initialize().unwrap();
//!             tile.log_memory_read(0x1000, 4);
//!             // ... feed instructions, exchange messages ...
//!             sim.finish_tile(tile);
//!         })
//!     })
//!     .collect();
//!
//! for w in workers {
//!     w.join().unwrap();
//! }
//! sim.output_summary(&mut std::io::stdout()).unwrap();
//! sim.shutdown();
//! ```

pub mod cache;
pub mod config;
pub mod core_model;
pub mod directory;
pub mod network;
pub mod ocache;
pub mod simulator;
pub mod tile;
pub mod workload;

/// Prelude - commonly used types
pub mod prelude {
    pub use crate::cache::{
        AccessRequest, AccessType, Cache, CacheAccessResult, CacheKind, CacheTag, LineState,
        StoreAllocation,
    };
    pub use crate::config::{CacheKnobs, ConfigError, SharedCacheKnobs, SimulationConfig};
    pub use crate::core_model::{
        DynamicInstructionInfo, IcacheModel, Instruction, InstructionKind, IocoomCoreModel,
        LoadUnit, MemOpKind, Operand, StoreBuffer, StoreBufferStatus,
    };
    pub use crate::directory::{
        BitVector, Directory, DirectoryEntry, DirectoryHandle, DirectoryOp, DirectoryReply,
        DirectoryState,
    };
    pub use crate::network::{MsgStatus, NetworkEndpoint, Rank, Transport};
    pub use crate::ocache::OrganicCache;
    pub use crate::simulator::Simulator;
    pub use crate::tile::Tile;
    pub use crate::workload::{WorkloadConfig, WorkloadStats};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
