//! Tile Facade
//!
//! A tile is one simulated core: its performance model, its organic cache,
//! and its network endpoint, bound to a tile id. Instrumentation callbacks
//! go through the inline wrappers here so the hot path pays no dispatch
//! cost.

use std::io::Write;

use crate::config::SimulationConfig;
use crate::core_model::{DynamicInstructionInfo, Instruction, IocoomCoreModel, MemOpKind};
use crate::directory::DirectoryHandle;
use crate::network::{MsgStatus, NetworkEndpoint, Rank};
use crate::ocache::OrganicCache;

pub struct Tile {
    tile_id: Rank,
    perf_model_enabled: bool,
    core_model: IocoomCoreModel,
    ocache: OrganicCache,
    endpoint: NetworkEndpoint,
}

impl Tile {
    pub fn new(
        tile_id: Rank,
        config: &SimulationConfig,
        endpoint: NetworkEndpoint,
        directory: Option<DirectoryHandle>,
    ) -> Self {
        Tile {
            tile_id,
            perf_model_enabled: config.models.perf_model_enabled,
            core_model: IocoomCoreModel::new(
                config.iocoom.num_outstanding_loads,
                config.iocoom.num_store_buffer_entries,
            ),
            ocache: OrganicCache::new(tile_id, config, directory),
            endpoint,
        }
    }

    pub fn tile_id(&self) -> Rank {
        self.tile_id
    }

    pub fn core_model(&self) -> &IocoomCoreModel {
        &self.core_model
    }

    pub fn ocache(&self) -> &OrganicCache {
        &self.ocache
    }

    // performance model wrappers

    /// Account one retired instruction against this tile's cycle timeline.
    #[inline]
    pub fn handle_instruction(&mut self, instruction: &Instruction) {
        if self.perf_model_enabled {
            self.core_model.handle_instruction(instruction, &mut self.ocache);
        }
    }

    /// Queue a raw dynamic memory record for the next instruction.
    #[inline]
    pub fn push_dynamic_info(&mut self, info: DynamicInstructionInfo) {
        self.core_model.push_dynamic_info(info);
    }

    /// Model a data read and queue its dynamic record. Returns the hit flag.
    #[inline]
    pub fn log_memory_read(&mut self, addr: u64, size: u32) -> bool {
        let (hit, latency) = self.ocache.run_dcache_load_model(addr, size);
        self.core_model.push_dynamic_info(DynamicInstructionInfo {
            kind: MemOpKind::MemoryRead,
            address: addr,
            latency,
        });
        hit
    }

    /// Model a data write and queue its dynamic record. Returns the hit flag.
    #[inline]
    pub fn log_memory_write(&mut self, addr: u64, size: u32) -> bool {
        let (hit, latency) = self.ocache.run_dcache_store_model(addr, size);
        self.core_model.push_dynamic_info(DynamicInstructionInfo {
            kind: MemOpKind::MemoryWrite,
            address: addr,
            latency,
        });
        hit
    }

    // organic cache wrappers

    #[inline]
    pub fn icache_run_load_model(&mut self, addr: u64, size: u32) -> bool {
        self.ocache.run_icache_load_model(addr, size).0
    }

    #[inline]
    pub fn dcache_run_load_model(&mut self, addr: u64, size: u32) -> bool {
        self.ocache.run_dcache_load_model(addr, size).0
    }

    #[inline]
    pub fn dcache_run_store_model(&mut self, addr: u64, size: u32) -> bool {
        self.ocache.run_dcache_store_model(addr, size).0
    }

    // messaging wrappers

    #[inline]
    pub fn send_w(&self, to: Rank, payload: &[u8]) -> MsgStatus {
        self.endpoint.send_w(to, payload)
    }

    #[inline]
    pub fn recv_w(&self, from: Rank, buf: &mut [u8]) -> MsgStatus {
        self.endpoint.recv_w(from, buf)
    }

    /// Per-tile end-of-run summary.
    pub fn fini(&self, exit_code: i32, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "Tile {} (exit code {exit_code}):", self.tile_id)?;
        self.core_model.output_summary(out)?;
        self.ocache.output_summary(out)?;
        Ok(())
    }
}
