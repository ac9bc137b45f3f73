//! Simulator Bootstrap and Teardown
//!
//! One `Simulator` owns the transport, the directory slices, and the tiles.
//! There is no process-wide singleton: every thread that participates gets
//! the pieces it needs handed to it. Host threads claim tiles through
//! `initialize`, the spawner coordinator uses rank N, and teardown is
//! two-phase: quiesce the participants, then shut down the directory and
//! release every blocked receiver on the transport.

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use log::{debug, info};

use crate::config::{ConfigError, SimulationConfig};
use crate::directory::Directory;
use crate::network::{NetworkEndpoint, Rank, Transport};
use crate::tile::Tile;

pub struct Simulator {
    config: SimulationConfig,
    transport: Arc<Transport>,
    directory: Mutex<Directory>,
    /// Tiles waiting to be claimed by host threads, indexed by rank;
    /// finished tiles come back here for the summary.
    tiles: Mutex<Vec<Option<Tile>>>,
    next_rank: AtomicU32,
    /// Rendezvous for all tiles plus the spawner before teardown
    barrier: Barrier,
}

impl Simulator {
    pub fn new(config: SimulationConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let num_tiles = config.num_tiles;
        let transport = Arc::new(Transport::new(num_tiles));
        let directory = Directory::spawn(
            num_tiles,
            config.max_sharers(),
            config.dcache.line_size.trailing_zeros(),
        );

        let tiles = (0..num_tiles)
            .map(|rank| {
                let endpoint = NetworkEndpoint::new(rank as Rank, Arc::clone(&transport));
                Some(Tile::new(rank as Rank, &config, endpoint, Some(directory.handle())))
            })
            .collect();

        info!("simulator up: {num_tiles} tiles + spawner");

        Ok(Simulator {
            config,
            transport,
            directory: Mutex::new(directory),
            tiles: Mutex::new(tiles),
            next_rank: AtomicU32::new(0),
            barrier: Barrier::new(num_tiles + 1),
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn num_tiles(&self) -> usize {
        self.config.num_tiles
    }

    /// Rank of the spawner coordinator
    pub fn spawner_rank(&self) -> Rank {
        self.transport.spawner_rank()
    }

    /// Claim the next free tile for the calling host thread. Returns `None`
    /// once every tile has been handed out.
    pub fn initialize(&self) -> Option<Tile> {
        let rank = self.next_rank.fetch_add(1, Ordering::Relaxed) as usize;
        if rank >= self.num_tiles() {
            return None;
        }
        let tile = self.tiles.lock().unwrap()[rank].take();
        debug!("rank {rank} claimed by host thread");
        tile
    }

    /// Return a finished tile so its statistics appear in the summary.
    pub fn finish_tile(&self, tile: Tile) {
        let rank = tile.tile_id() as usize;
        self.tiles.lock().unwrap()[rank] = Some(tile);
    }

    /// The spawner's view of the transport (rank N).
    pub fn spawner_endpoint(&self) -> NetworkEndpoint {
        NetworkEndpoint::new(self.spawner_rank(), Arc::clone(&self.transport))
    }

    /// Rendezvous of all tiles plus the spawner. Each participant calls
    /// this exactly once per phase.
    pub fn barrier_wait(&self) {
        self.barrier.wait();
    }

    /// Two-phase teardown. Callers must have joined (or released) all tile
    /// threads first; then the directory slices stop and the transport
    /// releases any receiver still blocked with a terminal status.
    pub fn shutdown(&self) {
        self.directory.lock().unwrap().shutdown();
        self.transport.shutdown();
        info!("simulator torn down");
    }

    /// Aggregate per-tile summaries plus directory totals.
    pub fn output_summary(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let tiles = self.tiles.lock().unwrap();
        let mut total_instructions = 0u64;
        let mut total_cycles = 0u64;

        for slot in tiles.iter() {
            if let Some(tile) = slot {
                tile.fini(0, out)?;
                total_instructions += tile.core_model().instruction_count();
                total_cycles += tile.core_model().cycle_count();
            }
        }

        writeln!(out, "Chip totals:")?;
        writeln!(out, "  instructions: {total_instructions}")?;
        writeln!(out, "  cycles (summed over tiles): {total_cycles}")?;

        let directory = self.directory.lock().unwrap();
        let stats = directory.stats();
        writeln!(
            out,
            "  directory: {} requests, {} forced invalidations",
            stats.requests.load(Ordering::Relaxed),
            stats.forced_invalidations.load(Ordering::Relaxed)
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MsgStatus;
    use std::thread;

    fn small_sim() -> Arc<Simulator> {
        Arc::new(Simulator::new(SimulationConfig::small()).unwrap())
    }

    #[test]
    fn test_initialize_assigns_distinct_ranks() {
        let sim = small_sim();
        let a = sim.initialize().unwrap();
        let b = sim.initialize().unwrap();
        assert_ne!(a.tile_id(), b.tile_id());
        assert!(sim.initialize().is_none());
        sim.finish_tile(a);
        sim.finish_tile(b);
        sim.shutdown();
    }

    #[test]
    fn test_ping_pong_between_tiles() {
        let sim = small_sim();

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let sim = Arc::clone(&sim);
                thread::spawn(move || {
                    let tile = sim.initialize().unwrap();
                    let me = tile.tile_id();
                    let peer = 1 - me;
                    if me == 0 {
                        tile.send_w(peer, &me.to_le_bytes());
                        let mut buf = [0u8; 4];
                        assert_eq!(tile.recv_w(peer, &mut buf), MsgStatus::Success);
                        assert_eq!(u32::from_le_bytes(buf), peer);
                    } else {
                        let mut buf = [0u8; 4];
                        assert_eq!(tile.recv_w(peer, &mut buf), MsgStatus::Success);
                        assert_eq!(u32::from_le_bytes(buf), peer);
                        tile.send_w(peer, &me.to_le_bytes());
                    }
                    sim.finish_tile(tile);
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        sim.shutdown();
    }

    #[test]
    fn test_spawner_talks_to_tile() {
        let sim = small_sim();
        let spawner = sim.spawner_endpoint();
        assert_eq!(spawner.rank(), 2);

        let tile = sim.initialize().unwrap();
        spawner.send_w(tile.tile_id(), b"work");
        let mut buf = [0u8; 4];
        assert_eq!(tile.recv_w(spawner.rank(), &mut buf), MsgStatus::Success);
        assert_eq!(&buf, b"work");
        sim.finish_tile(tile);
        sim.shutdown();
    }

    #[test]
    fn test_shutdown_terminates_transport() {
        let sim = small_sim();
        sim.shutdown();
        let spawner = sim.spawner_endpoint();
        assert_eq!(spawner.send_w(0, b"late"), MsgStatus::Terminated);
    }

    #[test]
    fn test_summary_after_run() {
        let sim = small_sim();
        let mut tile = sim.initialize().unwrap();
        tile.log_memory_read(0x1000, 4);
        let insn = crate::core_model::Instruction::new(
            0x100,
            crate::core_model::InstructionKind::Generic { cost: 1 },
            vec![crate::core_model::Operand::memory_read()],
        );
        tile.handle_instruction(&insn);
        sim.finish_tile(tile);

        let mut out = Vec::new();
        sim.output_summary(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Tile 0"));
        assert!(text.contains("Chip totals"));
        assert!(text.contains("directory"));
        sim.shutdown();
    }
}
