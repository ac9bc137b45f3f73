//! Demo Workloads
//!
//! Drives the simulator the way instrumented programs would:
//! - a synthetic per-tile instruction trace exercising the perf model and
//!   the caches
//! - a ping-pong message exchange between tile pairs
//! - a ring block exchange in the style of message-passing matrix multiply
//!
//! Each workload claims tiles through `Simulator::initialize`, runs one
//! host thread per tile, and reports aggregate counts.

use std::sync::Arc;
use std::thread;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::core_model::{Instruction, InstructionKind, Operand};
use crate::network::MsgStatus;
use crate::simulator::Simulator;

#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Instructions generated per tile
    pub instructions_per_tile: usize,
    /// Bytes of data each tile touches
    pub working_set_bytes: u64,
    /// Fraction of instructions that read memory
    pub load_fraction: f64,
    /// Fraction of instructions that write memory
    pub store_fraction: f64,
    /// Seed for the per-tile trace PRNGs
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        WorkloadConfig {
            instructions_per_tile: 10_000,
            working_set_bytes: 1 << 16,
            load_fraction: 0.25,
            store_fraction: 0.10,
            seed: 42,
        }
    }
}

/// Aggregate counts across all participating tiles
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkloadStats {
    pub instructions: u64,
    pub cycles: u64,
    pub messages: u64,
    pub bytes: u64,
}

/// Random load/store/ALU trace, deterministic per `(seed, tile)`.
pub fn run_synthetic(sim: &Arc<Simulator>, config: &WorkloadConfig) -> WorkloadStats {
    let spawner = sim.spawner_endpoint();
    let num_tiles = sim.num_tiles();

    let workers: Vec<_> = (0..num_tiles)
        .map(|_| {
            let sim = Arc::clone(sim);
            let config = config.clone();
            thread::spawn(move || {
                let mut tile = sim.initialize().expect("more host threads than tiles");
                let me = tile.tile_id();
                let mut rng = SmallRng::seed_from_u64(config.seed ^ u64::from(me));

                // each tile works in its own address window
                let base = u64::from(me) * config.working_set_bytes;

                for i in 0..config.instructions_per_tile {
                    let pc = 0x1000 + (i as u64 % 4096) * 4;
                    let roll: f64 = rng.gen();
                    let insn = if roll < config.load_fraction {
                        let addr = base + rng.gen_range(0..config.working_set_bytes / 4) * 4;
                        tile.log_memory_read(addr, 4);
                        let kind = if i % 4 == 0 {
                            InstructionKind::SimpleMemoryLoad { cost: 1 }
                        } else {
                            InstructionKind::Generic { cost: 1 }
                        };
                        Instruction::new(
                            pc,
                            kind,
                            vec![Operand::memory_read(), Operand::reg_write(rng.gen_range(1..32))],
                        )
                    } else if roll < config.load_fraction + config.store_fraction {
                        let addr = base + rng.gen_range(0..config.working_set_bytes / 4) * 4;
                        tile.log_memory_write(addr, 4);
                        Instruction::new(
                            pc,
                            InstructionKind::Generic { cost: 1 },
                            vec![Operand::reg_read(rng.gen_range(1..32)), Operand::memory_write()],
                        )
                    } else {
                        Instruction::new(
                            pc,
                            InstructionKind::Generic { cost: rng.gen_range(1..4) },
                            vec![
                                Operand::reg_read(rng.gen_range(1..32)),
                                Operand::reg_read(rng.gen_range(1..32)),
                                Operand::reg_write(rng.gen_range(1..32)),
                            ],
                        )
                    };
                    tile.handle_instruction(&insn);
                }

                // quiesce, then report completion to the spawner
                sim.barrier_wait();
                let cycles = tile.core_model().cycle_count();
                tile.send_w(sim.spawner_rank(), &cycles.to_le_bytes());

                let stats = (tile.core_model().instruction_count(), cycles);
                sim.finish_tile(tile);
                stats
            })
        })
        .collect();

    // the spawner participates in the quiesce rendezvous too
    sim.barrier_wait();

    let mut stats = WorkloadStats::default();
    for rank in 0..num_tiles {
        let mut buf = [0u8; 8];
        if spawner.recv_w(rank as u32, &mut buf) == MsgStatus::Success {
            stats.messages += 1;
            stats.bytes += 8;
        }
    }
    for worker in workers {
        let (instructions, cycles) = worker.join().unwrap();
        stats.instructions += instructions;
        stats.cycles += cycles;
    }
    stats
}

/// Tile pairs bounce a payload back and forth `rounds` times.
pub fn run_ping_pong(sim: &Arc<Simulator>, rounds: u32, payload_len: usize) -> WorkloadStats {
    let num_tiles = sim.num_tiles();

    let workers: Vec<_> = (0..num_tiles)
        .map(|_| {
            let sim = Arc::clone(sim);
            thread::spawn(move || {
                let mut tile = sim.initialize().expect("more host threads than tiles");
                let me = tile.tile_id();
                let peer = me ^ 1;
                let mut messages = 0u64;

                // odd tile out sits idle
                if (peer as usize) < sim.num_tiles() {
                    let payload = vec![me as u8; payload_len];
                    let mut buf = vec![0u8; payload_len];
                    let buf_addr = 0x10_0000 + u64::from(me) * 0x1000;

                    for _ in 0..rounds {
                        if me < peer {
                            tile.send_w(peer, &payload);
                            if tile.recv_w(peer, &mut buf) != MsgStatus::Success {
                                break;
                            }
                        } else {
                            if tile.recv_w(peer, &mut buf) != MsgStatus::Success {
                                break;
                            }
                            tile.send_w(peer, &payload);
                        }
                        // model the touch of the received buffer
                        tile.dcache_run_store_model(buf_addr, payload_len as u32);
                        messages += 2;
                    }
                }

                sim.finish_tile(tile);
                messages
            })
        })
        .collect();

    let mut stats = WorkloadStats::default();
    for worker in workers {
        let messages = worker.join().unwrap();
        // each round trip is counted by both ends; halve below
        stats.messages += messages;
    }
    stats.messages /= 2;
    stats.bytes = stats.messages * payload_len as u64;
    stats
}

/// Ring exchange: every round each tile passes its block left and works on
/// the block it received, message-passing matrix-multiply style.
pub fn run_block_exchange(sim: &Arc<Simulator>, rounds: u32, block_bytes: usize) -> WorkloadStats {
    let num_tiles = sim.num_tiles();

    let workers: Vec<_> = (0..num_tiles)
        .map(|_| {
            let sim = Arc::clone(sim);
            thread::spawn(move || {
                let mut tile = sim.initialize().expect("more host threads than tiles");
                let me = tile.tile_id() as usize;
                let n = sim.num_tiles();
                let left = ((me + n - 1) % n) as u32;
                let right = ((me + 1) % n) as u32;

                let mut block = vec![me as u8; block_bytes];
                let block_addr = 0x20_0000 + (me as u64) * block_bytes as u64;
                let mut messages = 0u64;

                for _round in 0..rounds {
                    // multiply-accumulate over the resident block
                    for (i, chunk) in (0..block_bytes).step_by(8).enumerate() {
                        tile.log_memory_read(block_addr + chunk as u64, 8);
                        let insn = Instruction::new(
                            0x2000 + (i as u64 % 512) * 4,
                            InstructionKind::Generic { cost: 4 },
                            vec![
                                Operand::memory_read(),
                                Operand::reg_read(1),
                                Operand::reg_write(1),
                            ],
                        );
                        tile.handle_instruction(&insn);
                    }

                    if n > 1 {
                        // shift: send left, receive from the right
                        if tile.send_w(left, &block) != MsgStatus::Success {
                            break;
                        }
                        if tile.recv_w(right, &mut block) != MsgStatus::Success {
                            break;
                        }
                        messages += 1;
                        tile.dcache_run_store_model(block_addr, block_bytes as u32);
                    }
                }

                let stats =
                    (tile.core_model().instruction_count(), tile.core_model().cycle_count(), messages);
                sim.finish_tile(tile);
                stats
            })
        })
        .collect();

    let mut stats = WorkloadStats::default();
    for worker in workers {
        let (instructions, cycles, messages) = worker.join().unwrap();
        stats.instructions += instructions;
        stats.cycles += cycles;
        stats.messages += messages;
    }
    stats.bytes = stats.messages * block_bytes as u64;
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;

    fn small_sim() -> Arc<Simulator> {
        Arc::new(Simulator::new(SimulationConfig::small()).unwrap())
    }

    #[test]
    fn test_synthetic_trace_runs() {
        let sim = small_sim();
        let config = WorkloadConfig { instructions_per_tile: 500, ..Default::default() };
        let stats = run_synthetic(&sim, &config);
        assert_eq!(stats.instructions, 1000);
        assert!(stats.cycles > 0);
        assert_eq!(stats.messages, 2);
        sim.shutdown();
    }

    #[test]
    fn test_synthetic_trace_is_deterministic() {
        let config = WorkloadConfig { instructions_per_tile: 300, ..Default::default() };
        let sim_a = small_sim();
        let stats_a = run_synthetic(&sim_a, &config);
        sim_a.shutdown();
        let sim_b = small_sim();
        let stats_b = run_synthetic(&sim_b, &config);
        sim_b.shutdown();
        assert_eq!(stats_a.instructions, stats_b.instructions);
        assert_eq!(stats_a.cycles, stats_b.cycles);
    }

    #[test]
    fn test_ping_pong_counts_round_trips() {
        let sim = small_sim();
        let stats = run_ping_pong(&sim, 10, 64);
        assert_eq!(stats.messages, 20);
        assert_eq!(stats.bytes, 20 * 64);
        sim.shutdown();
    }

    #[test]
    fn test_block_exchange_ring() {
        let sim = small_sim();
        let stats = run_block_exchange(&sim, 4, 256);
        assert_eq!(stats.messages, 8); // 2 tiles x 4 shifts
        assert!(stats.instructions > 0);
        sim.shutdown();
    }
}
