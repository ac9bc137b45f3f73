//! IOCOOM Core Performance Model
//!
//! In-order issue, out-of-order completion: reads gate issue, writes retire
//! after execution. The model maps a stream of decoded instructions plus
//! dynamic memory-access records onto a monotone cycle counter, modeling
//! icache latency, register read-after-write dependencies, load-unit
//! structural hazards, and store-buffer forwarding.

use std::collections::VecDeque;
use std::io::Write;

/// Architectural register file size seen by the scoreboard
pub const NUM_REGISTERS: usize = 512;

/// Narrow seam to the instruction cache: the model only ever asks for the
/// latency of fetching at an address. Keeps the core model free of any
/// dependency on the tile or cache types.
pub trait IcacheModel {
    fn instruction_latency(&mut self, addr: u64) -> u64;
}

/// An icache that is always warm; used when icache modeling is disabled.
pub struct NullIcache;

impl IcacheModel for NullIcache {
    fn instruction_latency(&mut self, _addr: u64) -> u64 {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandDirection {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Reg,
    Memory,
}

/// One instruction operand. For `Reg` the value is the architectural
/// register id; for `Memory` the effective address arrives separately via
/// the dynamic-info queue.
#[derive(Debug, Clone, Copy)]
pub struct Operand {
    pub direction: OperandDirection,
    pub kind: OperandKind,
    pub value: u64,
}

impl Operand {
    pub fn reg_read(reg: u64) -> Self {
        Operand { direction: OperandDirection::Read, kind: OperandKind::Reg, value: reg }
    }

    pub fn reg_write(reg: u64) -> Self {
        Operand { direction: OperandDirection::Write, kind: OperandKind::Reg, value: reg }
    }

    pub fn memory_read() -> Self {
        Operand { direction: OperandDirection::Read, kind: OperandKind::Memory, value: 0 }
    }

    pub fn memory_write() -> Self {
        Operand { direction: OperandDirection::Write, kind: OperandKind::Memory, value: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    /// Ordinary instruction with a static execution cost
    Generic { cost: u64 },
    /// A load whose consumer is far away: it occupies a load unit but does
    /// not block the pipeline
    SimpleMemoryLoad { cost: u64 },
    /// Spawn/sync-style instruction whose timing is accounted elsewhere;
    /// aborts the per-instruction protocol before any state mutates
    Dynamic,
}

/// A decoded instruction as delivered by instrumentation
#[derive(Debug, Clone)]
pub struct Instruction {
    pub address: u64,
    pub kind: InstructionKind,
    pub operands: Vec<Operand>,
}

impl Instruction {
    pub fn new(address: u64, kind: InstructionKind, operands: Vec<Operand>) -> Self {
        Instruction { address, kind, operands }
    }

    /// Static cost in cycles, or `None` for dynamic instructions, which
    /// cancel the rest of this instruction's accounting.
    pub fn cost(&self) -> Option<u64> {
        match self.kind {
            InstructionKind::Generic { cost } | InstructionKind::SimpleMemoryLoad { cost } => {
                Some(cost)
            }
            InstructionKind::Dynamic => None,
        }
    }

    pub fn is_simple_memory_load(&self) -> bool {
        matches!(self.kind, InstructionKind::SimpleMemoryLoad { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOpKind {
    MemoryRead,
    MemoryWrite,
}

/// Per-memory-op record produced by instrumentation in program order and
/// consumed exactly once by the model.
#[derive(Debug, Clone, Copy)]
pub struct DynamicInstructionInfo {
    pub kind: MemOpKind,
    pub address: u64,
    pub latency: u64,
}

/// K outstanding-load slots, each holding the cycle at which it frees up.
#[derive(Debug)]
pub struct LoadUnit {
    scoreboard: Vec<u64>,
}

impl LoadUnit {
    pub fn new(num_units: usize) -> Self {
        assert!(num_units >= 1, "load unit needs at least one slot");
        LoadUnit { scoreboard: vec![0; num_units] }
    }

    /// Issue a load at `time` occupying a slot for `occupancy` cycles.
    /// Returns the cycle the load actually begins: `time` when a slot is
    /// free, otherwise the earliest slot's drain time (the structural wait).
    pub fn execute(&mut self, time: u64, occupancy: u64) -> u64 {
        let mut unit = 0;
        for i in 0..self.scoreboard.len() {
            if self.scoreboard[i] <= time {
                self.scoreboard[i] = time + occupancy;
                return time;
            }
            if self.scoreboard[i] < self.scoreboard[unit] {
                unit = i;
            }
        }
        self.scoreboard[unit] += occupancy;
        self.scoreboard[unit] - occupancy
    }

    pub fn reset(&mut self) {
        self.scoreboard.fill(0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBufferStatus {
    Valid,
    NotFound,
}

/// Small addressable buffer of in-flight stores. Doubles as a structural
/// resource and as a forwarding source that satisfies matching loads without
/// touching the cache.
///
/// Invariant: at most one entry per address.
#[derive(Debug)]
pub struct StoreBuffer {
    scoreboard: Vec<u64>,
    addresses: Vec<Option<u64>>,
}

impl StoreBuffer {
    pub fn new(num_entries: usize) -> Self {
        assert!(num_entries >= 1, "store buffer needs at least one entry");
        StoreBuffer { scoreboard: vec![0; num_entries], addresses: vec![None; num_entries] }
    }

    /// Same slot-selection rule as the load unit, except a store to an
    /// address already resident refreshes that entry (write coalescing).
    pub fn execute_store(&mut self, time: u64, occupancy: u64, addr: u64) -> u64 {
        for i in 0..self.scoreboard.len() {
            if self.addresses[i] == Some(addr) {
                self.scoreboard[i] = time + occupancy;
                return time;
            }
        }

        let mut unit = 0;
        for i in 0..self.scoreboard.len() {
            if self.scoreboard[i] <= time {
                self.scoreboard[i] = time + occupancy;
                self.addresses[i] = Some(addr);
                return time;
            }
            if self.scoreboard[i] < self.scoreboard[unit] {
                unit = i;
            }
        }
        self.scoreboard[unit] += occupancy;
        self.addresses[unit] = Some(addr);
        self.scoreboard[unit] - occupancy
    }

    /// An in-flight store to `addr` that has not yet drained lets a load
    /// bypass the cache entirely.
    pub fn is_address_available(&self, time: u64, addr: u64) -> StoreBufferStatus {
        for i in 0..self.scoreboard.len() {
            if self.addresses[i] == Some(addr) && self.scoreboard[i] >= time {
                return StoreBufferStatus::Valid;
            }
        }
        StoreBufferStatus::NotFound
    }

    pub fn reset(&mut self) {
        self.scoreboard.fill(0);
        self.addresses.fill(None);
    }
}

/// The per-tile performance model.
pub struct IocoomCoreModel {
    cycle_count: u64,
    instruction_count: u64,
    register_scoreboard: Vec<u64>,
    load_unit: LoadUnit,
    store_buffer: StoreBuffer,
    dynamic_info: VecDeque<DynamicInstructionInfo>,
}

impl IocoomCoreModel {
    pub fn new(num_outstanding_loads: usize, num_store_buffer_entries: usize) -> Self {
        IocoomCoreModel {
            cycle_count: 0,
            instruction_count: 0,
            register_scoreboard: vec![0; NUM_REGISTERS],
            load_unit: LoadUnit::new(num_outstanding_loads),
            store_buffer: StoreBuffer::new(num_store_buffer_entries),
            dynamic_info: VecDeque::new(),
        }
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    /// Instrumentation pushes one record per memory operand, in program
    /// order; `handle_instruction` consumes them in the same order.
    pub fn push_dynamic_info(&mut self, info: DynamicInstructionInfo) {
        self.dynamic_info.push_back(info);
    }

    fn pop_dynamic_info(&mut self) -> DynamicInstructionInfo {
        self.dynamic_info
            .pop_front()
            .expect("memory operand with no dynamic instruction info queued")
    }

    /// Account one retired instruction.
    ///
    /// The protocol:
    /// 1. read the static cost (dynamic instructions abort here, before any
    ///    state mutates)
    /// 2. charge the icache fetch
    /// 3. compute read-operand readiness from the scoreboard
    /// 4. run memory reads through the load unit / store-buffer bypass;
    ///    buffer memory-write info for after execute
    /// 5. execution completes at read completion + cost
    /// 6. register writes update the scoreboard (WAR resolved by in-order
    ///    issue, so the write is unconditional)
    /// 7. memory writes go to the store buffer
    /// 8. advance the cycle counter: simple loads only wait for issue
    ///    readiness, stores retire fully, everything else waits for its
    ///    reads to complete
    pub fn handle_instruction(&mut self, instruction: &Instruction, icache: &mut dyn IcacheModel) {
        let Some(cost) = instruction.cost() else {
            return;
        };

        self.cycle_count += icache.instruction_latency(instruction.address);

        let mut write_info: VecDeque<DynamicInstructionInfo> = VecDeque::new();

        // when are the read operands available?
        let mut read_operands_ready = self.cycle_count;
        for op in &instruction.operands {
            if op.direction != OperandDirection::Read || op.kind != OperandKind::Reg {
                continue;
            }
            assert!(
                (op.value as usize) < self.register_scoreboard.len(),
                "register id out of range: {}",
                op.value
            );
            read_operands_ready = read_operands_ready.max(self.register_scoreboard[op.value as usize]);
        }
        let mut read_completion_time = read_operands_ready;

        // memory reads and writes, in operand order
        let mut has_memory_write_operand = false;
        for op in &instruction.operands {
            if op.kind != OperandKind::Memory {
                continue;
            }
            let info = self.pop_dynamic_info();
            match op.direction {
                OperandDirection::Read => {
                    assert!(
                        info.kind == MemOpKind::MemoryRead,
                        "expected memory-read info, got {:?}",
                        info.kind
                    );
                    let (load_ready, load_latency) = self.execute_load(self.cycle_count, &info);
                    // 'ready' reflects the structural hazard in the load unit
                    read_operands_ready = read_operands_ready.max(load_ready);
                    read_completion_time = read_completion_time.max(load_ready + load_latency);
                }
                OperandDirection::Write => {
                    assert!(
                        info.kind == MemOpKind::MemoryWrite,
                        "expected memory-write info, got {:?}",
                        info.kind
                    );
                    has_memory_write_operand = true;
                    write_info.push_back(info);
                }
            }
        }

        let execute_unit_completion_time = read_completion_time + cost;

        // register writes: WAR hazards are resolved by waiting for all read
        // operands before issue, so the scoreboard entry is overwritten even
        // when the previous value was larger
        let mut write_operands_ready = execute_unit_completion_time;
        for op in &instruction.operands {
            if op.direction != OperandDirection::Write || op.kind != OperandKind::Reg {
                continue;
            }
            self.register_scoreboard[op.value as usize] = execute_unit_completion_time;
            write_operands_ready =
                write_operands_ready.max(self.register_scoreboard[op.value as usize]);
        }

        // memory writes retire through the store buffer
        while let Some(info) = write_info.pop_front() {
            let store_time = self.execute_store(execute_unit_completion_time, &info);
            write_operands_ready = write_operands_ready.max(store_time);
        }

        //                   ----->  time
        // ---|--------------------|------------------------|------------------|---
        //  read_operands_ready  read_completion  execute_completion  write_operands_ready
        if instruction.is_simple_memory_load() {
            self.cycle_count = read_operands_ready + 1;
        } else if !has_memory_write_operand {
            self.cycle_count = read_completion_time + 1;
        } else {
            self.cycle_count = write_operands_ready + 1;
        }

        self.instruction_count += 1;
    }

    /// Returns `(ready_cycle, latency)`. A completed store-buffer entry for
    /// the address satisfies the load immediately at zero latency.
    fn execute_load(&mut self, time: u64, info: &DynamicInstructionInfo) -> (u64, u64) {
        if self.store_buffer.is_address_available(time, info.address) == StoreBufferStatus::Valid {
            return (time, 0);
        }
        let latency = info.latency;
        (self.load_unit.execute(time, latency), latency)
    }

    fn execute_store(&mut self, time: u64, info: &DynamicInstructionInfo) -> u64 {
        self.store_buffer.execute_store(time, info.latency, info.address)
    }

    pub fn reset(&mut self) {
        self.cycle_count = 0;
        self.instruction_count = 0;
        self.register_scoreboard.fill(0);
        self.load_unit.reset();
        self.store_buffer.reset();
        self.dynamic_info.clear();
    }

    pub fn output_summary(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "  Core Performance Model Summary:")?;
        writeln!(out, "    Instructions: {}", self.instruction_count)?;
        writeln!(out, "    Cycles: {}", self.cycle_count)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedIcache(u64);

    impl IcacheModel for FixedIcache {
        fn instruction_latency(&mut self, _addr: u64) -> u64 {
            self.0
        }
    }

    fn model() -> IocoomCoreModel {
        IocoomCoreModel::new(3, 1)
    }

    #[test]
    fn test_load_unit_saturation() {
        let mut unit = LoadUnit::new(2);
        assert_eq!(unit.execute(0, 10), 0);
        assert_eq!(unit.execute(0, 10), 0);
        // both slots busy until 10; the third load starts when one drains
        assert_eq!(unit.execute(0, 10), 10);
    }

    #[test]
    fn test_store_buffer_bypass_window() {
        let mut buffer = StoreBuffer::new(2);
        assert_eq!(buffer.execute_store(5, 3, 0xA0), 5);
        assert_eq!(buffer.is_address_available(6, 0xA0), StoreBufferStatus::Valid);
        assert_eq!(buffer.is_address_available(100, 0xA0), StoreBufferStatus::NotFound);
    }

    #[test]
    fn test_store_buffer_coalescing() {
        let mut buffer = StoreBuffer::new(2);
        // repeated stores to one address occupy a single entry
        for t in 0..8 {
            assert_eq!(buffer.execute_store(t, 4, 0x40), t);
        }
        // the second entry is still free
        assert_eq!(buffer.execute_store(0, 4, 0x80), 0);
    }

    #[test]
    fn test_scoreboard_chain() {
        let mut m = model();
        let mut icache = FixedIcache(0);

        // I1: writes r5, cost 7, issues at cycle 0
        let i1 = Instruction::new(
            0x1000,
            InstructionKind::Generic { cost: 7 },
            vec![Operand::reg_write(5)],
        );
        m.handle_instruction(&i1, &mut icache);
        assert_eq!(m.register_scoreboard[5], 7);
        assert_eq!(m.cycle_count(), 1);

        // I2: reads r5, writes r6, cost 2; issue gated on r5's readiness
        let i2 = Instruction::new(
            0x1004,
            InstructionKind::Generic { cost: 2 },
            vec![Operand::reg_read(5), Operand::reg_write(6)],
        );
        m.handle_instruction(&i2, &mut icache);
        // execution completes at 7 + 2 = 9; the next instruction issues
        // once I2's reads completed
        assert_eq!(m.register_scoreboard[6], 9);
        assert_eq!(m.cycle_count(), 8);
        assert_eq!(m.instruction_count(), 2);
    }

    #[test]
    fn test_store_retires_before_next_instruction() {
        let mut m = model();
        let mut icache = FixedIcache(0);

        let store = Instruction::new(
            0x2000,
            InstructionKind::Generic { cost: 1 },
            vec![Operand::memory_write()],
        );
        m.push_dynamic_info(DynamicInstructionInfo {
            kind: MemOpKind::MemoryWrite,
            address: 0x500,
            latency: 5,
        });
        m.handle_instruction(&store, &mut icache);
        // exec completes at 1, store enters the buffer at 1 and the next
        // instruction issues at write_ready + 1
        assert_eq!(m.cycle_count(), 2);
    }

    #[test]
    fn test_simple_load_overlaps() {
        let mut m = model();
        let mut icache = FixedIcache(0);

        let load = Instruction::new(
            0x3000,
            InstructionKind::SimpleMemoryLoad { cost: 1 },
            vec![Operand::memory_read(), Operand::reg_write(7)],
        );
        m.push_dynamic_info(DynamicInstructionInfo {
            kind: MemOpKind::MemoryRead,
            address: 0x600,
            latency: 50,
        });
        m.handle_instruction(&load, &mut icache);
        // the load only blocks the load unit, not the pipeline
        assert_eq!(m.cycle_count(), 1);
        // but its register target is not ready until the data arrives
        assert_eq!(m.register_scoreboard[7], 51);
    }

    #[test]
    fn test_load_bypasses_via_store_buffer() {
        let mut m = model();
        let mut icache = FixedIcache(0);

        let store = Instruction::new(
            0x4000,
            InstructionKind::Generic { cost: 1 },
            vec![Operand::memory_write()],
        );
        m.push_dynamic_info(DynamicInstructionInfo {
            kind: MemOpKind::MemoryWrite,
            address: 0x700,
            latency: 30,
        });
        m.handle_instruction(&store, &mut icache);

        let load = Instruction::new(
            0x4004,
            InstructionKind::Generic { cost: 1 },
            vec![Operand::memory_read(), Operand::reg_write(3)],
        );
        m.push_dynamic_info(DynamicInstructionInfo {
            kind: MemOpKind::MemoryRead,
            address: 0x700,
            latency: 100,
        });
        let cycles_before = m.cycle_count();
        m.handle_instruction(&load, &mut icache);
        // forwarded from the store buffer: zero load latency
        assert_eq!(m.register_scoreboard[3], cycles_before + 1);
    }

    #[test]
    fn test_icache_latency_charged() {
        let mut m = model();
        let mut icache = FixedIcache(4);
        let nop =
            Instruction::new(0x5000, InstructionKind::Generic { cost: 1 }, vec![]);
        m.handle_instruction(&nop, &mut icache);
        // 4 cycles of fetch plus read_completion + 1
        assert_eq!(m.cycle_count(), 5);
    }

    #[test]
    fn test_dynamic_instruction_aborts_untouched() {
        let mut m = model();
        let mut icache = FixedIcache(1);
        let sync = Instruction::new(0x6000, InstructionKind::Dynamic, vec![]);
        m.handle_instruction(&sync, &mut icache);
        assert_eq!(m.cycle_count(), 0);
        assert_eq!(m.instruction_count(), 0);
    }

    #[test]
    #[should_panic(expected = "expected memory-read info")]
    fn test_dynamic_info_type_mismatch_is_fatal() {
        let mut m = model();
        let mut icache = FixedIcache(0);
        let load = Instruction::new(
            0x7000,
            InstructionKind::Generic { cost: 1 },
            vec![Operand::memory_read()],
        );
        m.push_dynamic_info(DynamicInstructionInfo {
            kind: MemOpKind::MemoryWrite,
            address: 0,
            latency: 1,
        });
        m.handle_instruction(&load, &mut icache);
    }

    #[test]
    fn test_cycle_count_strictly_monotone() {
        let mut m = model();
        let mut icache = FixedIcache(0);
        let mut last = m.cycle_count();
        for i in 0..16 {
            let insn = Instruction::new(
                0x8000 + i * 4,
                InstructionKind::Generic { cost: (i % 3) as u64 },
                vec![Operand::reg_read(1), Operand::reg_write(1)],
            );
            m.handle_instruction(&insn, &mut icache);
            assert!(m.cycle_count() > last);
            last = m.cycle_count();
        }
    }

    #[test]
    fn test_reset() {
        let mut m = model();
        let mut icache = FixedIcache(0);
        let insn = Instruction::new(
            0x9000,
            InstructionKind::Generic { cost: 3 },
            vec![Operand::reg_write(2)],
        );
        m.handle_instruction(&insn, &mut icache);
        m.reset();
        assert_eq!(m.cycle_count(), 0);
        assert_eq!(m.instruction_count(), 0);
        assert_eq!(m.register_scoreboard[2], 0);
    }
}
