use crate::asm;
use crate::barrier::TickBarrier;
use crate::bus::{Bus, Queue};
use crate::cache::Cache;
use crate::config::{DotConfig, MachineConfig, WORD_BYTES};
use crate::core::Core;
use crate::isa::{Instr, Program};
use crate::mem::MainMemory;
use crate::{address, mem, pe_id, stats, word};
use itertools::Itertools;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::thread;

/// The canonical workload: one PE's segment of the partitioned dot product.
/// `init_dot_problem` presets R0 = segment length, R1/R2 = segment bases of
/// A and B, R3 = this PE's partial-sum slot.
pub const DEMO_PROGRAM: &str = "\
; one segment of the partitioned dot product
loop:
    LOAD  REG4, [REG1]
    LOAD  REG5, [REG2]
    FMUL  REG6, REG4, REG5
    LOAD  REG7, [REG3]
    FADD  REG7, REG7, REG6
    STORE REG7, [REG3]
    INC   REG1
    INC   REG2
    DEC   REG0
    JNZ   loop
";

/// How a batch run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed { ticks: u64 },
    /// The safety cap was hit before every PE finished. The simulation
    /// state is whatever progress was made.
    TimedOut { ticks: u64 },
}

impl Outcome {
    #[must_use]
    pub fn is_completed(self) -> bool {
        matches!(self, Outcome::Completed { .. })
    }

    #[must_use]
    pub fn ticks(self) -> u64 {
        match self {
            Outcome::Completed { ticks } | Outcome::TimedOut { ticks } => ticks,
        }
    }
}

/// Owns the whole machine and drives it tick by tick.
///
/// Construction wires memory, caches, bus and PEs together (the bus gets
/// non-owning cache handles through a registration call) and parks one
/// worker thread per PE plus one for the bus on the tick barrier. Within a
/// tick every PE steps exactly once before the bus steps exactly once.
#[derive(Debug)]
pub struct Simulator {
    config: MachineConfig,
    dot: DotConfig,
    mem: Arc<MainMemory>,
    queue: Arc<Queue>,
    caches: Vec<Arc<Mutex<Cache>>>,
    cores: Vec<Arc<Mutex<Core>>>,
    bus: Arc<Mutex<Bus>>,
    barrier: Arc<TickBarrier>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Simulator {
    #[must_use]
    pub fn new(config: MachineConfig) -> Self {
        let mem = Arc::new(MainMemory::new(config.mem_words));
        let queue = Arc::new(Queue::default());

        let caches: Vec<_> = (0..config.num_pes)
            .map(|pe| {
                Arc::new(Mutex::new(Cache::new(
                    pe,
                    &config,
                    Arc::clone(&mem),
                    Arc::clone(&queue),
                )))
            })
            .collect();

        let mut bus = Bus::new(&config, Arc::clone(&queue));
        bus.register_caches(caches.clone());
        let bus = Arc::new(Mutex::new(bus));

        let cores: Vec<_> = caches
            .iter()
            .enumerate()
            .map(|(pe, cache)| Arc::new(Mutex::new(Core::new(pe, Arc::clone(cache)))))
            .collect();

        let barrier = Arc::new(TickBarrier::new(config.num_pes));
        let mut workers = Vec::with_capacity(config.num_pes + 1);
        for core in &cores {
            let core = Arc::clone(core);
            let barrier = Arc::clone(&barrier);
            workers.push(thread::spawn(move || {
                let mut last = 0;
                while let Some(tick) = barrier.wait_pe_turn(last) {
                    core.lock().unwrap().step();
                    barrier.pe_done();
                    last = tick;
                }
            }));
        }
        {
            let bus = Arc::clone(&bus);
            let barrier = Arc::clone(&barrier);
            workers.push(thread::spawn(move || {
                let mut last = 0;
                while let Some(tick) = barrier.wait_bus_turn(last) {
                    bus.lock().unwrap().step();
                    barrier.bus_done();
                    last = tick;
                }
            }));
        }

        log::info!(
            "machine up: {} PEs, {} words of memory, {}x{}-way cache lines of {}B",
            config.num_pes,
            config.mem_words,
            config.num_sets(),
            config.cache_ways,
            config.line_bytes,
        );
        Self {
            config,
            dot: DotConfig::default(),
            mem,
            queue,
            caches,
            cores,
            bus,
            barrier,
            workers,
        }
    }

    #[must_use]
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    #[must_use]
    pub fn dot(&self) -> DotConfig {
        self.dot
    }

    #[must_use]
    pub fn mem(&self) -> &Arc<MainMemory> {
        &self.mem
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    #[must_use]
    pub fn cache(&self, pe: pe_id) -> &Arc<Mutex<Cache>> {
        &self.caches[pe]
    }

    #[must_use]
    pub fn core(&self, pe: pe_id) -> &Arc<Mutex<Core>> {
        &self.cores[pe]
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<Mutex<Bus>> {
        &self.bus
    }

    /// Ticks driven so far.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.barrier.tick()
    }

    /// The built-in dot-product kernel.
    #[must_use]
    pub fn demo_program() -> Program {
        asm::assemble(DEMO_PROGRAM).expect("demo program assembles")
    }

    pub fn load_program_all(&self, program: &Program) {
        for core in &self.cores {
            core.lock().unwrap().load_program(program.clone());
        }
    }

    pub fn load_program_all_from_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), asm::Error> {
        let program = asm::assemble_file(path)?;
        self.load_program_all(&program);
        Ok(())
    }

    /// Lay out the dot-product workload in memory and preset each PE's
    /// registers for its segment.
    ///
    /// Vectors shorter than `dot.n` are zero-filled.
    pub fn init_dot_problem(
        &mut self,
        dot: DotConfig,
        a: &[f64],
        b: &[f64],
    ) -> Result<(), mem::Error> {
        self.dot = dot;
        for i in 0..dot.n {
            let av = a.get(i).copied().unwrap_or(0.0);
            let bv = b.get(i).copied().unwrap_or(0.0);
            self.mem.try_write(dot.a_elem(i), av.to_bits())?;
            self.mem.try_write(dot.b_elem(i), bv.to_bits())?;
        }
        for pe in 0..self.config.num_pes {
            self.mem.try_write(dot.ps_slot(pe), 0f64.to_bits())?;
        }

        let seg = dot.seg(self.config.num_pes);
        for (pe, core) in self.cores.iter().enumerate() {
            let mut core = core.lock().unwrap();
            core.set_reg(0, seg as word);
            core.set_reg(1, dot.a_elem(pe * seg));
            core.set_reg(2, dot.b_elem(pe * seg));
            core.set_reg(3, dot.ps_slot(pe));
        }
        log::info!(
            "dot problem: n={} seg={seg} baseA={:#x} baseB={:#x} basePS={:#x}",
            dot.n,
            dot.base_a,
            dot.base_b,
            dot.base_ps,
        );
        Ok(())
    }

    /// Drive one full tick (all PEs, then the bus).
    pub fn advance_one_tick(&self) {
        self.barrier.advance_tick();
    }

    pub fn run_cycles(&self, cycles: u64) {
        for _ in 0..cycles {
            self.advance_one_tick();
        }
    }

    #[must_use]
    pub fn all_done(&self) -> bool {
        self.cores
            .iter()
            .all(|core| core.lock().unwrap().is_done())
    }

    /// Tick until every PE is done, then drain two more ticks so the last
    /// enqueued bus request is processed.
    pub fn run_until_done(&self, safety_max: u64) -> Outcome {
        let mut drained = 0;
        let mut ticks = 0;
        while ticks < safety_max {
            let already_done = self.all_done();
            self.advance_one_tick();
            ticks += 1;
            if already_done {
                drained += 1;
                if drained >= 2 {
                    log::info!("run complete after {ticks} ticks");
                    return Outcome::Completed { ticks };
                }
            } else {
                drained = 0;
            }
        }
        log::warn!("run hit the safety cap of {safety_max} ticks");
        Outcome::TimedOut { ticks }
    }

    /// Sum the per-PE partial sums on PE0 through the coherent memory
    /// subsystem and store the result back to PE0's slot.
    pub fn final_reduce(&self) -> f64 {
        let dot = self.dot;
        let reduction = Program::from_code(vec![
            // warm the cache on a neighbouring slot first
            Instr::movi(1, dot.ps_slot(1.min(self.config.num_pes - 1))),
            Instr::load(7, 1),
            Instr::movi(1, dot.base_ps),
            Instr::movi(2, self.config.num_pes as word),
            Instr::reduce(4, 1, 2),
            Instr::store(4, 3),
        ]);
        self.cores[0].lock().unwrap().load_program(reduction);

        let mut ticks = 0;
        while !self.cores[0].lock().unwrap().is_done() && ticks < 2000 {
            self.advance_one_tick();
            ticks += 1;
        }
        f64::from_bits(self.cores[0].lock().unwrap().reg(4))
    }

    /// CPU reference dot product over the vectors as they sit in memory.
    #[must_use]
    pub fn reference_dot(&self) -> f64 {
        (0..self.dot.n)
            .map(|i| {
                let a = f64::from_bits(self.mem.read_word(self.dot.a_elem(i)));
                let b = f64::from_bits(self.mem.read_word(self.dot.b_elem(i)));
                a * b
            })
            .sum()
    }

    /// PE `pe`'s partial sum as it sits in memory.
    #[must_use]
    pub fn partial_sum(&self, pe: pe_id) -> f64 {
        f64::from_bits(self.mem.read_word(self.dot.ps_slot(pe)))
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn stats(&self) -> stats::Stats {
        stats::Stats {
            caches: self
                .caches
                .iter()
                .map(|cache| cache.lock().unwrap().stats().clone())
                .collect(),
            bus: self.bus.lock().unwrap().stats().clone(),
        }
    }

    /// Human-readable end-of-run metrics block.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for (pe, cache) in self.caches.iter().enumerate() {
            let cache = cache.lock().unwrap();
            let m = cache.stats();
            let _ = writeln!(
                out,
                "PE{pe} | loads {} | stores {} | hits {} | misses {} | invalidations {} | flushes {} | bus bytes {}",
                m.loads, m.stores, m.hits, m.misses, m.invalidations, m.flushes, m.bus_bytes,
            );
        }
        let bus = self.bus.lock().unwrap();
        let commands = bus
            .stats()
            .command_counts()
            .filter(|(_, count)| *count > 0)
            .map(|(cmd, count)| format!("{cmd}={count}"))
            .join(" ");
        let _ = writeln!(
            out,
            "bus | bytes {} | flushes {} | {commands}",
            bus.bytes(),
            bus.flushes(),
        );
        out
    }

    /// Check the cross-cache MESI invariants and bus accounting. Only
    /// meaningful when the bus queue is drained; returns one message per
    /// violation.
    #[must_use]
    pub fn coherence_violations(&self) -> Vec<String> {
        use crate::cache::State;
        use std::collections::HashMap;

        let mut violations = Vec::new();
        let mut owners: HashMap<address, Vec<(pe_id, State)>> = HashMap::new();

        for (pe, cache) in self.caches.iter().enumerate() {
            let cache = cache.lock().unwrap();
            for (base, line) in cache.valid_lines() {
                owners.entry(base).or_default().push((pe, line.state));
                if line.dirty {
                    violations.push(format!("PE{pe} holds {base:#x} dirty under write-through"));
                }
                if line.state == State::Shared {
                    for k in 0..self.config.line_bytes / WORD_BYTES {
                        let addr = base + (k * WORD_BYTES) as address;
                        let held = line.read(k * WORD_BYTES, WORD_BYTES);
                        let in_mem = self.mem.read_word(addr);
                        if held != in_mem {
                            violations.push(format!(
                                "PE{pe} shared copy of {addr:#x} diverges from memory ({held:#x} != {in_mem:#x})"
                            ));
                        }
                    }
                }
            }
        }

        for (base, holders) in &owners {
            let modified = holders
                .iter()
                .filter(|(_, s)| *s == State::Modified)
                .count();
            if modified > 1 {
                violations.push(format!("{modified} caches hold {base:#x} in M"));
            }
            let exclusive_like = holders
                .iter()
                .any(|(_, s)| matches!(s, State::Modified | State::Exclusive));
            if exclusive_like && holders.len() > 1 {
                violations.push(format!(
                    "{base:#x} held M/E alongside other valid copies ({holders:?})"
                ));
            }
        }

        let stats = self.stats();
        let attributed: u64 = stats.caches.iter().map(|c| c.bus_bytes).sum();
        if attributed < stats.bus.bytes {
            violations.push(format!(
                "bus accounting: attributed {attributed} < global {}",
                stats.bus.bytes
            ));
        }
        violations
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.barrier.halt();
        for worker in self.workers.drain(..) {
            // a worker that panicked already failed the run; don't hide it
            if let Err(panic) = worker.join() {
                log::error!("worker panicked: {panic:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_program_assembles() {
        let program = Simulator::demo_program();
        assert_eq!(program.len(), 10);
        assert_eq!(program.resolve("loop"), Some(0));
    }

    #[test]
    fn coherent_propagation_between_pes() {
        let mut sim = Simulator::new(MachineConfig::default());
        sim.init_dot_problem(DotConfig::default(), &[], &[]).unwrap();

        // PE0 stores, the bus quiesces, PE1 must read the new value
        sim.cache(0).lock().unwrap().store(0x40, 8, 4242);
        sim.run_cycles(4);
        let (_, value) = sim.cache(1).lock().unwrap().load(0x40, 8);
        assert_eq!(value, 4242);
        sim.run_cycles(4);
        assert_eq!(sim.coherence_violations(), Vec::<String>::new());
    }

    #[test]
    fn short_vectors_are_zero_filled() {
        let mut sim = Simulator::new(MachineConfig::default());
        let dot = DotConfig {
            n: 8,
            ..DotConfig::default()
        };
        sim.init_dot_problem(dot, &[1.0, 2.0], &[3.0]).unwrap();
        assert_eq!(f64::from_bits(sim.mem().read_word(dot.a_elem(1))), 2.0);
        assert_eq!(f64::from_bits(sim.mem().read_word(dot.a_elem(2))), 0.0);
        assert_eq!(f64::from_bits(sim.mem().read_word(dot.b_elem(7))), 0.0);
        assert_eq!(sim.reference_dot(), 3.0);
    }

    #[test]
    fn run_until_done_times_out_on_infinite_loop() {
        let sim = Simulator::new(MachineConfig {
            num_pes: 1,
            ..MachineConfig::default()
        });
        let program = asm::assemble("spin:\nMOVI REG0, 1\nJNZ spin").unwrap();
        sim.load_program_all(&program);
        let outcome = sim.run_until_done(64);
        assert_eq!(outcome, Outcome::TimedOut { ticks: 64 });
    }
}
