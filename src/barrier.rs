use std::sync::{Condvar, Mutex};

/// Phase of the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RunPe,
    RunBus,
    Halt,
}

#[derive(Debug)]
struct Shared {
    phase: Phase,
    tick: u64,
    pe_done: usize,
    bus_done: bool,
}

/// Two-phase tick barrier coordinating the PE workers, the bus worker and
/// the orchestrator.
///
/// A tick is: phase `RunPe` until every PE stepped once, then `RunBus`
/// until the bus stepped once, then `Idle`. Workers carry their own
/// generation counter (the tick they last served) and only run when the
/// barrier's tick has moved past it, which makes missed wakeups and double
/// steps within one tick impossible. The actual `step` calls happen with
/// the barrier lock released.
#[derive(Debug)]
pub struct TickBarrier {
    num_pes: usize,
    shared: Mutex<Shared>,
    cond: Condvar,
}

impl TickBarrier {
    #[must_use]
    pub fn new(num_pes: usize) -> Self {
        Self {
            num_pes,
            shared: Mutex::new(Shared {
                phase: Phase::Idle,
                tick: 0,
                pe_done: 0,
                bus_done: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Current tick number.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.shared.lock().unwrap().tick
    }

    /// Drive one full tick: every PE steps once, then the bus steps once.
    ///
    /// Returns false if the barrier was halted while waiting.
    pub fn advance_tick(&self) -> bool {
        let mut shared = self.shared.lock().unwrap();
        if shared.phase == Phase::Halt {
            return false;
        }
        shared.tick += 1;
        shared.pe_done = 0;
        shared.bus_done = false;

        shared.phase = Phase::RunPe;
        self.cond.notify_all();
        let num_pes = self.num_pes;
        shared = self
            .cond
            .wait_while(shared, |s| s.pe_done < num_pes && s.phase != Phase::Halt)
            .unwrap();
        if shared.phase == Phase::Halt {
            return false;
        }

        shared.phase = Phase::RunBus;
        self.cond.notify_all();
        shared = self
            .cond
            .wait_while(shared, |s| !s.bus_done && s.phase != Phase::Halt)
            .unwrap();
        if shared.phase == Phase::Halt {
            return false;
        }

        shared.phase = Phase::Idle;
        self.cond.notify_all();
        true
    }

    /// Block until this PE worker may serve a tick newer than `last_tick`.
    /// Returns the tick to serve, or `None` on halt.
    #[must_use]
    pub fn wait_pe_turn(&self, last_tick: u64) -> Option<u64> {
        let shared = self
            .cond
            .wait_while(self.shared.lock().unwrap(), |s| {
                s.phase != Phase::Halt && !(s.phase == Phase::RunPe && s.tick != last_tick)
            })
            .unwrap();
        (shared.phase != Phase::Halt).then_some(shared.tick)
    }

    /// Report this PE worker's step for the current tick as done.
    pub fn pe_done(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.pe_done += 1;
        debug_assert!(shared.pe_done <= self.num_pes);
        self.cond.notify_all();
    }

    /// Block until the bus worker may serve a tick newer than `last_tick`.
    #[must_use]
    pub fn wait_bus_turn(&self, last_tick: u64) -> Option<u64> {
        let shared = self
            .cond
            .wait_while(self.shared.lock().unwrap(), |s| {
                s.phase != Phase::Halt && !(s.phase == Phase::RunBus && s.tick != last_tick)
            })
            .unwrap();
        (shared.phase != Phase::Halt).then_some(shared.tick)
    }

    /// Report the bus step for the current tick as done.
    pub fn bus_done(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.bus_done = true;
        self.cond.notify_all();
    }

    /// Ask every worker to exit; they observe `Halt` on their next wait.
    pub fn halt(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.phase = Phase::Halt;
        self.cond.notify_all();
    }
}
