use crate::bus::Command;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::IntoEnumIterator;

/// MESI transition counters kept per cache.
///
/// `x_to_i` counts every invalidation out of a valid state, regardless of
/// which of S/E/M the line was in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transitions {
    pub e_to_s: u64,
    pub s_to_m: u64,
    pub e_to_m: u64,
    pub m_to_s: u64,
    pub x_to_i: u64,
}

impl std::ops::AddAssign for Transitions {
    fn add_assign(&mut self, other: Self) {
        self.e_to_s += other.e_to_s;
        self.s_to_m += other.s_to_m;
        self.e_to_m += other.e_to_m;
        self.m_to_s += other.m_to_s;
        self.x_to_i += other.x_to_i;
    }
}

/// Per-cache access and coherence counters.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {
    pub loads: u64,
    pub stores: u64,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    /// Times this cache wrote a line back on a snoop (intervention).
    pub flushes: u64,
    /// Bus traffic attributed to this PE by the bus.
    pub bus_bytes: u64,
    pub transitions: Transitions,
}

impl Cache {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[must_use]
    pub fn accesses(&self) -> u64 {
        self.loads + self.stores
    }
}

impl std::ops::AddAssign for Cache {
    fn add_assign(&mut self, other: Self) {
        self.loads += other.loads;
        self.stores += other.stores;
        self.hits += other.hits;
        self.misses += other.misses;
        self.invalidations += other.invalidations;
        self.flushes += other.flushes;
        self.bus_bytes += other.bus_bytes;
        self.transitions += other.transitions;
    }
}

/// Global bus counters.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bus {
    /// Total bytes moved across the bus.
    pub bytes: u64,
    /// Transactions answered by a peer cache with data.
    pub flushes: u64,
    /// Transactions processed so far.
    pub transactions: u64,
    pub commands: HashMap<Command, u64>,
}

impl Bus {
    pub fn record(&mut self, cmd: Command) {
        *self.commands.entry(cmd).or_insert(0) += 1;
        self.transactions += 1;
    }

    /// Times `cmd` was processed.
    #[must_use]
    pub fn count(&self, cmd: Command) -> u64 {
        self.commands.get(&cmd).copied().unwrap_or(0)
    }

    /// (command, count) pairs for every command, in declaration order.
    pub fn command_counts(&self) -> impl Iterator<Item = (Command, u64)> + '_ {
        Command::iter().map(|cmd| (cmd, self.count(cmd)))
    }
}

/// Everything the simulator reports at the end of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub caches: Vec<Cache>,
    pub bus: Bus,
}

impl Stats {
    /// Sum of per-PE cache counters.
    #[must_use]
    pub fn total_cache(&self) -> Cache {
        let mut total = Cache::default();
        for per_pe in &self.caches {
            total += per_pe.clone();
        }
        total
    }
}
