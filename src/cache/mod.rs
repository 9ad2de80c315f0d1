pub mod line;

pub use line::{Line, State};

use crate::bus::{self, Command};
use crate::config::{MachineConfig, WORD_BYTES};
use crate::mem::MainMemory;
use crate::{address, pe_id, stats, word};
use itertools::Itertools;
use std::fmt::Write as _;
use std::sync::Arc;

/// Outcome of a local load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Hit,
    Miss,
}

impl AccessStatus {
    #[must_use]
    pub fn is_hit(self) -> bool {
        self == AccessStatus::Hit
    }
}

/// What a cache did in reaction to a snooped bus request.
///
/// `ActedWithData` carries the full line and marks this cache as the
/// provider of the transaction; the line has already been written back to
/// memory, so the requester's subsequent memory read returns coherent data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnoopReply {
    NotPresent,
    Acted,
    ActedWithData(Box<[u8]>),
}

impl SnoopReply {
    #[must_use]
    pub fn acted(&self) -> bool {
        !matches!(self, SnoopReply::NotPresent)
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        matches!(self, SnoopReply::ActedWithData(_))
    }
}

#[derive(Debug, Clone)]
struct Set {
    ways: Vec<Line>,
}

/// Private set-associative write-through cache with MESI coherence.
///
/// Policies:
/// - Load miss: write-allocate, whole line filled over `BusRd`. The fill
///   state is conservatively `S` (the broadcast may have been serviced by a
///   peer, and the bus does not report sharers back).
/// - Store hit in `S`: `BusUpgr` then `M`. Store hit in `E`: silent `E -> M`,
///   no bus traffic. Store hit in `M`: local write.
/// - Store miss: write-allocate over `BusRdX`, line ends `M`.
/// - Every store writes through to memory, so lines stay clean.
///
/// `load`/`store` are invoked only by the owning PE; `snoop` only by the
/// bus. The two never overlap because the PE and bus phases of a tick are
/// separated by the orchestrator barrier.
#[derive(Debug)]
pub struct Cache {
    owner: pe_id,
    mem: Arc<MainMemory>,
    queue: Arc<bus::Queue>,
    stats: stats::Cache,

    num_sets: usize,
    line_bytes: usize,

    sets: Vec<Set>,
}

impl Cache {
    #[must_use]
    pub fn new(
        owner: pe_id,
        config: &MachineConfig,
        mem: Arc<MainMemory>,
        queue: Arc<bus::Queue>,
    ) -> Self {
        let num_sets = config.num_sets();
        let sets = (0..num_sets)
            .map(|_| Set {
                ways: (0..config.cache_ways)
                    .map(|_| Line::new(config.line_bytes))
                    .collect(),
            })
            .collect();
        Self {
            owner,
            mem,
            queue,
            stats: stats::Cache::default(),
            num_sets,
            line_bytes: config.line_bytes,
            sets,
        }
    }

    #[must_use]
    pub fn owner(&self) -> pe_id {
        self.owner
    }

    #[must_use]
    pub fn stats(&self) -> &stats::Cache {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Bus-attributed traffic lands here.
    pub fn account_bus_bytes(&mut self, bytes: u64) {
        self.stats.bus_bytes += bytes;
    }

    fn index_tag(&self, addr: address) -> (usize, u64) {
        let line_idx = addr / self.line_bytes as address;
        let set_idx = (line_idx % self.num_sets as address) as usize;
        let tag = line_idx / self.num_sets as address;
        (set_idx, tag)
    }

    fn line_base(&self, addr: address) -> address {
        addr - (addr % self.line_bytes as address)
    }

    fn line_offset(&self, addr: address) -> usize {
        (addr % self.line_bytes as address) as usize
    }

    /// Base address of the line currently held in (`set_idx`, `way`).
    fn held_line_base(&self, set_idx: usize, way: usize) -> address {
        let tag = self.sets[set_idx].ways[way].tag;
        (tag * self.num_sets as address + set_idx as address) * self.line_bytes as address
    }

    fn find_way(&self, set_idx: usize, tag: u64) -> Option<usize> {
        let set = &self.sets[set_idx];
        let hit = set
            .ways
            .iter()
            .position(|line| line.valid && line.tag == tag);
        debug_assert!(
            set.ways
                .iter()
                .filter(|line| line.valid && line.tag == tag)
                .count()
                <= 1,
            "duplicate tag {tag:#x} in set {set_idx}"
        );
        hit
    }

    /// First invalid way, otherwise way 0 (simple FIFO-style policy).
    fn select_victim(&self, set_idx: usize) -> usize {
        self.sets[set_idx]
            .ways
            .iter()
            .position(|line| !line.valid)
            .unwrap_or(0)
    }

    fn fill_from_memory(&mut self, set_idx: usize, way: usize, base: address) {
        for k in 0..self.line_bytes / WORD_BYTES {
            let w = self.mem.read_word(base + (k * WORD_BYTES) as address);
            self.sets[set_idx].ways[way].write(k * WORD_BYTES, WORD_BYTES, w);
        }
    }

    fn write_back_line(&mut self, set_idx: usize, way: usize, base: address) {
        for k in 0..self.line_bytes / WORD_BYTES {
            let w = self.sets[set_idx].ways[way].read(k * WORD_BYTES, WORD_BYTES);
            self.mem.write_word(base + (k * WORD_BYTES) as address, w);
        }
    }

    /// Evict the victim way, writing it back first if it is dirty.
    ///
    /// With write-through the dirty branch is a no-op; it is kept so the
    /// protocol stays closed over a write-back extension.
    fn evict_victim(&mut self, set_idx: usize) -> usize {
        let way = self.select_victim(set_idx);
        let line = &self.sets[set_idx].ways[way];
        if line.valid && line.dirty {
            let base = self.held_line_base(set_idx, way);
            self.write_back_line(set_idx, way, base);
            self.sets[set_idx].ways[way].dirty = false;
            log::debug!(
                "[cache {}] write-back on eviction, line {base:#x}",
                self.owner
            );
        }
        way
    }

    /// Local load of `size` bytes at `addr`. Returns hit/miss and the word.
    pub fn load(&mut self, addr: address, size: usize) -> (AccessStatus, word) {
        let (set_idx, tag) = self.index_tag(addr);
        let offset = self.line_offset(addr);
        debug_assert!(offset + size <= self.line_bytes, "access crosses a line");

        if let Some(way) = self.find_way(set_idx, tag) {
            let line = &self.sets[set_idx].ways[way];
            debug_assert!(line.state.is_valid());
            let value = line.read(offset, size);
            log::trace!(
                "[cache {}] load hit {addr:#x} set={set_idx} way={way} state={}",
                self.owner,
                line.state
            );
            self.stats.hits += 1;
            self.stats.loads += 1;
            return (AccessStatus::Hit, value);
        }
        (AccessStatus::Miss, self.load_miss(addr, size))
    }

    /// Load miss: write-allocate. Publishes `BusRd`, fills the whole line
    /// from memory and installs it in `S`.
    fn load_miss(&mut self, addr: address, size: usize) -> word {
        let (set_idx, tag) = self.index_tag(addr);
        let way = self.evict_victim(set_idx);
        let base = self.line_base(addr);

        log::trace!("[cache {}] load miss {addr:#x} -> BusRd", self.owner);
        self.queue
            .submit(Command::BusRd, self.owner, base, self.line_bytes);

        self.fill_from_memory(set_idx, way, base);
        let offset = self.line_offset(addr);
        let line = &mut self.sets[set_idx].ways[way];
        line.valid = true;
        line.tag = tag;
        line.state = State::Shared;
        line.dirty = false;
        let value = line.read(offset, size);

        self.stats.misses += 1;
        self.stats.loads += 1;
        value
    }

    /// Local store of `size` bytes at `addr`. Returns hit/miss.
    pub fn store(&mut self, addr: address, size: usize, value: word) -> AccessStatus {
        let (set_idx, tag) = self.index_tag(addr);
        let offset = self.line_offset(addr);
        debug_assert!(offset + size <= self.line_bytes, "access crosses a line");

        if let Some(way) = self.find_way(set_idx, tag) {
            self.write_hit(set_idx, way, addr, size, value);
            return AccessStatus::Hit;
        }
        self.store_miss(addr, size, value);
        AccessStatus::Miss
    }

    fn write_hit(&mut self, set_idx: usize, way: usize, addr: address, size: usize, value: word) {
        let state = self.sets[set_idx].ways[way].state;
        debug_assert!(state.is_valid());
        match state {
            State::Shared => {
                log::trace!(
                    "[cache {}] write hit {addr:#x} needs BusUpgr (state=S)",
                    self.owner
                );
                let base = self.line_base(addr);
                self.queue
                    .submit(Command::BusUpgr, self.owner, base, self.line_bytes);
                self.stats.transitions.s_to_m += 1;
            }
            // Exclusive ownership: upgrade silently, no bus message.
            State::Exclusive => self.stats.transitions.e_to_m += 1,
            State::Modified => {}
            State::Invalid => unreachable!("write hit on invalid line"),
        }

        let offset = self.line_offset(addr);
        let line = &mut self.sets[set_idx].ways[way];
        line.state = State::Modified;
        line.write(offset, size, value);
        line.dirty = false;

        // write-through: memory stays current, line stays clean
        self.mem.write_word(addr, value);
        self.stats.hits += 1;
        self.stats.stores += 1;
        log::trace!(
            "[cache {}] write hit {addr:#x} set={set_idx} way={way} -> M",
            self.owner
        );
    }

    /// Store miss: write-allocate over `BusRdX`, then overwrite and write
    /// through. The line ends in `M` (clean).
    fn store_miss(&mut self, addr: address, size: usize, value: word) {
        let (set_idx, tag) = self.index_tag(addr);
        let way = self.evict_victim(set_idx);
        let base = self.line_base(addr);

        log::trace!("[cache {}] store miss {addr:#x} -> BusRdX", self.owner);
        self.queue
            .submit(Command::BusRdX, self.owner, base, self.line_bytes);

        self.fill_from_memory(set_idx, way, base);
        let offset = self.line_offset(addr);
        let line = &mut self.sets[set_idx].ways[way];
        line.valid = true;
        line.tag = tag;
        line.state = State::Modified;
        line.dirty = false;
        line.write(offset, size, value);

        self.mem.write_word(addr, value);
        self.stats.misses += 1;
        self.stats.stores += 1;
    }

    /// React to a peer's bus request.
    pub fn snoop(&mut self, req: &bus::Request) -> SnoopReply {
        debug_assert_ne!(req.source, self.owner, "bus must not self-snoop");
        if matches!(req.cmd, Command::Flush | Command::None) {
            return SnoopReply::NotPresent;
        }

        let (set_idx, tag) = self.index_tag(req.addr);
        let Some(way) = self.find_way(set_idx, tag) else {
            log::trace!(
                "[snoop {}] {} {:#x} -> not present",
                self.owner,
                req.cmd,
                req.addr
            );
            return SnoopReply::NotPresent;
        };

        let state = self.sets[set_idx].ways[way].state;
        assert!(state.is_valid(), "valid way must not hold state I");
        log::trace!(
            "[snoop {}] {} {:#x} state={state}",
            self.owner,
            req.cmd,
            req.addr
        );

        match req.cmd {
            Command::BusRd => match state {
                // Remain S; the requester learns nothing beyond "shared".
                State::Shared => SnoopReply::Acted,
                State::Exclusive => {
                    self.sets[set_idx].ways[way].state = State::Shared;
                    self.stats.transitions.e_to_s += 1;
                    SnoopReply::Acted
                }
                State::Modified => {
                    // Intervention: put the whole line into memory so the
                    // requester's fill reads coherent data.
                    let base = self.line_base(req.addr);
                    self.write_back_line(set_idx, way, base);
                    let line = &mut self.sets[set_idx].ways[way];
                    line.state = State::Shared;
                    line.dirty = false;
                    self.stats.flushes += 1;
                    self.stats.transitions.m_to_s += 1;
                    SnoopReply::ActedWithData(self.sets[set_idx].ways[way].bytes.clone())
                }
                State::Invalid => unreachable!(),
            },
            Command::BusRdX | Command::BusUpgr => {
                if state == State::Modified && self.sets[set_idx].ways[way].dirty {
                    let base = self.line_base(req.addr);
                    self.write_back_line(set_idx, way, base);
                    self.stats.flushes += 1;
                }
                self.sets[set_idx].ways[way].invalidate();
                self.stats.invalidations += 1;
                self.stats.transitions.x_to_i += 1;
                SnoopReply::Acted
            }
            Command::Flush | Command::None => unreachable!(),
        }
    }

    /// MESI state of the line holding `addr`, if present.
    #[must_use]
    pub fn state_of(&self, addr: address) -> Option<State> {
        let (set_idx, tag) = self.index_tag(addr);
        self.find_way(set_idx, tag)
            .map(|way| self.sets[set_idx].ways[way].state)
    }

    /// All valid lines with their base addresses, in set/way order.
    pub fn valid_lines(&self) -> impl Iterator<Item = (address, &Line)> + '_ {
        self.sets.iter().enumerate().flat_map(move |(set_idx, set)| {
            set.ways.iter().enumerate().filter_map(move |(way, line)| {
                line.valid.then(|| {
                    let base = (line.tag * self.num_sets as address + set_idx as address)
                        * self.line_bytes as address;
                    (base, line)
                })
            })
        })
    }

    #[must_use]
    pub fn num_valid_lines(&self) -> usize {
        self.valid_lines().count()
    }

    /// Readable dump of all sets and ways for the stepping UI.
    ///
    /// A line holding `highlight` is marked with `*`; `with_data` also
    /// prints the line's words as hex.
    #[must_use]
    pub fn dump(&self, highlight: Option<address>, with_data: bool) -> String {
        let mut out = String::new();
        for (set_idx, set) in self.sets.iter().enumerate() {
            for (way, line) in set.ways.iter().enumerate() {
                if !line.valid {
                    let _ = writeln!(out, "  set {set_idx} way {way}: -");
                    continue;
                }
                let base = (line.tag * self.num_sets as address + set_idx as address)
                    * self.line_bytes as address;
                let mark = match highlight {
                    Some(addr) if self.line_base(addr) == base => "*",
                    _ => " ",
                };
                let _ = write!(
                    out,
                    " {mark}set {set_idx} way {way}: {} tag={:#x} base={base:#x}",
                    line.state, line.tag
                );
                if with_data {
                    let mut words = (0..self.line_bytes / WORD_BYTES)
                        .map(|k| format!("{:#018x}", line.read(k * WORD_BYTES, WORD_BYTES)));
                    let _ = write!(out, " [{}]", words.join(" "));
                }
                let _ = writeln!(out);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Queue;

    fn harness() -> (Arc<MainMemory>, Arc<Queue>, Cache) {
        let config = MachineConfig::default();
        let mem = Arc::new(MainMemory::new(config.mem_words));
        let queue = Arc::new(Queue::default());
        let cache = Cache::new(0, &config, Arc::clone(&mem), Arc::clone(&queue));
        (mem, queue, cache)
    }

    #[test]
    fn store_then_load_round_trips() {
        let (_mem, _queue, mut cache) = harness();
        cache.store(0x40, 8, 0xfeed);
        let (status, value) = cache.load(0x40, 8);
        assert!(status.is_hit());
        assert_eq!(value, 0xfeed);
    }

    #[test]
    fn load_miss_fills_shared_and_counts_once() {
        let (mem, queue, mut cache) = harness();
        mem.write_word(0x100, 77);

        let (status, value) = cache.load(0x100, 8);
        assert_eq!(status, AccessStatus::Miss);
        assert_eq!(value, 77);
        assert_eq!(cache.state_of(0x100), Some(State::Shared));
        assert_eq!(queue.pop().map(|r| r.cmd), Some(Command::BusRd));

        // idempotent re-load: same value, no further misses
        let (status, value) = cache.load(0x100, 8);
        assert!(status.is_hit());
        assert_eq!(value, 77);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().loads, 2);
    }

    #[test]
    fn store_miss_goes_modified_and_writes_through() {
        let (mem, queue, mut cache) = harness();
        let status = cache.store(0x80, 8, 123);
        assert_eq!(status, AccessStatus::Miss);
        assert_eq!(cache.state_of(0x80), Some(State::Modified));
        assert_eq!(mem.read_word(0x80), 123);
        assert_eq!(queue.pop().map(|r| r.cmd), Some(Command::BusRdX));
        let line = cache.valid_lines().next().unwrap().1;
        assert!(!line.dirty);
    }

    #[test]
    fn shared_write_hit_emits_upgrade() {
        let (_mem, queue, mut cache) = harness();
        cache.load(0x40, 8);
        assert_eq!(queue.pop().map(|r| r.cmd), Some(Command::BusRd));

        cache.store(0x40, 8, 5);
        assert_eq!(cache.state_of(0x40), Some(State::Modified));
        assert_eq!(cache.stats().transitions.s_to_m, 1);
        let upgr = queue.pop().unwrap();
        assert_eq!(upgr.cmd, Command::BusUpgr);
        assert_eq!(upgr.addr, 0x40);
        assert_eq!(upgr.size, 32);
    }

    #[test]
    fn exclusive_write_hit_is_silent() {
        let (_mem, queue, mut cache) = harness();
        cache.load(0x40, 8);
        queue.pop();
        // force E to exercise the silent upgrade path
        let (set_idx, tag) = cache.index_tag(0x40);
        let way = cache.find_way(set_idx, tag).unwrap();
        cache.sets[set_idx].ways[way].state = State::Exclusive;

        cache.store(0x40, 8, 9);
        assert_eq!(cache.state_of(0x40), Some(State::Modified));
        assert_eq!(cache.stats().transitions.e_to_m, 1);
        assert!(queue.pop().is_none(), "E -> M must not touch the bus");
    }

    #[test]
    fn snoop_busrd_on_modified_flushes_whole_line() {
        let config = MachineConfig::default();
        let mem = Arc::new(MainMemory::new(config.mem_words));
        let queue = Arc::new(Queue::default());
        let mut cache = Cache::new(1, &config, Arc::clone(&mem), Arc::clone(&queue));

        cache.store(0x100, 8, 42);
        cache.store(0x108, 8, 43);
        let req = bus::Request {
            cmd: Command::BusRd,
            source: 0,
            addr: 0x100,
            size: 32,
            tid: 1,
        };
        let reply = cache.snoop(&req);
        assert!(reply.has_data());
        assert_eq!(cache.state_of(0x100), Some(State::Shared));
        assert_eq!(cache.stats().flushes, 1);
        assert_eq!(cache.stats().transitions.m_to_s, 1);
        // whole line landed in memory, not only the accessed word
        assert_eq!(mem.read_word(0x100), 42);
        assert_eq!(mem.read_word(0x108), 43);
    }

    #[test]
    fn snoop_upgrade_invalidates_shared_copy() {
        let (_mem, queue, mut cache) = harness();
        cache.load(0x40, 8);
        queue.pop();

        let req = bus::Request {
            cmd: Command::BusUpgr,
            source: 3,
            addr: 0x40,
            size: 32,
            tid: 1,
        };
        assert_eq!(cache.snoop(&req), SnoopReply::Acted);
        assert_eq!(cache.state_of(0x40), None);
        assert_eq!(cache.stats().invalidations, 1);
        assert_eq!(cache.stats().transitions.x_to_i, 1);
    }

    #[test]
    fn snoop_misses_absent_line() {
        let (_mem, _queue, mut cache) = harness();
        let req = bus::Request {
            cmd: Command::BusRdX,
            source: 2,
            addr: 0x200,
            size: 32,
            tid: 1,
        };
        assert_eq!(cache.snoop(&req), SnoopReply::NotPresent);
        assert_eq!(cache.stats().invalidations, 0);
    }

    #[test]
    fn conflicting_tags_evict_way_zero() {
        let (_mem, _queue, mut cache) = harness();
        // three distinct tags, all mapping to set 0 (num_sets=8, line=32B)
        let stride = 8 * 32; // one full wrap of the index bits
        cache.load(0, 8);
        cache.load(stride, 8);
        cache.load(2 * stride, 8);

        assert_eq!(cache.stats().misses, 3);
        assert_eq!(cache.num_valid_lines(), 2);
        // way 0 victimized: the first-filled tag is gone
        assert_eq!(cache.state_of(0), None);
        assert!(cache.state_of(stride).is_some());
        assert!(cache.state_of(2 * stride).is_some());
    }
}
