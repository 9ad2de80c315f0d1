use crate::address;
use serde::{Deserialize, Serialize};

/// Size of one data word in bytes. The ISA only issues aligned 8-byte
/// accesses, so this is fixed rather than configurable.
pub const WORD_BYTES: usize = 8;

/// Geometry of the simulated machine.
///
/// The reference configuration is four PEs, 512 words of main memory and a
/// 2-way set-associative cache of 16 lines with 32-byte lines per PE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Number of processing elements (and private caches).
    pub num_pes: usize,
    /// Main memory capacity in 64-bit words.
    pub mem_words: usize,
    /// Cache associativity.
    pub cache_ways: usize,
    /// Total cache lines per private cache (across all sets).
    pub cache_lines: usize,
    /// Bytes per cache line.
    pub line_bytes: usize,
    /// Coherence transactions the bus drains per tick.
    pub bus_ops_per_tick: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            num_pes: 4,
            mem_words: 512,
            cache_ways: 2,
            cache_lines: 16,
            line_bytes: 32,
            bus_ops_per_tick: 1,
        }
    }
}

impl MachineConfig {
    #[must_use]
    pub fn num_sets(&self) -> usize {
        debug_assert_eq!(self.cache_lines % self.cache_ways, 0);
        self.cache_lines / self.cache_ways
    }

    /// Addressable bytes of main memory.
    #[must_use]
    pub fn mem_bytes(&self) -> address {
        (self.mem_words * WORD_BYTES) as address
    }
}

/// Memory layout and size of the partitioned dot-product workload.
///
/// A and B live at `base_a`/`base_b` with 8 bytes per element; each PE owns
/// one contiguous segment of `seg(..)` elements and one 8-byte partial-sum
/// slot at `base_ps + pe * 8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotConfig {
    /// Total vector length.
    pub n: usize,
    pub base_a: address,
    pub base_b: address,
    pub base_ps: address,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            n: 16,
            base_a: 0x000,
            base_b: 0x100,
            base_ps: 0x200,
        }
    }
}

impl DotConfig {
    /// Elements per PE segment.
    #[must_use]
    pub fn seg(&self, num_pes: usize) -> usize {
        self.n / num_pes
    }

    /// Address of element `i` of the A vector.
    #[must_use]
    pub fn a_elem(&self, i: usize) -> address {
        self.base_a + (i * WORD_BYTES) as address
    }

    /// Address of element `i` of the B vector.
    #[must_use]
    pub fn b_elem(&self, i: usize) -> address {
        self.base_b + (i * WORD_BYTES) as address
    }

    /// Address of PE `pe`'s partial-sum slot.
    #[must_use]
    pub fn ps_slot(&self, pe: usize) -> address {
        self.base_ps + (pe * WORD_BYTES) as address
    }
}
