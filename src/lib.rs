#![allow(non_camel_case_types)]

pub mod asm;
pub mod barrier;
pub mod bus;
pub mod cache;
pub mod config;
pub mod core;
pub mod fifo;
pub mod isa;
pub mod mem;
pub mod sim;
pub mod stats;
pub mod stepping;

pub use cache::Cache;
pub use config::{DotConfig, MachineConfig};
pub use mem::MainMemory;
pub use sim::{Outcome, Simulator};

/// Byte address into main memory.
pub type address = u64;

/// 64-bit data word (reinterpreted as `f64` by the FP instructions).
pub type word = u64;

/// Processing element id, also the index of its private cache.
pub type pe_id = usize;
