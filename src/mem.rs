use crate::config::WORD_BYTES;
use crate::{address, word};
use std::sync::Mutex;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("misaligned {size}-byte access at {addr:#x}")]
    Misaligned { addr: address, size: usize },
    #[error("address {addr:#x} past end of memory ({len} words)")]
    OutOfRange { addr: address, len: usize },
}

#[derive(Debug, Default)]
struct Inner {
    words: Vec<word>,
    oob_reads: u64,
    oob_writes: u64,
    rejected: u64,
}

/// Flat main memory of 64-bit words behind a single lock.
///
/// Bus serialization already prevents contention in practice, so one
/// memory-wide mutex is sufficient. No latency is modeled.
///
/// Accesses must be word aligned. Out-of-range reads return zero and
/// out-of-range writes are dropped; both are counted. The checked
/// `try_read`/`try_write` variants surface both failure kinds instead and
/// are what the workload loader and tests use.
#[derive(Debug)]
pub struct MainMemory {
    inner: Mutex<Inner>,
}

impl MainMemory {
    #[must_use]
    pub fn new(num_words: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                words: vec![0; num_words],
                ..Inner::default()
            }),
        }
    }

    /// Read the aligned word at `addr`. Out of range reads as zero.
    pub fn read_word(&self, addr: address) -> word {
        let mut inner = self.inner.lock().unwrap();
        if addr % WORD_BYTES as address != 0 {
            debug_assert!(false, "misaligned read at {addr:#x}");
            inner.rejected += 1;
            return 0;
        }
        let idx = (addr / WORD_BYTES as address) as usize;
        match inner.words.get(idx) {
            Some(w) => *w,
            None => {
                inner.oob_reads += 1;
                0
            }
        }
    }

    /// Write the aligned word at `addr`. Out of range writes are dropped.
    pub fn write_word(&self, addr: address, value: word) {
        let mut inner = self.inner.lock().unwrap();
        if addr % WORD_BYTES as address != 0 {
            debug_assert!(false, "misaligned write at {addr:#x}");
            inner.rejected += 1;
            return;
        }
        let idx = (addr / WORD_BYTES as address) as usize;
        if let Some(w) = inner.words.get_mut(idx) {
            *w = value;
        } else {
            inner.oob_writes += 1;
        }
    }

    pub fn try_read(&self, addr: address) -> Result<word, Error> {
        let inner = self.inner.lock().unwrap();
        if addr % WORD_BYTES as address != 0 {
            return Err(Error::Misaligned {
                addr,
                size: WORD_BYTES,
            });
        }
        let idx = (addr / WORD_BYTES as address) as usize;
        inner.words.get(idx).copied().ok_or(Error::OutOfRange {
            addr,
            len: inner.words.len(),
        })
    }

    pub fn try_write(&self, addr: address, value: word) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if addr % WORD_BYTES as address != 0 {
            return Err(Error::Misaligned {
                addr,
                size: WORD_BYTES,
            });
        }
        let idx = (addr / WORD_BYTES as address) as usize;
        let len = inner.words.len();
        match inner.words.get_mut(idx) {
            Some(w) => {
                *w = value;
                Ok(())
            }
            None => Err(Error::OutOfRange { addr, len }),
        }
    }

    /// Capacity in words.
    #[must_use]
    pub fn num_words(&self) -> usize {
        self.inner.lock().unwrap().words.len()
    }

    /// Out-of-range accesses observed so far (reads, writes).
    #[must_use]
    pub fn oob_accesses(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.oob_reads, inner.oob_writes)
    }
}
