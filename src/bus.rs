use crate::cache::Cache;
use crate::config::MachineConfig;
use crate::fifo::Fifo;
use crate::{address, pe_id, stats};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Coherence transaction kinds on the broadcast bus.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::EnumIter,
)]
pub enum Command {
    None,
    /// Shareable read; data may come from memory or a peer.
    BusRd,
    /// Read with intent to modify; invalidates peers.
    BusRdX,
    /// Upgrade to M from S/E without re-reading data.
    BusUpgr,
    /// Intervention response carrying data.
    Flush,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::None => "None",
            Command::BusRd => "BusRd",
            Command::BusRdX => "BusRdX",
            Command::BusUpgr => "BusUpgr",
            Command::Flush => "Flush",
        };
        write!(f, "{name}")
    }
}

/// One pending coherence transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cmd: Command,
    pub source: pe_id,
    /// Line-aligned address.
    pub addr: address,
    /// Bytes moved when no peer intervenes.
    pub size: usize,
    /// Monotonic transaction id, assigned at enqueue.
    pub tid: u64,
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tid={} src=PE{} cmd={} addr={:#x} size={}",
            self.tid, self.source, self.cmd, self.addr, self.size
        )
    }
}

/// Shared submission side of the bus.
///
/// Caches hold a handle to the queue and publish requests from the PE phase;
/// the bus drains it during the bus phase. Both sides take the lock only
/// briefly.
#[derive(Debug, Default)]
pub struct Queue {
    pending: Mutex<Fifo<Request>>,
    next_tid: AtomicU64,
}

impl Queue {
    /// Enqueue a request, assigning it a fresh transaction id.
    pub fn submit(&self, cmd: Command, source: pe_id, addr: address, size: usize) -> u64 {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed) + 1;
        let req = Request {
            cmd,
            source,
            addr,
            size,
            tid,
        };
        log::debug!("[bus] submit {req}");
        self.pending.lock().unwrap().enqueue(req);
        tid
    }

    pub fn pop(&self) -> Option<Request> {
        self.pending.lock().unwrap().dequeue()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }

    /// Transaction ids handed out so far.
    #[must_use]
    pub fn transactions(&self) -> u64 {
        self.next_tid.load(Ordering::Relaxed)
    }
}

/// One fully processed transaction, as logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub tid: u64,
    pub source: pe_id,
    pub cmd: Command,
    pub addr: address,
    /// PEs whose caches acted on the snoop, in owner order.
    pub snoopers: Vec<pe_id>,
    /// Which snooper provided data, if any.
    pub provider: Option<pe_id>,
    /// Bytes this transaction added to the bus total.
    pub bytes: u64,
    pub total_bytes: u64,
    pub total_flushes: u64,
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tid={} src=PE{} cmd={} addr={:#x} snoopers=[{}] bytes={} total_bytes={} flushes={}",
            self.tid,
            self.source,
            self.cmd,
            self.addr,
            self.snoopers.iter().map(|pe| format!("PE{pe}")).join(","),
            self.bytes,
            self.total_bytes,
            self.total_flushes,
        )
    }
}

/// Snooping broadcast bus.
///
/// Drains up to `ops_per_tick` requests per `step` in FIFO order. Every
/// dequeued request is broadcast to all non-source caches before the next
/// one is looked at, so coherence transactions are fully serialized.
#[derive(Debug)]
pub struct Bus {
    queue: Arc<Queue>,
    caches: Vec<Arc<Mutex<Cache>>>,
    ops_per_tick: usize,
    line_bytes: usize,
    stats: stats::Bus,
    journal: Vec<Record>,
}

impl Bus {
    #[must_use]
    pub fn new(config: &MachineConfig, queue: Arc<Queue>) -> Self {
        Self {
            queue,
            caches: Vec::new(),
            ops_per_tick: config.bus_ops_per_tick,
            line_bytes: config.line_bytes,
            stats: stats::Bus::default(),
            journal: Vec::new(),
        }
    }

    /// Register the snooping caches. The bus does not own them; the
    /// orchestrator does. Handles must arrive in owner order.
    pub fn register_caches(&mut self, caches: Vec<Arc<Mutex<Cache>>>) {
        for (idx, cache) in caches.iter().enumerate() {
            debug_assert_eq!(cache.lock().unwrap().owner(), idx);
        }
        self.caches = caches;
    }

    /// Process up to `ops_per_tick` pending requests.
    pub fn step(&mut self) {
        for _ in 0..self.ops_per_tick {
            let Some(req) = self.queue.pop() else {
                log::trace!("[bus] step: queue empty");
                break;
            };
            self.broadcast(&req);
        }
    }

    fn broadcast(&mut self, req: &Request) {
        self.stats.record(req.cmd);

        let mut snoopers = Vec::new();
        let mut provider = None;
        for handle in &self.caches {
            let mut cache = handle.lock().unwrap();
            if cache.owner() == req.source {
                continue;
            }
            let reply = cache.snoop(req);
            if reply.acted() {
                snoopers.push(cache.owner());
            }
            // first data reply wins; later ones would violate single-writer
            if reply.has_data() && provider.is_none() {
                provider = Some(cache.owner());
            }
        }

        let bytes = match provider {
            Some(pe) => {
                self.stats.flushes += 1;
                self.account(pe, self.line_bytes as u64);
                self.account(req.source, self.line_bytes as u64);
                self.line_bytes as u64
            }
            None => {
                self.account(req.source, req.size as u64);
                req.size as u64
            }
        };
        self.stats.bytes += bytes;

        let record = Record {
            tid: req.tid,
            source: req.source,
            cmd: req.cmd,
            addr: req.addr,
            snoopers,
            provider,
            bytes,
            total_bytes: self.stats.bytes,
            total_flushes: self.stats.flushes,
        };
        log::info!("[bus] {record}");
        self.journal.push(record);
    }

    fn account(&self, pe: pe_id, bytes: u64) {
        self.caches[pe].lock().unwrap().account_bus_bytes(bytes);
    }

    #[must_use]
    pub fn stats(&self) -> &stats::Bus {
        &self.stats
    }

    /// Total bytes moved across the bus.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.stats.bytes
    }

    /// Times `cmd` was processed.
    #[must_use]
    pub fn count(&self, cmd: Command) -> u64 {
        self.stats.count(cmd)
    }

    /// Transactions answered with data by a peer.
    #[must_use]
    pub fn flushes(&self) -> u64 {
        self.stats.flushes
    }

    /// All processed transactions, in processing order.
    #[must_use]
    pub fn journal(&self) -> &[Record] {
        &self.journal
    }
}
