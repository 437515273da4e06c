//! Node abstraction.
//!
//! A node is an endpoint producing and/or consuming samples through an opaque
//! transport. The shared `Node` wrapper owns the per-direction signal lists
//! and hook chains, synthesizes missing sequence numbers and receive
//! timestamps, and drives the transport through its lifecycle.

pub mod generator;
pub mod loopback;
pub mod socket;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::hook::{self, HookContext, HookList, StatsReadHook, StatsWriteHook};
use crate::pool::MemoryType;
use crate::sample::{flags, SampleRef};
use crate::signal::{signal_list_default, signal_list_from_spec, SignalList};
use crate::state::{AtomicState, State};
use crate::stats::{Stats, DEFAULT_BUCKETS, DEFAULT_WARMUP};
use crate::timing::Timestamp;

pub use generator::GeneratorNode;
pub use loopback::LoopbackNode;
pub use socket::SocketNode;

pub mod node_flags {
    /// The node generates its own signal list instead of parsing one.
    pub const PROVIDES_SIGNALS: u32 = 1 << 0;
}

/// Result of one transport read.
#[derive(Debug, Clone, Copy)]
pub struct ReadResult {
    /// Samples filled into the batch.
    pub count: usize,
    /// How many of them the caller may recycle; transports that keep
    /// trailing state release fewer.
    pub release: usize,
}

impl ReadResult {
    pub fn all(count: usize) -> Self {
        ReadResult {
            count,
            release: count,
        }
    }
}

/// Transport operations of one node type.
pub trait NodeKind: Send + Sync {
    /// Parse the type-specific part of the node configuration.
    fn parse(&mut self, cfg: &serde_json::Map<String, serde_json::Value>) -> Result<()>;

    fn check(&self) -> Result<()> {
        Ok(())
    }

    /// Finalize with the resolved signal lists; allocate transport pools and
    /// codecs here.
    fn prepare(&mut self, _in_signals: &SignalList, _out_signals: &SignalList) -> Result<()> {
        Ok(())
    }

    /// Signal list generated by the node itself; only for types carrying
    /// [`node_flags::PROVIDES_SIGNALS`].
    fn provided_signals(&self) -> Option<SignalList> {
        None
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn pause(&self) {}

    fn resume(&self) {}

    /// Fill up to `smps.len()` fresh samples. A count of zero is a spurious
    /// wakeup or timeout; an error is fatal for the reading path.
    fn read(&self, smps: &mut [SampleRef]) -> Result<ReadResult>;

    /// Write samples in order; returns the accepted prefix length.
    fn write(&self, smps: &[SampleRef]) -> Result<usize>;

    /// Swap input and output roles, when the transport supports it.
    fn reverse(&mut self) -> Result<()> {
        Err(Error::validation("node type cannot be reversed"))
    }

    /// Descriptor usable with poll, when the transport has one.
    fn poll_fd(&self) -> Option<i32> {
        None
    }

    /// Preferred backing memory for pools feeding this node.
    fn memory_type(&self) -> MemoryType {
        MemoryType::Heap
    }

    /// One-line settings summary for logs.
    fn print(&self) -> String;
}

pub struct NodeTypeInfo {
    pub name: &'static str,
    pub description: &'static str,
    /// Largest batch the transport accepts per call; 0 = unbounded.
    pub vectorize: usize,
    pub flags: u32,
    pub make: fn() -> Box<dyn NodeKind>,
}

/// Compile-time node type registry.
pub static NODE_TYPES: &[NodeTypeInfo] = &[
    NodeTypeInfo {
        name: "loopback",
        description: "Loop samples back through an internal queue",
        vectorize: 0,
        flags: 0,
        make: || Box::new(LoopbackNode::new()),
    },
    NodeTypeInfo {
        name: "socket",
        description: "UDP socket with a pluggable payload format",
        vectorize: 0,
        flags: 0,
        make: || Box::new(SocketNode::new()),
    },
    NodeTypeInfo {
        name: "signal",
        description: "Waveform generator",
        vectorize: 1,
        flags: node_flags::PROVIDES_SIGNALS,
        make: || Box::new(GeneratorNode::new()),
    },
];

pub fn lookup(name: &str) -> Option<&'static NodeTypeInfo> {
    NODE_TYPES.iter().find(|t| t.name == name)
}

/// Per-direction state: signal list, hook chain and batching settings.
pub struct NodeDirection {
    pub signals: SignalList,
    pub hooks: HookList,
    pub vectorize: usize,
    pub builtin: bool,
    pub enabled: bool,
}

impl NodeDirection {
    fn new() -> Self {
        NodeDirection {
            signals: signal_list_default(),
            hooks: HookList::new(),
            vectorize: 1,
            builtin: true,
            enabled: true,
        }
    }
}

pub struct Node {
    name: String,
    type_info: &'static NodeTypeInfo,
    state: AtomicState,
    kind: Box<dyn NodeKind>,
    input: Mutex<NodeDirection>,
    output: Mutex<NodeDirection>,
    /// Input signal list after the read hook chain; what paths consume.
    resolved_signals: Mutex<Option<SignalList>>,
    stats: Arc<Stats>,
    restarts: Arc<AtomicU64>,
    /// Counter for synthesized sequence numbers.
    seq: AtomicU64,
}

impl Node {
    /// Build and parse a node from its configuration entry.
    pub fn from_config(name: &str, cfg: &NodeConfig) -> Result<Node> {
        let type_info = lookup(&cfg.kind)
            .ok_or_else(|| Error::config(format!("unknown node type '{}'", cfg.kind)))?;

        let mut kind = (type_info.make)();
        kind.parse(&cfg.extra)
            .map_err(|e| Error::config(format!("node '{}': {}", name, e)))?;

        let provides = type_info.flags & node_flags::PROVIDES_SIGNALS != 0;

        let mut input = NodeDirection::new();
        input.vectorize = cfg.input.vectorize;
        input.builtin = cfg.input.builtin;
        input.enabled = cfg.input.enabled;
        match &cfg.input.signals {
            Some(_) if provides => {
                return Err(Error::validation(format!(
                    "node '{}' generates its own signals and does not accept a signal definition",
                    name
                )));
            }
            Some(spec) => input.signals = signal_list_from_spec(spec)?,
            None => {}
        }

        let mut output = NodeDirection::new();
        output.vectorize = cfg.output.vectorize;
        output.builtin = cfg.output.builtin;
        output.enabled = cfg.output.enabled;
        let output_spec_given = cfg.output.signals.is_some();
        if let Some(spec) = &cfg.output.signals {
            output.signals = signal_list_from_spec(spec)?;
        }

        let stats = Arc::new(Stats::new(DEFAULT_BUCKETS, DEFAULT_WARMUP));
        let restarts = Arc::new(AtomicU64::new(0));
        let ctx = HookContext {
            stats: Some(Arc::clone(&stats)),
            restarts: Some(Arc::clone(&restarts)),
        };

        input
            .hooks
            .parse(&cfg.input.hooks, hook::context::NODE_READ, &ctx)?;
        output
            .hooks
            .parse(&cfg.output.hooks, hook::context::NODE_WRITE, &ctx)?;

        let node = Node {
            name: name.to_string(),
            type_info,
            state: AtomicState::new(State::Parsed),
            kind,
            input: Mutex::new(input),
            output: Mutex::new(output),
            resolved_signals: Mutex::new(None),
            stats,
            restarts,
            seq: AtomicU64::new(0),
        };

        // Mirror the input signal list on the output side unless configured
        // explicitly; loopback-style nodes echo what they receive.
        if !output_spec_given && !provides {
            node.output.lock().signals = node.input.lock().signals.clone();
        }

        Ok(node)
    }

    pub fn check(&self) -> Result<()> {
        self.state.load().expect(State::Parsed);

        let input = self.input.lock();
        if input.vectorize == 0 {
            return Err(Error::validation(format!(
                "node '{}': 'vectorize' must be a natural number",
                self.name
            )));
        }
        if self.type_info.vectorize != 0 && input.vectorize > self.type_info.vectorize {
            return Err(Error::validation(format!(
                "node '{}': node type limits 'vectorize' to {}",
                self.name, self.type_info.vectorize
            )));
        }
        drop(input);

        self.kind.check()?;
        self.state.store(State::Checked);
        Ok(())
    }

    /// Resolve signal lists, wire stats hooks and prepare both hook chains.
    /// `stats_enabled` attaches the shared read/write stats pair.
    pub fn prepare(&mut self, stats_enabled: bool) -> Result<()> {
        self.state.load().expect(State::Checked);

        if let Some(provided) = self.kind.provided_signals() {
            let mut input = self.input.lock();
            input.signals = provided.clone();
            let mut output = self.output.lock();
            output.signals = provided;
        }

        let (in_base, out_base) = {
            (
                self.input.lock().signals.clone(),
                self.output.lock().signals.clone(),
            )
        };
        self.kind.prepare(&in_base, &out_base)?;

        let ctx = HookContext {
            stats: Some(Arc::clone(&self.stats)),
            restarts: Some(Arc::clone(&self.restarts)),
        };

        let mut input = self.input.lock();
        if stats_enabled {
            input
                .hooks
                .push(Box::new(StatsReadHook::new(Arc::clone(&self.stats))));
        }
        let builtin_mask = if input.builtin {
            hook::context::NODE_READ
        } else {
            0
        };
        let resolved = input.hooks.prepare(in_base, builtin_mask, &ctx)?;
        drop(input);
        *self.resolved_signals.lock() = Some(resolved);

        let mut output = self.output.lock();
        if stats_enabled {
            output
                .hooks
                .push(Box::new(StatsWriteHook::new(Arc::clone(&self.stats))));
        }
        let builtin_mask = if output.builtin {
            hook::context::NODE_WRITE
        } else {
            0
        };
        output.hooks.prepare(out_base, builtin_mask, &ctx)?;
        drop(output);

        self.state.store(State::Prepared);
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        self.state.load().expect(State::Prepared);
        self.kind.start()?;
        self.input.lock().hooks.start();
        self.output.lock().hooks.start();
        self.state.store(State::Started);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        // Any actor may have requested Stopping already.
        let s = self.state.load();
        if s != State::Started && s != State::Stopping && s != State::Paused {
            s.expect(State::Started);
        }
        self.input.lock().hooks.stop();
        self.output.lock().hooks.stop();
        self.kind.stop()?;
        self.state.store(State::Stopped);
        Ok(())
    }

    pub fn pause(&self) {
        self.state.advance(State::Started, State::Paused);
        self.kind.pause();
    }

    pub fn resume(&self) {
        self.state.advance(State::Paused, State::Started);
        self.kind.resume();
    }

    /// Request a stop from any thread; the owning thread completes it.
    pub fn request_stop(&self) {
        self.state.compare_exchange(State::Started, State::Stopping);
    }

    /// Read a batch: transport read, header synthesis, read hook chain.
    /// The batch is compacted to the samples surviving the hooks.
    pub fn read(&self, batch: &mut Vec<SampleRef>) -> Result<usize> {
        let r = self.kind.read(batch.as_mut_slice())?;
        batch.truncate(r.count);
        if batch.is_empty() {
            return Ok(0);
        }

        let now = Timestamp::now();
        for smp in batch.iter_mut() {
            let s = smp.as_mut();
            if s.flags & flags::HAS_SEQUENCE == 0 {
                s.sequence = self.seq.fetch_add(1, Ordering::Relaxed);
                s.flags |= flags::HAS_SEQUENCE;
            }
            if s.flags & flags::HAS_TS_RECEIVED == 0 {
                s.ts_received = now;
                s.flags |= flags::HAS_TS_RECEIVED;
            }
        }

        self.input.lock().hooks.process(batch)
    }

    /// Write a batch: write hook chain, then the transport. Returns the
    /// accepted ordered prefix; the caller drops the rest as overrun.
    pub fn write(&self, batch: &mut Vec<SampleRef>) -> Result<usize> {
        self.output.lock().hooks.process(batch)?;
        if batch.is_empty() {
            return Ok(0);
        }
        self.kind.write(batch.as_slice())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_info.name
    }

    pub fn state(&self) -> State {
        self.state.load()
    }

    /// Input signal list after the read hook chain; the list paths consume.
    pub fn signals(&self) -> SignalList {
        self.resolved_signals
            .lock()
            .clone()
            .unwrap_or_else(|| self.input.lock().signals.clone())
    }

    pub fn output_signals(&self) -> SignalList {
        self.output.lock().signals.clone()
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn vectorize(&self) -> usize {
        self.input.lock().vectorize
    }

    pub fn input_enabled(&self) -> bool {
        self.input.lock().enabled
    }

    pub fn output_enabled(&self) -> bool {
        self.output.lock().enabled
    }

    pub fn poll_fd(&self) -> Option<i32> {
        self.kind.poll_fd()
    }

    pub fn memory_type(&self) -> MemoryType {
        self.kind.memory_type()
    }

    /// `name(type): settings` line for logs.
    pub fn print(&self) -> String {
        format!("{}({}): {}", self.name, self.type_info.name, self.kind.print())
    }

    /// Run the periodic tick of both hook chains.
    pub fn periodic(&self) {
        self.input.lock().hooks.periodic();
        self.output.lock().hooks.periodic();
    }
}
