//! Path engine.
//!
//! A path fans samples from one or more source nodes through a hook chain
//! into per-destination queues; destination threads drain those queues into
//! output nodes. Each source and each destination runs on its own thread,
//! wired together only through the destination rings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::config::{PathConfig, PathModeConfig};
use crate::error::{Error, Result};
use crate::hook::{self, HookContext, HookList};
use crate::mapping::{mapped_signals, MappingEntry, MappingKind, ResolvedMapping};
use crate::node::Node;
use crate::pool::Pool;
use crate::queue::{Closed, PushError};
use crate::queue_signalled::SignalledQueue;
use crate::sample::{flags, Sample, SampleRef};
use crate::signal::SignalList;
use crate::state::{AtomicState, State};

/// Trigger condition of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMode {
    /// Fire on every sample received from any source.
    Any,
    /// Fire once every source contributed at least one sample.
    All,
}

impl From<PathModeConfig> for PathMode {
    fn from(m: PathModeConfig) -> Self {
        match m {
            PathModeConfig::Any => PathMode::Any,
            PathModeConfig::All => PathMode::All,
        }
    }
}

/// Bound on the stop handshake; threads still running afterwards are logged
/// and detached.
const STOP_GRACE: Duration = Duration::from_secs(2);
/// Backoff when the read pool is starved.
const STARVE_BACKOFF: Duration = Duration::from_millis(1);
/// Enqueue overruns within one window that demote the path to Paused.
const OVERRUN_WINDOW: Duration = Duration::from_secs(1);
const OVERRUN_PAUSE_THRESHOLD: u64 = 10_000;
/// How long a demoted path stays paused before it resumes.
const PAUSE_BACKOFF: Duration = Duration::from_secs(1);

pub struct PathSource {
    node: Arc<Node>,
}

impl PathSource {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

pub struct PathDestination {
    node: Arc<Node>,
    queue: SignalledQueue<SampleRef>,
    enqueue_overruns: AtomicU64,
    write_overruns: AtomicU64,
}

impl PathDestination {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn enqueue_overruns(&self) -> u64 {
        self.enqueue_overruns.load(Ordering::Relaxed)
    }

    pub fn write_overruns(&self) -> u64 {
        self.write_overruns.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.queue.available()
    }
}

/// Everything resolved at prepare time; immutable while threads run.
struct PathRuntime {
    signals: SignalList,
    pool: Pool,
    read_pools: Vec<Pool>,
    resolved: Vec<Vec<ResolvedMapping>>,
    full_mask: u64,
    /// Single source, at most one destination, identity mapping: samples
    /// pass through without the merge copy.
    simple: bool,
}

struct TriggerState {
    received: u64,
    latest: Vec<Option<SampleRef>>,
}

struct PathInner {
    name: String,
    state: AtomicState,
    mode: PathMode,
    vectorize: usize,
    queuelen: usize,
    rate: f64,
    original_sequence_no: bool,
    builtin: bool,
    enabled: bool,

    sources: Vec<PathSource>,
    destinations: Vec<PathDestination>,
    /// Mapping entries in config order, each bound to its source index; the
    /// order defines the path signal layout.
    entry_order: Vec<(usize, MappingEntry)>,
    hooks: Mutex<HookList>,
    runtime: OnceLock<PathRuntime>,

    trigger: Mutex<TriggerState>,
    out_seq: AtomicU64,
    running: AtomicBool,

    received_total: AtomicU64,
    emitted_total: AtomicU64,
    missing_warnings: AtomicU64,
    overrun_window: Mutex<(Instant, u64)>,
    paused_at: Mutex<Option<Instant>>,
}

pub struct Path {
    inner: Arc<PathInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Path {
    /// Build a path from its configuration entry, resolving node names
    /// against the registry.
    pub fn from_config(cfg: &PathConfig, nodes: &HashMap<String, Arc<Node>>) -> Result<Path> {
        let input = cfg.input.clone().into_vec();
        if input.is_empty() {
            return Err(Error::validation("path needs at least one source"));
        }

        // Parse mapping entries and group them into one source per distinct
        // node, keeping the global entry order for signal layout.
        let mut sources: Vec<PathSource> = Vec::new();
        let mut entry_order: Vec<(usize, MappingEntry)> = Vec::new();
        for s in &input {
            let entry = MappingEntry::parse(s)?;
            let node = nodes
                .get(&entry.node)
                .ok_or_else(|| Error::validation(format!("unknown node '{}'", entry.node)))?;

            let idx = match sources.iter().position(|src| src.node.name() == entry.node) {
                Some(idx) => idx,
                None => {
                    if !node.input_enabled() {
                        return Err(Error::validation(format!(
                            "node '{}' has its input direction disabled",
                            entry.node
                        )));
                    }
                    sources.push(PathSource {
                        node: Arc::clone(node),
                    });
                    sources.len() - 1
                }
            };
            entry_order.push((idx, entry));
        }

        if sources.len() > 64 {
            return Err(Error::validation(
                "a path supports at most 64 distinct sources",
            ));
        }

        let mut destinations = Vec::new();
        for name in cfg.output.clone().into_vec() {
            let node = nodes
                .get(&name)
                .ok_or_else(|| Error::validation(format!("unknown node '{}'", name)))?;
            if !node.output_enabled() {
                warn!("skipping destination '{}': output direction disabled", name);
                continue;
            }
            destinations.push(PathDestination {
                node: Arc::clone(node),
                queue: SignalledQueue::new(cfg.queuelen),
                enqueue_overruns: AtomicU64::new(0),
                write_overruns: AtomicU64::new(0),
            });
        }

        let mut hooks = HookList::new();
        hooks.parse(&cfg.hooks, hook::context::PATH, &HookContext::default())?;

        let src_names: Vec<&str> = sources.iter().map(|s| s.node.name()).collect();
        let dst_names: Vec<&str> = destinations.iter().map(|d| d.node.name()).collect();
        let name = format!("{} => [ {} ]", src_names.join(", "), dst_names.join(" "));

        let n_sources = sources.len();
        let inner = PathInner {
            name,
            state: AtomicState::new(State::Parsed),
            mode: cfg.mode.into(),
            vectorize: cfg.vectorize.max(1),
            queuelen: cfg.queuelen.max(2),
            rate: cfg.rate,
            original_sequence_no: cfg.original_sequence_no,
            builtin: cfg.builtin,
            enabled: cfg.enabled,
            sources,
            destinations,
            entry_order,
            hooks: Mutex::new(hooks),
            runtime: OnceLock::new(),
            trigger: Mutex::new(TriggerState {
                received: 0,
                latest: (0..n_sources).map(|_| None).collect(),
            }),
            out_seq: AtomicU64::new(0),
            running: AtomicBool::new(false),
            received_total: AtomicU64::new(0),
            emitted_total: AtomicU64::new(0),
            missing_warnings: AtomicU64::new(0),
            overrun_window: Mutex::new((Instant::now(), 0)),
            paused_at: Mutex::new(None),
        };

        Ok(Path {
            inner: Arc::new(inner),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn check(&self) -> Result<()> {
        self.inner.state.load().expect(State::Parsed);

        if self.inner.rate < 0.0 {
            return Err(Error::validation("path 'rate' must not be negative"));
        }

        self.inner.state.store(State::Checked);
        Ok(())
    }

    /// Resolve mappings against the prepared source nodes, build the path
    /// signal list, prepare hooks and allocate pools. `memory` is the
    /// default pool backing (hugepages when reserved); nodes preferring a
    /// specific memory type keep their preference.
    pub fn prepare(&self, memory: crate::pool::MemoryType) -> Result<()> {
        let inner = &self.inner;
        inner.state.load().expect(State::Checked);

        // Walk entries in config order; each claims the next span of the
        // path signal vector.
        let mut signals: Vec<Arc<crate::signal::Signal>> = Vec::new();
        let mut resolved: Vec<Vec<ResolvedMapping>> =
            (0..inner.sources.len()).map(|_| Vec::new()).collect();

        for (si, entry) in &inner.entry_order {
            let node_signals = inner.sources[*si].node.signals();
            let contributed = mapped_signals(entry, &node_signals);
            let length = contributed.len();
            let target_offset = signals.len();
            signals.extend(contributed);

            resolved[*si].push(ResolvedMapping {
                kind: entry.kind.clone(),
                source_index: *si,
                target_offset,
                length,
            });
        }

        let simple = inner.sources.len() == 1
            && inner.destinations.len() <= 1
            && inner.entry_order.len() == 1
            && inner.entry_order[0].1.kind == MappingKind::FullData;

        let signals: SignalList = Arc::new(signals);

        let hook_input = if simple {
            inner.sources[0].node.signals()
        } else {
            signals.clone()
        };
        let builtin_mask = if inner.builtin { hook::context::PATH } else { 0 };
        let out_signals =
            inner
                .hooks
                .lock()
                .prepare(hook_input, builtin_mask, &HookContext::default())?;

        let n_dest = inner.destinations.len().max(1);
        let pool = Pool::new(
            inner.queuelen * n_dest + inner.vectorize * 2 + 32,
            signals.len().max(1),
            memory,
        )?;

        let mut read_pools = Vec::new();
        for source in &inner.sources {
            let capacity = source.node.signals().len().max(1);
            let node_memory = match source.node.memory_type() {
                crate::pool::MemoryType::Heap => memory,
                preferred => preferred,
            };
            read_pools.push(Pool::new(
                inner.queuelen + inner.vectorize * 2 + 32,
                capacity,
                node_memory,
            )?);
        }

        if inner.rate > 0.0 && simple {
            warn!(
                "path {}: 'rate' has no effect on a pass-through path",
                inner.name
            );
        }

        let runtime = PathRuntime {
            signals: out_signals,
            pool,
            read_pools,
            resolved,
            full_mask: (1u64 << inner.sources.len()) - 1,
            simple,
        };

        if inner.runtime.set(runtime).is_err() {
            // Second prepare is a lifecycle violation.
            panic!("path prepared twice");
        }

        inner.state.store(State::Prepared);
        debug!("path {} prepared", inner.name);
        Ok(())
    }

    /// Spawn one thread per source and per destination.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner.state.load().expect(State::Prepared);

        inner.running.store(true, Ordering::Release);
        inner.hooks.lock().start();

        let mut threads = self.threads.lock();

        for idx in 0..inner.sources.len() {
            let inner = Arc::clone(&self.inner);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("src-{}", inner.sources[idx].node.name()))
                    .spawn(move || source_loop(&inner, idx))
                    .map_err(|e| Error::resource(format!("spawn failed: {}", e)))?,
            );
        }

        for idx in 0..inner.destinations.len() {
            let inner = Arc::clone(&self.inner);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("dst-{}", inner.destinations[idx].node.name()))
                    .spawn(move || destination_loop(&inner, idx))
                    .map_err(|e| Error::resource(format!("spawn failed: {}", e)))?,
            );
        }

        if inner.rate > 0.0 && !runtime(inner).simple {
            let inner = Arc::clone(&self.inner);
            threads.push(
                std::thread::Builder::new()
                    .name("path-timer".to_string())
                    .spawn(move || timer_loop(&inner))
                    .map_err(|e| Error::resource(format!("spawn failed: {}", e)))?,
            );
        }

        inner.state.store(State::Started);
        info!("path {} started", inner.name);
        Ok(())
    }

    /// Stop the path: close every destination queue, then join the threads
    /// within a grace period.
    pub fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let s = inner.state.load();
        if s == State::Stopped {
            return Ok(());
        }
        inner.state.store(State::Stopping);
        inner.running.store(false, Ordering::Release);

        for dest in &inner.destinations {
            dest.queue.close();
        }

        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        let deadline = Instant::now() + STOP_GRACE;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(
                    "path {}: thread {:?} did not stop within the grace period, detaching",
                    inner.name,
                    handle.thread().name()
                );
            }
        }

        inner.hooks.lock().stop();

        // Drain what is left in the trigger state so samples return home.
        inner.trigger.lock().latest.iter_mut().for_each(|l| *l = None);

        inner.state.store(State::Stopped);
        info!("path {} stopped", inner.name);
        Ok(())
    }

    pub fn periodic(&self) {
        self.inner.hooks.lock().periodic();
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> State {
        self.inner.state.load()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    pub fn mode(&self) -> PathMode {
        self.inner.mode
    }

    /// Output signal list of the path's hook chain.
    pub fn signals(&self) -> Option<SignalList> {
        self.inner.runtime.get().map(|rt| rt.signals.clone())
    }

    pub fn sources(&self) -> &[PathSource] {
        &self.inner.sources
    }

    pub fn destinations(&self) -> &[PathDestination] {
        &self.inner.destinations
    }

    pub fn received_total(&self) -> u64 {
        self.inner.received_total.load(Ordering::Relaxed)
    }

    pub fn emitted_total(&self) -> u64 {
        self.inner.emitted_total.load(Ordering::Relaxed)
    }

    pub fn missing_warnings(&self) -> u64 {
        self.inner.missing_warnings.load(Ordering::Relaxed)
    }

    /// Counter summary for the final table.
    pub fn format_counters(&self) -> String {
        let mut out = format!(
            "{}: received={} emitted={} missing={}",
            self.inner.name,
            self.received_total(),
            self.emitted_total(),
            self.missing_warnings()
        );
        for dest in &self.inner.destinations {
            out.push_str(&format!(
                " [{}: enqueue_overrun={} write_overrun={}]",
                dest.node.name(),
                dest.enqueue_overruns(),
                dest.write_overruns()
            ));
        }
        out
    }
}

fn runtime(inner: &PathInner) -> &PathRuntime {
    inner.runtime.get().expect("path not prepared")
}

fn source_loop(inner: &Arc<PathInner>, idx: usize) {
    let rt = runtime(inner);
    let source = &inner.sources[idx];
    let read_pool = rt.read_pools[idx].clone();
    let vectorize = inner.vectorize;

    while inner.running.load(Ordering::Acquire) {
        if inner.state.load() == State::Paused {
            pause_tick(inner);
            continue;
        }

        let mut batch = Vec::with_capacity(vectorize);
        if read_pool.alloc_many(&mut batch, vectorize) == 0 {
            // Pool starved: wait for outstanding samples to come home.
            std::thread::sleep(STARVE_BACKOFF);
            continue;
        }

        match source.node.read(&mut batch) {
            Ok(0) => continue, // spurious wakeup or timeout
            Ok(_) => process_batch(inner, rt, idx, batch),
            Err(e) => {
                error!(
                    "path {}: fatal read error on '{}': {}",
                    inner.name,
                    source.node.name(),
                    e
                );
                inner.running.store(false, Ordering::Release);
                inner.state.compare_exchange(State::Started, State::Stopping);
                for dest in &inner.destinations {
                    dest.queue.close();
                }
                break;
            }
        }
    }
}

/// Run a received batch through trigger evaluation, the path hook chain,
/// sequencing and fan-out.
fn process_batch(inner: &PathInner, rt: &PathRuntime, source_idx: usize, mut batch: Vec<SampleRef>) {
    inner
        .received_total
        .fetch_add(batch.len() as u64, Ordering::Relaxed);

    let mut outputs: Vec<SampleRef>;

    if rt.simple {
        outputs = batch;
    } else {
        outputs = Vec::with_capacity(batch.len());
        let mut trig = inner.trigger.lock();

        for smp in batch.drain(..) {
            trig.latest[source_idx] = Some(smp.clone());
            trig.received |= 1u64 << source_idx;

            let fire = match inner.mode {
                PathMode::Any => true,
                PathMode::All => trig.received == rt.full_mask,
            };

            if fire {
                if let Some(out) = compose_output(inner, rt, &trig, Some(&*smp)) {
                    outputs.push(out);
                }
                if inner.mode == PathMode::All {
                    trig.received = 0;
                }
            }
        }
    }

    finish_outputs(inner, outputs);
}

/// Compose one merged path sample from the latest sample of every source.
/// The header is taken from the triggering sample when present.
fn compose_output(
    inner: &PathInner,
    rt: &PathRuntime,
    trig: &TriggerState,
    header_src: Option<&Sample>,
) -> Option<SampleRef> {
    let mut out = rt.pool.alloc_one()?;

    {
        let o = out.as_mut();
        o.signals = Some(rt.signals.clone());
        o.set_len(rt.signals.len());

        match header_src {
            Some(h) => {
                o.sequence = h.sequence;
                o.ts_origin = h.ts_origin;
                o.ts_received = h.ts_received;
                o.flags = (h.flags
                    & (flags::HAS_SEQUENCE | flags::HAS_TS_ORIGIN | flags::HAS_TS_RECEIVED))
                    | flags::HAS_DATA;
            }
            None => {
                // Clock-triggered output: no origin, stamped on the way out.
                o.ts_received = crate::timing::Timestamp::now();
                o.flags = flags::HAS_TS_RECEIVED | flags::HAS_DATA;
            }
        }

        for (si, source_mappings) in rt.resolved.iter().enumerate() {
            let src = trig.latest[si].as_ref().map(|r| &**r);
            let stats = inner.sources[si].node.stats().as_ref();
            for mapping in source_mappings {
                mapping.apply(o, src, Some(stats), &rt.signals, &inner.missing_warnings);
            }
        }
    }

    Some(out)
}

/// Hook chain, sequence rewrite and fan-out for a set of fired outputs.
fn finish_outputs(inner: &PathInner, mut outputs: Vec<SampleRef>) {
    if outputs.is_empty() {
        return;
    }

    match inner.hooks.lock().process(&mut outputs) {
        Ok(_) => {}
        Err(e) => {
            error!("path {}: hook chain failed: {}", inner.name, e);
            return;
        }
    }

    if !inner.original_sequence_no {
        for out in outputs.iter_mut() {
            let s = out.as_mut();
            s.sequence = inner.out_seq.fetch_add(1, Ordering::Relaxed);
            s.flags |= flags::HAS_SEQUENCE;
        }
    }

    inner
        .emitted_total
        .fetch_add(outputs.len() as u64, Ordering::Relaxed);

    for out in outputs.drain(..) {
        for dest in &inner.destinations {
            match dest.queue.push(out.clone()) {
                Ok(()) => {}
                Err(PushError::Full(dropped)) => {
                    drop(dropped);
                    dest.enqueue_overruns.fetch_add(1, Ordering::Relaxed);
                    note_overrun(inner);
                }
                Err(PushError::Closed(dropped)) => drop(dropped),
            }
        }
    }
}

fn destination_loop(inner: &Arc<PathInner>, idx: usize) {
    let dest = &inner.destinations[idx];
    let vectorize = inner.vectorize;

    loop {
        let mut batch = Vec::with_capacity(vectorize);
        match dest.queue.pull_many_blocking(&mut batch, vectorize) {
            Ok(_) => {}
            Err(Closed) => break,
        }

        match dest.node.write(&mut batch) {
            Ok(accepted) => {
                let delivered = batch.len();
                if accepted < delivered {
                    // The node consumed an ordered prefix; the rest is
                    // dropped with the batch.
                    dest.write_overruns
                        .fetch_add((delivered - accepted) as u64, Ordering::Relaxed);
                }
            }
            Err(e) => {
                warn!(
                    "path {}: write to '{}' failed: {}",
                    inner.name,
                    dest.node.name(),
                    e
                );
            }
        }
    }
}

/// Clock-driven trigger: emit the merged state of all sources at `rate` Hz.
fn timer_loop(inner: &Arc<PathInner>) {
    let rt = runtime(inner);
    let period = Duration::from_secs_f64(1.0 / inner.rate);
    let mut next = Instant::now() + period;

    while inner.running.load(Ordering::Acquire) {
        let now = Instant::now();
        if next > now {
            std::thread::sleep((next - now).min(Duration::from_millis(100)));
            continue;
        }
        next += period;

        if inner.state.load() == State::Paused {
            continue;
        }

        let outputs = {
            let trig = inner.trigger.lock();
            if trig.latest.iter().all(|l| l.is_none()) {
                continue; // nothing received yet
            }
            compose_output(inner, rt, &trig, None).into_iter().collect()
        };

        finish_outputs(inner, outputs);
    }
}

fn note_overrun(inner: &PathInner) {
    let mut window = inner.overrun_window.lock();
    let now = Instant::now();
    if now.duration_since(window.0) > OVERRUN_WINDOW {
        *window = (now, 0);
    }
    window.1 += 1;

    if window.1 > OVERRUN_PAUSE_THRESHOLD && inner.state.load() == State::Started {
        warn!(
            "path {}: {} enqueue overruns within {:?}, pausing",
            inner.name, window.1, OVERRUN_WINDOW
        );
        if inner.state.compare_exchange(State::Started, State::Paused) {
            *inner.paused_at.lock() = Some(now);
        }
    }
}

fn pause_tick(inner: &PathInner) {
    let resume = {
        let paused_at = inner.paused_at.lock();
        matches!(*paused_at, Some(t) if t.elapsed() >= PAUSE_BACKOFF)
    };

    if resume && inner.state.compare_exchange(State::Paused, State::Started) {
        *inner.paused_at.lock() = None;
        *inner.overrun_window.lock() = (Instant::now(), 0);
        info!("path {}: resuming after overrun pause", inner.name);
    } else {
        std::thread::sleep(Duration::from_millis(5));
    }
}
