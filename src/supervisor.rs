//! Supervisor: owns the node and path registries and drives their
//! lifecycles.
//!
//! Startup order is nodes before paths; shutdown reverses it. A periodic
//! thread runs every hook chain's periodic tick at the configured stats
//! interval and prints per-node counter lines; the final counter table goes
//! out at stop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::config::{Config, OneOrMany, PathConfig};
use crate::error::{Error, Result};
use crate::node::Node;
use crate::path::Path;
use crate::pool::MemoryType;
use crate::state::State;

pub struct Supervisor {
    nodes: HashMap<String, Arc<Node>>,
    path_configs: Vec<PathConfig>,
    paths: Arc<Vec<Path>>,
    stats_interval: f64,
    hugepages: usize,
    running: Arc<AtomicBool>,
    periodic_thread: Option<JoinHandle<()>>,
    started: bool,
}

impl Supervisor {
    /// Build and validate all nodes from the configuration; path
    /// construction is deferred to `start` because it needs prepared nodes.
    pub fn from_config(cfg: Config) -> Result<Supervisor> {
        let mut nodes = HashMap::new();
        for (name, ncfg) in &cfg.nodes {
            let node = Node::from_config(name, ncfg)?;
            node.check()?;
            nodes.insert(name.clone(), Arc::new(node));
        }

        // Surface unknown node references before start.
        let mut path_configs = Vec::new();
        for pcfg in &cfg.paths {
            for entry in pcfg.input.clone().into_vec() {
                let node = crate::mapping::MappingEntry::parse(&entry)?.node;
                if !nodes.contains_key(&node) {
                    return Err(Error::validation(format!("unknown node '{}'", node)));
                }
            }
            for name in pcfg.output.clone().into_vec() {
                if !nodes.contains_key(&name) {
                    return Err(Error::validation(format!("unknown node '{}'", name)));
                }
            }

            path_configs.push(pcfg.clone());
            if pcfg.reverse {
                path_configs.push(reverse_config(pcfg)?);
            }
        }

        Ok(Supervisor {
            nodes,
            path_configs,
            paths: Arc::new(Vec::new()),
            stats_interval: cfg.stats,
            hugepages: cfg.hugepages,
            running: Arc::new(AtomicBool::new(false)),
            periodic_thread: None,
            started: false,
        })
    }

    /// Prepare nodes, build and prepare paths, then start everything in
    /// registry order: nodes first, paths second.
    pub fn start(&mut self) -> Result<()> {
        let stats_enabled = self.stats_interval > 0.0;
        let memory = if self.hugepages > 0 {
            info!("using hugepage-backed pools ({} pages reserved)", self.hugepages);
            MemoryType::MmapHugepage
        } else {
            MemoryType::Heap
        };

        for node in self.nodes.values_mut() {
            let n = Arc::get_mut(node)
                .expect("nodes must be prepared before paths hold references");
            n.prepare(stats_enabled)?;
        }

        let mut paths = Vec::new();
        for pcfg in &self.path_configs {
            if !pcfg.enabled {
                info!("skipping disabled path");
                continue;
            }
            let path = Path::from_config(pcfg, &self.nodes)?;
            path.check()?;
            path.prepare(memory)?;
            paths.push(path);
        }
        self.paths = Arc::new(paths);

        for node in self.nodes.values() {
            info!("starting node {}", node.print());
            node.start()?;
        }

        for path in self.paths.iter() {
            path.start()?;
        }

        if stats_enabled {
            self.spawn_periodic();
        }

        self.started = true;
        info!(
            "supervisor started: {} nodes, {} paths",
            self.nodes.len(),
            self.paths.len()
        );
        Ok(())
    }

    fn spawn_periodic(&mut self) {
        self.running.store(true, Ordering::Release);

        let running = Arc::clone(&self.running);
        let paths = Arc::clone(&self.paths);
        let nodes: Vec<Arc<Node>> = self.nodes.values().cloned().collect();
        let interval = Duration::from_secs_f64(self.stats_interval);

        self.periodic_thread = Some(
            std::thread::Builder::new()
                .name("periodic".to_string())
                .spawn(move || {
                    let mut next = Instant::now() + interval;
                    while running.load(Ordering::Acquire) {
                        // Sleep in short slices so stop stays responsive.
                        std::thread::sleep(Duration::from_millis(100).min(interval));
                        if Instant::now() < next {
                            continue;
                        }
                        next += interval;

                        for path in paths.iter() {
                            path.periodic();
                        }
                        for node in &nodes {
                            node.periodic();
                            let line = node.stats().format_periodic();
                            if !line.is_empty() {
                                info!("{}: {}", node.name(), line);
                            }
                        }
                    }
                })
                .expect("spawning the periodic thread"),
        );
    }

    /// Stop paths, then nodes, then the periodic task; print the final
    /// counter table.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.periodic_thread.take() {
            let _ = handle.join();
        }

        for path in self.paths.iter() {
            if let Err(e) = path.stop() {
                warn!("stopping path {} failed: {}", path.name(), e);
            }
        }

        for node in self.nodes.values() {
            if node.state() == State::Started || node.state() == State::Stopping {
                if let Err(e) = node.stop() {
                    warn!("stopping node {} failed: {}", node.name(), e);
                }
            }
        }

        if self.started {
            for path in self.paths.iter() {
                info!("{}", path.format_counters());
            }
            if self.stats_interval > 0.0 {
                for node in self.nodes.values() {
                    info!("statistics for {}:\n{}", node.name(), node.stats().format_table());
                }
            }
        }

        self.started = false;
        info!("supervisor stopped");
    }

    /// Block until `keep_running` clears or a path dies. A path failing
    /// after start is a fatal runtime condition.
    pub fn run(&mut self, keep_running: &AtomicBool) -> Result<()> {
        while keep_running.load(Ordering::Acquire) {
            for path in self.paths.iter() {
                let s = path.state();
                if s == State::Stopping || s == State::Stopped {
                    error!("path {} died unexpectedly", path.name());
                    return Err(Error::resource(format!(
                        "path {} failed at runtime",
                        path.name()
                    )));
                }
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> &HashMap<String, Arc<Node>> {
        &self.nodes
    }

    pub fn paths(&self) -> &[Path] {
        &self.paths
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.started {
            self.stop();
        }
    }
}

/// Build the mirrored return path for `reverse: true`. Only simple
/// one-to-one paths can be reversed.
fn reverse_config(cfg: &PathConfig) -> Result<PathConfig> {
    let inputs = cfg.input.clone().into_vec();
    let outputs = cfg.output.clone().into_vec();
    if inputs.len() != 1 || outputs.len() != 1 {
        return Err(Error::validation(
            "only single-source single-destination paths can be reversed",
        ));
    }

    let source = crate::mapping::MappingEntry::parse(&inputs[0])?.node;

    let mut mirrored = cfg.clone();
    mirrored.input = OneOrMany::One(outputs[0].clone());
    mirrored.output = OneOrMany::One(source);
    mirrored.reverse = false;
    mirrored.hooks = Vec::new();
    Ok(mirrored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use crate::sample::flags;
    use crate::signal::SignalData;
    use crate::stats::Metric;
    use crate::timing::Timestamp;

    fn loopback_pair_config(reverse: bool) -> Config {
        Config::from_str(&format!(
            r#"{{ "nodes": {{
                "a": {{ "type": "loopback", "queuelen": 16,
                        "in": {{ "signals": {{ "count": 2, "type": "float" }} }} }},
                "b": {{ "type": "loopback", "queuelen": 16,
                        "in": {{ "signals": {{ "count": 2, "type": "float" }} }} }} }},
                "paths": [ {{ "in": "a", "out": "b",
                              "original_sequence_no": true, "reverse": {} }} ],
                "stats": 0.0 }}"#,
            reverse
        ))
        .unwrap()
    }

    #[test]
    fn test_end_to_end_through_supervisor() {
        let mut sup = Supervisor::from_config(loopback_pair_config(false)).unwrap();
        sup.start().unwrap();

        let pool = Pool::new(8, 2, crate::pool::MemoryType::Heap).unwrap();
        let a = Arc::clone(sup.node("a").unwrap());
        let b = Arc::clone(sup.node("b").unwrap());

        let mut smp = pool.alloc_one().unwrap();
        {
            let s = smp.as_mut();
            s.sequence = 7;
            s.ts_origin = Timestamp::new(1, 0);
            s.flags = flags::HAS_SEQUENCE | flags::HAS_TS_ORIGIN | flags::HAS_DATA;
            s.set_len(2);
            s.data_mut()[0] = SignalData::float(4.0);
            s.data_mut()[1] = SignalData::float(5.0);
        }
        let mut batch = vec![smp];
        a.write(&mut batch).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut got = Vec::new();
        while got.is_empty() && Instant::now() < deadline {
            let mut read = Vec::new();
            pool.alloc_many(&mut read, 1);
            if let Ok(n) = b.read(&mut read) {
                if n > 0 {
                    got = read;
                }
            }
        }

        assert_eq!(got.len(), 1);
        assert_eq!(got[0].sequence, 7);
        assert_eq!(got[0].data()[1].f(), 5.0);

        sup.stop();
    }

    #[test]
    fn test_reverse_creates_mirror_path() {
        let mut sup = Supervisor::from_config(loopback_pair_config(true)).unwrap();
        sup.start().unwrap();
        assert_eq!(sup.paths().len(), 2);
        assert!(sup.paths().iter().any(|p| p.name().contains("b => [ a ]")));
        sup.stop();
    }

    #[test]
    fn test_unknown_node_fails_before_start() {
        let cfg = Config::from_str(
            r#"{ "nodes": { "a": { "type": "loopback" } },
                 "paths": [ { "in": "a", "out": "ghost" } ] }"#,
        )
        .unwrap();
        assert!(Supervisor::from_config(cfg).is_err());
    }

    #[test]
    fn test_generator_to_loopback_with_stats() {
        let cfg = Config::from_str(
            r#"{ "nodes": {
                "gen": { "type": "signal", "signal": "counter", "realtime": true,
                         "rate": 200.0, "values": 1 },
                "sink": { "type": "loopback", "queuelen": 64,
                          "in": { "signals": { "count": 1, "type": "float" } } } },
                "paths": [ { "in": "gen", "out": "sink" } ],
                "stats": 0.5 }"#,
        )
        .unwrap();

        let mut sup = Supervisor::from_config(cfg).unwrap();
        sup.start().unwrap();

        // Let the generator tick for a while.
        std::thread::sleep(Duration::from_millis(300));

        let pool = Pool::new(64, 1, crate::pool::MemoryType::Heap).unwrap();
        let sink = Arc::clone(sup.node("sink").unwrap());
        let mut got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while got.len() < 3 && Instant::now() < deadline {
            let mut read = Vec::new();
            pool.alloc_many(&mut read, 8);
            if let Ok(n) = sink.read(&mut read) {
                if n > 0 {
                    got.append(&mut read);
                }
            }
        }
        assert!(got.len() >= 3);

        // Path rewrote sequences: monotone from zero on this edge.
        for (i, smp) in got.iter().enumerate() {
            assert_eq!(smp.sequence, i as u64);
        }

        // The generator node observed one-way delays.
        let gen = sup.node("gen").unwrap();
        assert!(gen.stats().summary(Metric::Owd).total >= 3);

        sup.stop();
    }
}
