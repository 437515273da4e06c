//! Signal-generator node.
//!
//! Produces float samples on a wall-clock tick: sine, square, triangle,
//! ramp, counter, constant, Gaussian random walk, or a mix of all of them.
//! Missed ticks are counted and reported at stop.

use std::f64::consts::PI;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::node::{NodeKind, ReadResult};
use crate::sample::{flags, SampleRef};
use crate::signal::{Signal, SignalList, SignalType};
use crate::timing::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Waveform {
    Constant,
    Sine,
    Triangle,
    Square,
    Ramp,
    Counter,
    Random,
}

/// Per-index waveform rotation used by the `mixed` generator.
const MIXED: [Waveform; 7] = [
    Waveform::Random,
    Waveform::Sine,
    Waveform::Square,
    Waveform::Triangle,
    Waveform::Ramp,
    Waveform::Counter,
    Waveform::Constant,
];

impl Waveform {
    fn from_str(s: &str) -> Result<Option<Waveform>> {
        match s {
            "constant" => Ok(Some(Waveform::Constant)),
            "sine" => Ok(Some(Waveform::Sine)),
            "triangle" => Ok(Some(Waveform::Triangle)),
            "square" => Ok(Some(Waveform::Square)),
            "ramp" => Ok(Some(Waveform::Ramp)),
            "counter" => Ok(Some(Waveform::Counter)),
            "random" => Ok(Some(Waveform::Random)),
            "mixed" => Ok(None),
            _ => Err(Error::config(format!("unknown signal type '{}'", s))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Waveform::Constant => "constant",
            Waveform::Sine => "sine",
            Waveform::Triangle => "triangle",
            Waveform::Square => "square",
            Waveform::Ramp => "ramp",
            Waveform::Counter => "counter",
            Waveform::Random => "random",
        }
    }
}

fn default_realtime() -> bool {
    true
}

fn default_limit() -> i64 {
    -1
}

fn default_values() -> usize {
    1
}

fn default_rate() -> f64 {
    10.0
}

fn default_frequency() -> f64 {
    1.0
}

fn default_amplitude() -> f64 {
    1.0
}

fn default_stddev() -> f64 {
    0.2
}

fn default_monitor_missed() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct GeneratorConfig {
    #[serde(rename = "signal", default)]
    signal: Option<String>,
    #[serde(default = "default_realtime")]
    realtime: bool,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default = "default_values")]
    values: usize,
    #[serde(default = "default_rate")]
    rate: f64,
    #[serde(default = "default_frequency")]
    frequency: f64,
    #[serde(default = "default_amplitude")]
    amplitude: f64,
    #[serde(default = "default_stddev")]
    stddev: f64,
    #[serde(default)]
    offset: f64,
    #[serde(default = "default_monitor_missed")]
    monitor_missed: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            signal: None,
            realtime: true,
            limit: -1,
            values: 1,
            rate: 10.0,
            frequency: 1.0,
            amplitude: 1.0,
            stddev: 0.2,
            offset: 0.0,
            monitor_missed: true,
        }
    }
}

struct GenState {
    counter: u64,
    started_wall: Timestamp,
    started_mono: Instant,
    next_tick: Instant,
    /// Random-walk state, one per value.
    last: Vec<f64>,
    missed: u64,
    rng: SmallRng,
}

pub struct GeneratorNode {
    cfg: GeneratorConfig,
    /// `None` = mixed, one waveform per value index.
    waveform: Option<Waveform>,
    /// Resolved at prepare; stamped onto every produced sample.
    signals: Option<SignalList>,
    state: Mutex<Option<GenState>>,
}

impl GeneratorNode {
    pub fn new() -> Self {
        GeneratorNode {
            cfg: GeneratorConfig::default(),
            waveform: None,
            signals: None,
            state: Mutex::new(None),
        }
    }

    fn waveform_at(&self, index: usize) -> Waveform {
        match self.waveform {
            Some(w) => w,
            None => MIXED[index % MIXED.len()],
        }
    }

    /// Standard Box-Muller transform; one normal deviate per call.
    fn box_muller(rng: &mut SmallRng) -> f64 {
        let u1: f64 = 1.0 - rng.gen::<f64>();
        let u2: f64 = rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }
}

impl Default for GeneratorNode {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeKind for GeneratorNode {
    fn parse(&mut self, cfg: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        self.cfg = serde_json::from_value(serde_json::Value::Object(cfg.clone()))
            .map_err(|e| Error::config(format!("signal node: {}", e)))?;

        self.waveform = match self.cfg.signal.as_deref() {
            Some(s) => Waveform::from_str(s)?,
            None => None, // mixed
        };

        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.cfg.rate <= 0.0 {
            return Err(Error::validation("signal node 'rate' must be positive"));
        }
        if self.cfg.values == 0 {
            return Err(Error::validation("signal node needs at least one value"));
        }
        Ok(())
    }

    fn provided_signals(&self) -> Option<SignalList> {
        // All generated signals are floats named after their waveform.
        let signals = (0..self.cfg.values)
            .map(|i| {
                std::sync::Arc::new(Signal::new(
                    self.waveform_at(i).as_str(),
                    SignalType::Float,
                ))
            })
            .collect();
        Some(std::sync::Arc::new(signals))
    }

    fn prepare(&mut self, in_signals: &SignalList, _out_signals: &SignalList) -> Result<()> {
        self.signals = Some(in_signals.clone());
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let now = Instant::now();
        *self.state.lock() = Some(GenState {
            counter: 0,
            started_wall: Timestamp::now(),
            started_mono: now,
            next_tick: now,
            last: vec![self.cfg.offset; self.cfg.values],
            missed: 0,
            rng: SmallRng::from_entropy(),
        });
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        // The reader thread may be sleeping towards its next tick with the
        // state locked; do not wait for it.
        if let Some(mut guard) = self.state.try_lock() {
            if let Some(state) = guard.take() {
                if state.missed > 0 && self.cfg.monitor_missed {
                    warn!("signal generator missed a total of {} steps", state.missed);
                }
            }
        }
        Ok(())
    }

    fn read(&self, smps: &mut [SampleRef]) -> Result<ReadResult> {
        let smp = match smps.first_mut() {
            Some(s) => s,
            None => return Ok(ReadResult::all(0)),
        };

        let mut guard = self.state.lock();
        let state = match guard.as_mut() {
            Some(s) => s,
            None => return Ok(ReadResult::all(0)), // stopped
        };

        let period = Duration::from_secs_f64(1.0 / self.cfg.rate);
        let (ts, steps, running) = if self.cfg.realtime {
            // Block until the next tick; count skipped periods when behind.
            let now = Instant::now();
            let mut steps = 1u64;
            if state.next_tick > now {
                std::thread::sleep(state.next_tick - now);
            } else {
                let behind = now - state.next_tick;
                let skipped = (behind.as_secs_f64() / period.as_secs_f64()) as u64;
                if skipped > 0 {
                    steps += skipped;
                    state.missed += skipped;
                    if self.cfg.monitor_missed {
                        debug!("signal generator missed {} steps", skipped);
                    }
                }
            }
            state.next_tick += period * steps as u32;

            let running = state.started_mono.elapsed().as_secs_f64();
            (Timestamp::now(), steps, running)
        } else {
            let running = state.counter as f64 / self.cfg.rate;
            (state.started_wall.add_secs(running), 1, running)
        };

        if self.cfg.limit > 0 && state.counter >= self.cfg.limit as u64 {
            info!("signal generator reached limit of {} samples", self.cfg.limit);
            return Err(Error::resource("sample limit reached"));
        }

        let cfg = &self.cfg;
        let values = cfg.values.min(smp.capacity());

        let s = smp.as_mut();
        s.sequence = state.counter;
        s.ts_origin = ts;
        s.flags = flags::HAS_SEQUENCE | flags::HAS_TS_ORIGIN | flags::HAS_DATA;
        s.signals = self.signals.clone();
        s.set_len(values);

        for i in 0..values {
            let v = match self.waveform_at(i) {
                Waveform::Constant => cfg.offset + cfg.amplitude,
                Waveform::Sine => {
                    cfg.offset + cfg.amplitude * (running * cfg.frequency * 2.0 * PI).sin()
                }
                Waveform::Triangle => {
                    cfg.offset
                        + cfg.amplitude
                            * (((running * cfg.frequency).rem_euclid(1.0) - 0.5).abs() - 0.25)
                            * 4.0
                }
                Waveform::Square => {
                    cfg.offset
                        + cfg.amplitude
                            * if (running * cfg.frequency).rem_euclid(1.0) < 0.5 {
                                -1.0
                            } else {
                                1.0
                            }
                }
                Waveform::Ramp => cfg.offset + cfg.amplitude * running.rem_euclid(cfg.frequency),
                Waveform::Counter => cfg.offset + cfg.amplitude * state.counter as f64,
                Waveform::Random => {
                    state.last[i] += Self::box_muller(&mut state.rng) * cfg.stddev;
                    state.last[i]
                }
            };
            s.data_mut()[i] = crate::signal::SignalData::float(v);
        }

        state.counter += steps;
        Ok(ReadResult::all(1))
    }

    fn write(&self, _smps: &[SampleRef]) -> Result<usize> {
        Err(Error::validation("signal generator is read-only"))
    }

    fn print(&self) -> String {
        let kind = match self.waveform {
            Some(w) => w.as_str(),
            None => "mixed",
        };
        let mut out = format!(
            "signal={}, rt={}, rate={:.2}, values={}, frequency={:.2}, amplitude={:.2}, stddev={:.2}, offset={:.2}",
            kind,
            if self.cfg.realtime { "yes" } else { "no" },
            self.cfg.rate,
            self.cfg.values,
            self.cfg.frequency,
            self.cfg.amplitude,
            self.cfg.stddev,
            self.cfg.offset
        );
        if self.cfg.limit > 0 {
            out.push_str(&format!(", limit={}", self.cfg.limit));
        }
        out
    }
}
