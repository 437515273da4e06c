//! Route samples between two in-process loopback nodes.
//!
//! Builds a supervisor from an inline configuration, injects a handful of
//! samples into the first node and reads them back from the second.
//!
//! Run with: cargo run --example loopback_pipeline

use std::sync::Arc;
use std::time::{Duration, Instant};

use sigflow::config::Config;
use sigflow::pool::{MemoryType, Pool};
use sigflow::sample::flags;
use sigflow::signal::SignalData;
use sigflow::supervisor::Supervisor;
use sigflow::timing::Timestamp;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_str(
        r#"{
            "nodes": {
                "source": { "type": "loopback", "queuelen": 64,
                            "in": { "signals": { "count": 3, "type": "float" } } },
                "sink":   { "type": "loopback", "queuelen": 64,
                            "in": { "signals": { "count": 3, "type": "float" } } }
            },
            "paths": [
                { "in": "source", "out": "sink", "original_sequence_no": true }
            ],
            "stats": 1.0
        }"#,
    )
    .expect("config");

    let mut supervisor = Supervisor::from_config(config).expect("build");
    supervisor.start().expect("start");

    let source = Arc::clone(supervisor.node("source").expect("source node"));
    let sink = Arc::clone(supervisor.node("sink").expect("sink node"));

    let pool = Pool::new(16, 3, MemoryType::Heap).expect("pool");

    for seq in 0..5u64 {
        let mut smp = pool.alloc_one().expect("sample");
        {
            let s = smp.as_mut();
            s.sequence = seq;
            s.ts_origin = Timestamp::now();
            s.flags = flags::HAS_SEQUENCE | flags::HAS_TS_ORIGIN | flags::HAS_DATA;
            s.set_len(3);
            for (i, v) in [1.0, 2.0, 3.0].iter().enumerate() {
                s.data_mut()[i] = SignalData::float(v * (seq as f64 + 1.0));
            }
        }
        let mut batch = vec![smp];
        source.write(&mut batch).expect("write");
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut received = 0;
    while received < 5 && Instant::now() < deadline {
        let mut batch = Vec::new();
        pool.alloc_many(&mut batch, 8);
        match sink.read(&mut batch) {
            Ok(0) => {}
            Ok(n) => {
                for smp in &batch {
                    println!(
                        "received seq={} data={:?}",
                        smp.sequence,
                        smp.data().iter().map(|v| v.f()).collect::<Vec<_>>()
                    );
                }
                received += n;
            }
            Err(e) => {
                eprintln!("read failed: {}", e);
                break;
            }
        }
    }

    supervisor.stop();
}
