//! Stream generated sine samples over UDP in the binary wire format.
//!
//! A waveform generator feeds a socket node sending to localhost; a second
//! socket node receives the datagrams and the demo prints the decoded
//! samples.
//!
//! Run with: cargo run --example signal_to_udp

use std::sync::Arc;
use std::time::{Duration, Instant};

use sigflow::config::Config;
use sigflow::pool::{MemoryType, Pool};
use sigflow::supervisor::Supervisor;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_str(
        r#"{
            "nodes": {
                "gen": { "type": "signal", "signal": "sine",
                         "rate": 50.0, "values": 2, "amplitude": 10.0 },
                "tx":  { "type": "socket",
                         "local": "127.0.0.1:13000", "remote": "127.0.0.1:13001",
                         "format": "binary",
                         "out": { "signals": { "count": 2, "type": "float" } } },
                "rx":  { "type": "socket",
                         "local": "127.0.0.1:13001", "remote": "127.0.0.1:13000",
                         "format": "binary",
                         "in": { "signals": { "count": 2, "type": "float" } } }
            },
            "paths": [
                { "in": "gen", "out": "tx" }
            ],
            "stats": 1.0
        }"#,
    )
    .expect("config");

    let mut supervisor = Supervisor::from_config(config).expect("build");
    supervisor.start().expect("start");

    let rx = Arc::clone(supervisor.node("rx").expect("rx node"));
    let pool = Pool::new(32, 2, MemoryType::Heap).expect("pool");

    let deadline = Instant::now() + Duration::from_secs(3);
    let mut received = 0;
    while received < 20 && Instant::now() < deadline {
        let mut batch = Vec::new();
        pool.alloc_many(&mut batch, 8);
        match rx.read(&mut batch) {
            Ok(0) => {}
            Ok(n) => {
                for smp in &batch {
                    println!(
                        "seq={} values={:?}",
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
