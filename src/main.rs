//! sigflow daemon entry point.

use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info};

use sigflow::config::Config;
use sigflow::supervisor::Supervisor;

const EXIT_CONFIG: i32 = 1;
const EXIT_START: i32 = 2;
const EXIT_RUNTIME: i32 = 3;

static RUNNING: AtomicBool = AtomicBool::new(true);

#[cfg(unix)]
extern "C" fn handle_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Release);
}

#[cfg(unix)]
fn install_signal_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn usage() {
    eprintln!("usage: sigflow [-h] [-V] CONFIG");
    eprintln!();
    eprintln!("  CONFIG  path to the configuration document");
    eprintln!("  -h      show this help");
    eprintln!("  -V      show version");
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-h" | "--help" => {
                usage();
                exit(0);
            }
            "-V" | "--version" => {
                println!("sigflow {}", env!("CARGO_PKG_VERSION"));
                exit(0);
            }
            _ => config_path = Some(arg),
        }
    }

    let config_path = match config_path {
        Some(p) => p,
        None => {
            usage();
            exit(EXIT_CONFIG);
        }
    };

    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            exit(EXIT_CONFIG);
        }
    };

    let mut supervisor = match Supervisor::from_config(config) {
        Ok(s) => s,
        Err(e) => {
            error!("{}", e);
            exit(EXIT_CONFIG);
        }
    };

    install_signal_handlers();

    if let Err(e) = supervisor.start() {
        error!("startup failed: {}", e);
        supervisor.stop();
        exit(EXIT_START);
    }

    info!("sigflow is running, send SIGINT to stop");

    let result = supervisor.run(&RUNNING);
    supervisor.stop();

    match result {
        Ok(()) => exit(0),
        Err(e) => {
            error!("{}", e);
            exit(EXIT_RUNTIME);
        }
    }
}
