//! sigflow: real-time sample routing between heterogeneous endpoints.
//!
//! A configuration wires *paths* between named *nodes* (sockets, loopbacks,
//! generators). Each path reads batches of samples from its sources, runs
//! them through a priority-ordered hook chain and fans them out into bounded
//! per-destination queues, from where writer threads drain them into the
//! output nodes.
//!
//! Layering, leaves first: samples and signals over pool/queue storage,
//! format codecs, the node abstraction, hooks, the path engine and finally
//! the supervisor owning the registries.

pub mod config;
pub mod error;
pub mod format;
pub mod hook;
pub mod mapping;
pub mod node;
pub mod path;
pub mod pool;
pub mod queue;
pub mod queue_signalled;
pub mod sample;
pub mod signal;
pub mod state;
pub mod stats;
pub mod supervisor;
pub mod timing;

pub use error::{Error, Result};
pub use sample::{Sample, SampleRef};
pub use signal::{Signal, SignalData, SignalList, SignalType};
