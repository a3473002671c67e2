//! Process Tree Monitoring
//!
//! Spawns a program and samples every process of its tree at a fixed
//! cadence until the program exits:
//!
//! - [`scheduler`]: tick loop waiting on the root between sampling rounds
//! - [`registry`]: arena of every process observed, with live-pid index
//! - [`source`]: per-process metrics reads and child discovery
//! - [`rusage`]: exact kernel totals for the whole tree
//! - [`report`]: the immutable result tree and its JSON-lines format

pub mod accelerator;
pub mod error;
pub mod options;
pub mod registry;
pub mod report;
pub mod runner;
pub mod rusage;
pub mod sample;
pub mod scheduler;
pub mod source;
pub mod spawn;

pub use accelerator::{AcceleratorError, AcceleratorSampler, NvidiaSmiSampler};
pub use error::{MonitorError, Result, SampleError};
pub use options::{MonitorOptions, DEFAULT_INTERVAL, PARALLELISM_VARIABLE};
pub use registry::{MonitoredProcess, ProcessId, ProcessRegistry};
pub use report::{
    read_json_lines, write_json_line, ProcessReport, RunReport, SkippedDeadlines, TimedSample,
};
pub use runner::{run, Runner, MIN_RELIABLE_DURATION};
pub use rusage::{AggregateUsage, ResourceUsage};
pub use sample::{AcceleratorUsage, InstantSample};
pub use spawn::ExitOutcome;
