//! Bottlenecks - Process Tree Resource Monitor
//!
//! Runs a program and measures what it does to the machine: CPU, memory,
//! I/O and context switches of every process it spawns, sampled at a fixed
//! cadence, plus the kernel's exact totals for the whole tree. Meant for
//! finding the parallelism at which a compute program stops scaling.
//!
//! # Architecture
//!
//! The library is organized into two modules:
//!
//! - [`monitor`]: spawning, sampling and report assembly for one run
//! - [`calibrate`]: search for the size argument giving a target duration
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use bottlenecks::{run, MonitorOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = MonitorOptions::default()
//!         .with_interval(Duration::from_millis(100))
//!         .with_parallelism(8);
//!
//!     let report = run(&["./solver".to_string(), "2000".to_string()], options)?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

pub mod calibrate;
pub mod monitor;

// Re-export commonly used types
pub use calibrate::{calibrate, CalibrationError};
pub use monitor::{run, MonitorError, MonitorOptions, ProcessReport, RunReport, Runner};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Bottlenecks";
