//! Instant Samples
//!
//! Point-in-time readings of one process's OS metrics. Every field is a
//! cumulative or current value as reported by the operating system, except
//! `cpu_percent` which is averaged over the window since the previous read
//! of the same process.

use serde::{Deserialize, Serialize};

/// Memory usage of a process, in bytes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryInfo {
    /// Resident set size
    pub rss: u64,
    /// Virtual memory size
    pub vms: u64,
    /// Resident pages shared with other processes
    pub shared: u64,
    /// Text (code) segment
    pub text: u64,
    /// Data + stack segments
    pub data: u64,
    /// Swapped-out memory
    pub swap: u64,
}

/// Cumulative I/O counters of a process.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct IoCounters {
    /// Number of read syscalls
    pub read_count: u64,
    /// Number of write syscalls
    pub write_count: u64,
    /// Bytes fetched from the storage layer
    pub read_bytes: u64,
    /// Bytes sent to the storage layer
    pub write_bytes: u64,
    /// Bytes passed to read-like syscalls, cached or not
    pub read_chars: u64,
    /// Bytes passed to write-like syscalls, cached or not
    pub write_chars: u64,
}

/// Cumulative context switch counters.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct ContextSwitches {
    pub voluntary: u64,
    pub involuntary: u64,
}

/// Accelerator (GPU) usage attributed to one process.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct AcceleratorUsage {
    /// Streaming-multiprocessor utilisation, percent
    pub utilization_percent: f32,
    /// Frame buffer memory used, in bytes
    pub memory_bytes: u64,
}

/// A single reading of one process's metrics at one tick.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InstantSample {
    /// Tick at which the reading was taken
    pub iteration: u64,
    /// CPU usage since the previous read of this process (100 = one core)
    pub cpu_percent: f32,
    /// Cumulative CPU time spent in user mode, seconds
    pub user_time_s: f64,
    /// Cumulative CPU time spent in kernel mode, seconds
    pub system_time_s: f64,
    /// Cumulative minor page faults
    pub minor_page_faults: u64,
    /// Cumulative major page faults
    pub major_page_faults: u64,
    pub memory: MemoryInfo,
    pub threads: u64,
    pub open_files: u64,
    pub io: IoCounters,
    pub context_switches: ContextSwitches,
    /// `None` when accelerator tracking is disabled
    #[serde(default)]
    pub accelerator: Option<AcceleratorUsage>,
}

impl InstantSample {
    /// Creates an all-zero sample for the given tick.
    pub fn empty(iteration: u64) -> Self {
        Self {
            iteration,
            cpu_percent: 0.0,
            user_time_s: 0.0,
            system_time_s: 0.0,
            minor_page_faults: 0,
            major_page_faults: 0,
            memory: MemoryInfo::default(),
            threads: 0,
            open_files: 0,
            io: IoCounters::default(),
            context_switches: ContextSwitches::default(),
            accelerator: None,
        }
    }

    /// Returns the cumulative CPU time (user + system), in seconds.
    pub fn cpu_time_s(&self) -> f64 {
        self.user_time_s + self.system_time_s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sample() {
        let sample = InstantSample::empty(4);
        assert_eq!(sample.iteration, 4);
        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.memory, MemoryInfo::default());
        assert!(sample.accelerator.is_none());
    }

    #[test]
    fn test_cpu_time() {
        let mut sample = InstantSample::empty(1);
        sample.user_time_s = 1.25;
        sample.system_time_s = 0.5;
        assert_eq!(sample.cpu_time_s(), 1.75);
    }

    #[test]
    fn test_missing_accelerator_field_deserializes() {
        let mut value = serde_json::to_value(InstantSample::empty(2)).unwrap();
        value.as_object_mut().unwrap().remove("accelerator");

        let sample: InstantSample = serde_json::from_value(value).unwrap();
        assert!(sample.accelerator.is_none());
    }
}
