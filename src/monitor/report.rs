//! Run Reports
//!
//! The immutable result of a monitored run. Built once, after the root
//! process exited, by walking the registry from the root and converting
//! tick indices into seconds since spawn.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::registry::{ProcessId, ProcessRegistry};
use super::rusage::AggregateUsage;
use super::sample::InstantSample;

/// An instant sample with its tick resolved to a timestamp.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TimedSample {
    /// Seconds since the root was spawned (`iteration * interval`)
    pub timestamp_s: f64,
    #[serde(flatten)]
    pub metrics: InstantSample,
}

/// Consecutive sampling deadlines that passed while a round was running.
///
/// Deadline `k` falls at `k * interval` from spawn, while samples carry
/// tick indices that advance by one per round. After a skip the two
/// diverge, so a skip names both.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedDeadlines {
    /// Tick of the first round run after the skipped deadlines
    pub tick: u64,
    pub first_deadline_index: u64,
    pub count: u64,
}

/// One process of the monitored tree.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessReport {
    pub pid: u32,
    pub command: Vec<String>,
    pub spawned_at_iteration: u64,
    pub terminated_at_iteration: u64,
    pub spawned_at_s: f64,
    pub terminated_at_s: f64,
    pub samples: Vec<TimedSample>,
    pub children: Vec<ProcessReport>,
}

/// Complete result of one monitored run.
///
/// `usage` holds exact kernel totals over the whole tree, including
/// processes too short-lived to ever be sampled; the per-process series
/// under `root` are necessarily incomplete for those.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Command line of the root process
    pub command: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub interval_s: f64,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Wall-clock time from just before spawn to just after reaping
    pub clock_duration_s: f64,
    /// Totals of the monitored tree only, accelerator tool runs excluded
    pub usage: AggregateUsage,
    /// Totals of the accelerator tool runs the monitor itself reaped
    #[serde(default)]
    pub sampler_usage: AggregateUsage,
    /// Deadlines skipped because a sampling round overran the interval
    #[serde(default)]
    pub missed_deadlines: Vec<SkippedDeadlines>,
    pub root: ProcessReport,
}

impl RunReport {
    /// Iterates over every process of the tree, depth first, root first.
    pub fn iter_processes(&self) -> ProcessIter<'_> {
        ProcessIter {
            stack: vec![&self.root],
        }
    }

    /// Number of processes in the tree.
    pub fn process_count(&self) -> usize {
        self.iter_processes().count()
    }

    /// Peak resident memory of the root across its samples, in bytes.
    pub fn peak_rss(&self) -> u64 {
        self.root
            .samples
            .iter()
            .map(|s| s.metrics.memory.rss)
            .max()
            .unwrap_or(0)
    }

    /// Mean CPU percentage of the root across its samples.
    pub fn average_cpu(&self) -> f32 {
        let samples = &self.root.samples;
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().map(|s| s.metrics.cpu_percent).sum::<f32>() / samples.len() as f32
    }

    /// Returns a human-readable summary of the run.
    pub fn summary(&self) -> String {
        let exit = match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("killed by signal {}", signal),
            (None, None) => "unknown exit".to_string(),
        };

        format!(
            "Run of {:?}: {}\n  Duration: {:.2}s\n  User time: {:.2}s\n  System time: {:.2}s\n  Peak Memory: {} MB\n  Average CPU: {:.1}%\n  Processes: {}\n  Samples: {}",
            self.command,
            exit,
            self.clock_duration_s,
            self.usage.user_time_s,
            self.usage.system_time_s,
            self.peak_rss() / (1024 * 1024),
            self.average_cpu(),
            self.process_count(),
            self.root.samples.len()
        )
    }
}

/// Depth-first iterator over a report tree.
pub struct ProcessIter<'a> {
    stack: Vec<&'a ProcessReport>,
}

impl<'a> Iterator for ProcessIter<'a> {
    type Item = &'a ProcessReport;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// Converts the registry subtree rooted at `id` into a report tree.
///
/// Records still live (none, after a completed run) are closed at
/// `fallback_iteration`.
pub fn assemble_process(
    registry: &ProcessRegistry,
    id: ProcessId,
    interval: Duration,
    fallback_iteration: u64,
) -> ProcessReport {
    let record = &registry[id];
    let seconds = |iteration: u64| iteration as f64 * interval.as_secs_f64();
    let terminated = record.terminated_at_iteration.unwrap_or(fallback_iteration);

    ProcessReport {
        pid: record.pid,
        command: record.command.clone(),
        spawned_at_iteration: record.spawned_at_iteration,
        terminated_at_iteration: terminated,
        spawned_at_s: seconds(record.spawned_at_iteration),
        terminated_at_s: seconds(terminated),
        samples: record
            .samples
            .iter()
            .map(|sample| TimedSample {
                timestamp_s: seconds(sample.iteration),
                metrics: sample.clone(),
            })
            .collect(),
        children: record
            .children
            .iter()
            .map(|&child| assemble_process(registry, child, interval, fallback_iteration))
            .collect(),
    }
}

/// Writes `value` as a single JSON line.
pub fn write_json_line<W: Write, T: Serialize>(writer: &mut W, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value)?;
    writer.write_all(b"\n")
}

/// Reads every non-blank line of `reader` as one JSON value.
pub fn read_json_lines<R: BufRead, T: DeserializeOwned>(reader: R) -> io::Result<Vec<T>> {
    let mut values = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        values.push(serde_json::from_str(&line)?);
    }
    Ok(values)
}
