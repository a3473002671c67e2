//! Monitored Runs
//!
//! Entry point of the library: spawns a program, watches its whole process
//! tree until it exits and returns the assembled [`RunReport`].

use std::time::Duration;

use chrono::Utc;
use log::{info, warn};

use super::accelerator::{AcceleratorSampler, NvidiaSmiSampler};
use super::error::{MonitorError, Result};
use super::options::MonitorOptions;
use super::registry::{ProcessId, ProcessRegistry};
use super::report::{assemble_process, RunReport};
use super::rusage::{Accounting, KernelAccounting};
use super::scheduler::{Poller, SystemClock, Termination};
use super::source::{SnapshotSource, SystemSource};
use super::spawn::{ProcessHandle, RootProcess};

/// Duration of a run below which its measurements are unreliable.
pub const MIN_RELIABLE_DURATION: Duration = Duration::from_secs(1);

/// Runs programs under monitoring.
///
/// # Example
///
/// ```rust,no_run
/// use bottlenecks::monitor::{MonitorOptions, Runner};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut runner = Runner::new(MonitorOptions::default().with_parallelism(4))?;
///     let report = runner.run(&["./solver".to_string(), "2000".to_string()])?;
///
///     println!("{}", report.summary());
///     Ok(())
/// }
/// ```
pub struct Runner {
    options: MonitorOptions,
    accelerator: Option<Box<dyn AcceleratorSampler>>,
}

impl Runner {
    /// Creates a runner, rejecting a zero sampling interval.
    pub fn new(options: MonitorOptions) -> Result<Self> {
        if options.interval.is_zero() {
            return Err(MonitorError::InvalidInterval);
        }

        let accelerator: Option<Box<dyn AcceleratorSampler>> = if options.track_accelerator {
            Some(Box::new(NvidiaSmiSampler::new()))
        } else {
            None
        };

        Ok(Self {
            options,
            accelerator,
        })
    }

    /// Replaces the accelerator sampler, enabling accelerator tracking.
    pub fn with_accelerator_sampler(mut self, sampler: Box<dyn AcceleratorSampler>) -> Self {
        self.options.track_accelerator = true;
        self.accelerator = Some(sampler);
        self
    }

    pub fn options(&self) -> &MonitorOptions {
        &self.options
    }

    /// Runs `command` to completion, sampling it with the system's metrics.
    ///
    /// A non-zero exit of the program is reported in
    /// [`RunReport::exit_code`], not as an error.
    pub fn run(&mut self, command: &[String]) -> Result<RunReport> {
        let mut source = SystemSource::new();
        let mut accounting = KernelAccounting;
        self.run_with(command, &mut source, &mut accounting)
    }

    /// Runs `command` with the given metrics source and accounting.
    pub fn run_with(
        &mut self,
        command: &[String],
        source: &mut dyn SnapshotSource,
        accounting: &mut dyn Accounting,
    ) -> Result<RunReport> {
        let interval = self.options.interval;
        let usage_before = accounting
            .children_usage()
            .map_err(MonitorError::Accounting)?;

        let started_at = Utc::now();
        let clock = SystemClock::start();
        let mut root = RootProcess::spawn(command, &self.options.environment_overlay)?;
        let mut registry = ProcessRegistry::new();

        let outcome = {
            let mut poller = Poller::new(interval, &clock, source, accounting);
            if let Some(sampler) = self.accelerator.as_deref_mut() {
                poller = poller.with_accelerator(sampler);
            }
            drive(&mut poller, &mut root, &mut registry, command)
        };

        let (root_id, termination) = match outcome {
            Ok(done) => done,
            Err(e) => {
                if let Err(kill_err) = root.terminate() {
                    warn!("Could not stop pid {}: {}", root.pid(), kill_err);
                }
                return Err(e);
            }
        };

        let report = RunReport {
            command: command.to_vec(),
            started_at,
            interval_s: interval.as_secs_f64(),
            exit_code: termination.outcome.code,
            signal: termination.outcome.signal,
            clock_duration_s: termination.elapsed.as_secs_f64(),
            usage: termination
                .usage_after
                .since(&usage_before)
                .excluding(&termination.sampler_usage),
            sampler_usage: termination.sampler_usage,
            root: assemble_process(&registry, root_id, interval, termination.iteration),
            missed_deadlines: termination.missed_deadlines,
        };

        info!(
            "{} finished with {} after {:.3}s ({} process(es) tracked)",
            command.join(" "),
            describe_exit(&report),
            report.clock_duration_s,
            registry.len()
        );

        Ok(report)
    }
}

fn drive(
    poller: &mut Poller<'_>,
    root: &mut RootProcess,
    registry: &mut ProcessRegistry,
    command: &[String],
) -> Result<(ProcessId, Termination)> {
    let root_id = poller.start(registry, root.pid(), command.to_vec())?;
    let termination = poller.drive(root, registry)?;
    Ok((root_id, termination))
}

fn describe_exit(report: &RunReport) -> String {
    match (report.exit_code, report.signal) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        (None, None) => "unknown status".to_string(),
    }
}

/// Runs `command` once with `options`.
pub fn run(command: &[String], options: MonitorOptions) -> Result<RunReport> {
    Runner::new(options)?.run(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::accelerator::AcceleratorError;
    use crate::monitor::rusage::ResourceUsage;
    use crate::monitor::sample::AcceleratorUsage;
    use std::collections::HashMap;
    use std::io;

    fn command(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn options(millis: u64) -> MonitorOptions {
        MonitorOptions::default().with_interval(Duration::from_millis(millis))
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = Runner::new(options(0));
        assert!(matches!(result, Err(MonitorError::InvalidInterval)));
    }

    #[test]
    fn test_empty_command_rejected() {
        let result = run(&[], options(100));
        assert!(matches!(result, Err(MonitorError::EmptyCommand)));
    }

    #[test]
    fn test_missing_executable_is_spawn_error() {
        let result = run(&command(&["/nonexistent/bottlenecks-test"]), options(100));
        assert!(matches!(result, Err(MonitorError::Spawn { .. })));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sleep_three_intervals() {
        let report = run(&command(&["sleep", "0.35"]), options(100)).unwrap();

        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.signal, None);
        assert_eq!(report.root.command, command(&["sleep", "0.35"]));

        let samples = report.root.samples.len();
        assert!((2..=4).contains(&samples), "got {} samples", samples);
        assert!(report.clock_duration_s >= 0.3);
        assert!(report.clock_duration_s < 0.6);
        assert_eq!(report.root.spawned_at_iteration, 0);
        assert!(report.root.terminated_at_iteration >= samples as u64);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_samples_have_increasing_ticks() {
        let report = run(&command(&["sleep", "0.3"]), options(50)).unwrap();

        let ticks: Vec<u64> = report.root.samples.iter().map(|s| s.metrics.iteration).collect();
        assert!(!ticks.is_empty());
        assert!(ticks.windows(2).all(|w| w[0] < w[1]));
        for sample in &report.root.samples {
            assert!(sample.metrics.memory.rss > 0);
            assert!(sample.metrics.threads >= 1);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_child_outliving_root_is_truncated() {
        let report = run(
            &command(&["sh", "-c", "sleep 0.8 & sleep 0.3"]),
            options(100),
        )
        .unwrap();

        let root_end = report.root.terminated_at_iteration;
        let background = report
            .iter_processes()
            .find(|p| p.command == command(&["sleep", "0.8"]))
            .expect("background sleep tracked");

        assert_eq!(background.terminated_at_iteration, root_end);
        assert!(report.clock_duration_s < 0.7);
        for process in report.iter_processes() {
            assert!(process.terminated_at_iteration >= process.spawned_at_iteration);
            assert!(process.terminated_at_iteration <= root_end);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_zero_exit_is_data() {
        let report = run(&command(&["sh", "-c", "exit 3"]), options(100)).unwrap();
        assert_eq!(report.exit_code, Some(3));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_environment_overlay_reaches_program() {
        let report = run(
            &command(&["sh", "-c", "test \"$OMP_NUM_THREADS\" = 6"]),
            options(100).with_parallelism(6),
        )
        .unwrap();
        assert_eq!(report.exit_code, Some(0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_aggregate_usage_counts_busy_work() {
        let report = run(
            &command(&["sh", "-c", "i=0; while [ $i -lt 200000 ]; do i=$((i+1)); done"]),
            options(100),
        )
        .unwrap();

        assert!(report.usage.user_time_s + report.usage.system_time_s > 0.0);
    }

    struct SteppedAccounting {
        readings: Vec<ResourceUsage>,
    }

    impl Accounting for SteppedAccounting {
        fn children_usage(&mut self) -> io::Result<ResourceUsage> {
            if self.readings.is_empty() {
                return Err(io::Error::new(io::ErrorKind::Other, "no more readings"));
            }
            Ok(self.readings.remove(0))
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_usage_is_difference_of_readings() {
        let mut accounting = SteppedAccounting {
            readings: vec![
                ResourceUsage {
                    user_time_s: 1.0,
                    output_blocks: 10,
                    ..Default::default()
                },
                ResourceUsage {
                    user_time_s: 3.5,
                    output_blocks: 14,
                    ..Default::default()
                },
            ],
        };
        let mut source = SystemSource::new();
        let mut runner = Runner::new(options(100)).unwrap();

        let report = runner
            .run_with(&command(&["true"]), &mut source, &mut accounting)
            .unwrap();

        assert_eq!(report.usage.user_time_s, 2.5);
        assert_eq!(report.usage.output_blocks, 4);
    }

    #[test]
    fn test_accounting_failure_before_spawn() {
        let mut accounting = SteppedAccounting { readings: vec![] };
        let mut source = SystemSource::new();
        let mut runner = Runner::new(options(100)).unwrap();

        let result = runner.run_with(&command(&["true"]), &mut source, &mut accounting);
        assert!(matches!(result, Err(MonitorError::Accounting(_))));
    }

    struct NoAcceleratorProcesses;

    impl AcceleratorSampler for NoAcceleratorProcesses {
        fn sample(&mut self) -> std::result::Result<HashMap<u32, AcceleratorUsage>, AcceleratorError> {
            Ok(HashMap::new())
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_accelerator_fields_default_to_zero() {
        let mut runner = Runner::new(options(50))
            .unwrap()
            .with_accelerator_sampler(Box::new(NoAcceleratorProcesses));
        assert!(runner.options().track_accelerator);

        let report = runner.run(&command(&["sleep", "0.2"])).unwrap();

        assert!(!report.root.samples.is_empty());
        for sample in &report.root.samples {
            assert_eq!(sample.metrics.accelerator, Some(AcceleratorUsage::default()));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_accelerator_tool_cost_kept_apart() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("fake-smi");
        std::fs::write(
            &tool,
            "#!/bin/sh\ni=0\nwhile [ $i -lt 30000 ]; do i=$((i+1)); done\n",
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let sampler = NvidiaSmiSampler::with_program(tool.to_string_lossy());
        let mut runner = Runner::new(options(100))
            .unwrap()
            .with_accelerator_sampler(Box::new(sampler));

        let report = runner.run(&command(&["sleep", "0.5"])).unwrap();

        let tool_cpu = report.sampler_usage.user_time_s + report.sampler_usage.system_time_s;
        let tree_cpu = report.usage.user_time_s + report.usage.system_time_s;
        assert!(tool_cpu > 0.0);
        assert!(report.sampler_usage.minor_page_faults > 0);
        // sleep itself barely runs
        assert!(tree_cpu < tool_cpu, "tree {} vs tool {}", tree_cpu, tool_cpu);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_busy_child_cpu_percent_matches_cpu_time() {
        let report = run(
            &command(&["timeout", "0.8", "sh", "-c", "while :; do :; done"]),
            options(100),
        )
        .unwrap();

        // timeout forwards SIGTERM and reports 124
        assert_eq!(report.exit_code, Some(124));

        let busy = report
            .iter_processes()
            .find(|p| p.command.first().map(String::as_str) == Some("sh"))
            .expect("busy shell tracked");
        let samples = &busy.samples;
        assert!(samples.len() >= 3, "got {} samples", samples.len());

        let first = &samples[0];
        let last = &samples[samples.len() - 1];
        let wall = last.timestamp_s - first.timestamp_s;
        let rate = 100.0 * (last.metrics.cpu_time_s() - first.metrics.cpu_time_s()) / wall;

        let later = &samples[1..];
        let mean =
            later.iter().map(|s| s.metrics.cpu_percent as f64).sum::<f64>() / later.len() as f64;

        assert!(mean > 10.0, "busy child read {}%", mean);
        assert!(
            (mean - rate).abs() <= 25.0,
            "cpu_percent {} vs cpu time rate {}",
            mean,
            rate
        );
    }
}
