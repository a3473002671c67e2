//! Tick Scheduler
//!
//! Drives fixed-cadence sampling of a process tree until its root exits.
//!
//! Tick `k` is due at `t0 + k * interval`. Each tick first waits for the
//! root to exit, with a timeout reaching up to the deadline. If the root
//! exited, the kernel's aggregate counters are read immediately and the
//! loop ends; otherwise one sampling round runs over every tracked process.
//!
//! When a round overruns and the next deadline is already past, the loop
//! skips forward to the first future deadline and logs a warning. The tick
//! counter still advances by one, so `iteration * interval` is only an
//! approximation from then on; each skip is listed in the result.
//!
//! Running the accelerator tool reaps a child of this process, which the
//! kernel adds to the same totals as the monitored tree. Accounting is
//! therefore read around every tool run and that share is kept apart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::accelerator::{AcceleratorError, AcceleratorSampler};
use super::error::{MonitorError, Result, SampleError};
use super::registry::{ProcessId, ProcessRegistry};
use super::report::SkippedDeadlines;
use super::rusage::{Accounting, AggregateUsage, ResourceUsage};
use super::sample::AcceleratorUsage;
use super::source::SnapshotSource;
use super::spawn::{ExitOutcome, ProcessHandle};

/// Wall-clock source, measuring time since the run started.
pub trait Clock {
    fn elapsed(&self) -> Duration;
}

/// Clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    /// Starts measuring now.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// How and when the root process ended.
#[derive(Debug, Clone, PartialEq)]
pub struct Termination {
    pub outcome: ExitOutcome,
    /// Tick during whose wait the root exited
    pub iteration: u64,
    /// Aggregate counters read right after reaping the root
    pub usage_after: ResourceUsage,
    /// Clock reading right after reaping the root
    pub elapsed: Duration,
    pub missed_deadlines: Vec<SkippedDeadlines>,
    /// Part of the totals caused by accelerator tool runs
    pub sampler_usage: AggregateUsage,
}

/// Samples a process tree on a fixed schedule.
pub struct Poller<'a> {
    interval: Duration,
    clock: &'a dyn Clock,
    source: &'a mut dyn SnapshotSource,
    accounting: &'a mut dyn Accounting,
    accelerator: Option<&'a mut dyn AcceleratorSampler>,
    root_pid: Option<u32>,
    missed_deadlines: Vec<SkippedDeadlines>,
    sampler_usage: AggregateUsage,
}

impl<'a> Poller<'a> {
    pub fn new(
        interval: Duration,
        clock: &'a dyn Clock,
        source: &'a mut dyn SnapshotSource,
        accounting: &'a mut dyn Accounting,
    ) -> Self {
        Self {
            interval,
            clock,
            source,
            accounting,
            accelerator: None,
            root_pid: None,
            missed_deadlines: Vec::new(),
            sampler_usage: AggregateUsage::default(),
        }
    }

    /// Also queries per-process accelerator usage, once per tick.
    pub fn with_accelerator(mut self, sampler: &'a mut dyn AcceleratorSampler) -> Self {
        self.accelerator = Some(sampler);
        self
    }

    /// Registers the root at tick 0 and takes its throw-away first read.
    pub fn start(
        &mut self,
        registry: &mut ProcessRegistry,
        pid: u32,
        command: Vec<String>,
    ) -> Result<ProcessId> {
        let id = registry.register(pid, command, None, 0);
        self.root_pid = Some(pid);
        self.prime(registry, id, 0)?;
        Ok(id)
    }

    /// Runs ticks until the root process exits.
    ///
    /// Every process still tracked at that point stops being monitored at
    /// the terminal tick; none of them is signalled.
    pub fn drive(
        &mut self,
        root: &mut dyn ProcessHandle,
        registry: &mut ProcessRegistry,
    ) -> Result<Termination> {
        if self.root_pid.is_none() {
            self.root_pid = Some(root.pid());
        }

        let mut iteration: u64 = 0;
        let mut deadline_index: u64 = 0;

        loop {
            iteration += 1;
            deadline_index += 1;

            let deadline = self.next_deadline(&mut deadline_index, iteration);

            if let Some(outcome) = self.wait_until(root, deadline)? {
                // Read before anything else can reap another child and pollute the totals
                let usage_after = self
                    .accounting
                    .children_usage()
                    .map_err(MonitorError::Accounting)?;
                let elapsed = self.clock.elapsed();

                registry.unregister_all(iteration);

                return Ok(Termination {
                    outcome,
                    iteration,
                    usage_after,
                    elapsed,
                    missed_deadlines: std::mem::take(&mut self.missed_deadlines),
                    sampler_usage: self.sampler_usage,
                });
            }

            debug!(
                "pid {} still running after {:.4}s (tick {})",
                root.pid(),
                self.clock.elapsed().as_secs_f64(),
                iteration
            );
            self.sampling_round(registry, iteration)?;
        }
    }

    /// Time from spawn to deadline `index`, saturating instead of wrapping.
    fn deadline_at(&self, index: u64) -> Duration {
        let nanos = self.interval.as_nanos().saturating_mul(u128::from(index));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Returns the deadline for this tick, skipping those already past.
    fn next_deadline(&mut self, deadline_index: &mut u64, iteration: u64) -> Duration {
        let now = self.clock.elapsed();
        let deadline = self.deadline_at(*deadline_index);

        if deadline > now {
            return deadline;
        }

        let first_missed = *deadline_index;
        let elapsed_deadlines = now.as_nanos() / self.interval.as_nanos().max(1);
        let next = u64::try_from(elapsed_deadlines)
            .unwrap_or(u64::MAX)
            .saturating_add(1)
            .max(first_missed.saturating_add(1));
        *deadline_index = next;

        let skip = SkippedDeadlines {
            tick: iteration,
            first_deadline_index: first_missed,
            count: next.saturating_sub(first_missed),
        };
        warn!(
            "Sampling overran the {:?} interval by {:?} before tick {}; skipping {} deadline(s) from #{}, later timestamps are approximate",
            self.interval,
            now - deadline,
            iteration,
            skip.count,
            skip.first_deadline_index
        );
        self.missed_deadlines.push(skip);

        self.deadline_at(next)
    }

    /// Waits for the root to exit, returning early only on exit.
    fn wait_until(
        &mut self,
        root: &mut dyn ProcessHandle,
        deadline: Duration,
    ) -> Result<Option<ExitOutcome>> {
        loop {
            let remaining = deadline.saturating_sub(self.clock.elapsed());
            let outcome = root.wait_timeout(remaining).map_err(MonitorError::Wait)?;

            if outcome.is_some() || self.clock.elapsed() >= deadline {
                return Ok(outcome);
            }
        }
    }

    /// Samples every live process once, then discovers their new children.
    fn sampling_round(&mut self, registry: &mut ProcessRegistry, iteration: u64) -> Result<()> {
        self.source.refresh()?;
        let accelerator = self.sample_accelerator()?;

        for pid in registry.live_pids() {
            let Some(id) = registry.live_id(pid) else {
                continue;
            };

            if !registry[id].primed {
                self.prime(registry, id, iteration)?;
                continue;
            }

            match self.source.sample(pid, iteration) {
                Ok(mut sample) => {
                    if let Some(usage) = &accelerator {
                        sample.accelerator = Some(usage.get(&pid).copied().unwrap_or_default());
                    }
                    registry.record_sample(id, sample);
                    self.discover(registry, id, iteration)?;
                }
                Err(e) => self.handle_failed_read(registry, e, iteration)?,
            }
        }

        Ok(())
    }

    /// Takes the first read of a process and discards it.
    ///
    /// CPU percentages are averaged since the previous read, so the first
    /// one has no window and is meaningless. Children found under a freshly
    /// primed process are primed in turn within the same tick.
    fn prime(
        &mut self,
        registry: &mut ProcessRegistry,
        id: ProcessId,
        iteration: u64,
    ) -> Result<()> {
        let pid = registry[id].pid;

        match self.source.sample(pid, iteration) {
            Ok(_) => {
                registry.mark_primed(id);
                self.discover(registry, id, iteration)
            }
            Err(e) => self.handle_failed_read(registry, e, iteration),
        }
    }

    fn discover(
        &mut self,
        registry: &mut ProcessRegistry,
        id: ProcessId,
        iteration: u64,
    ) -> Result<()> {
        let discovered = match registry.discover_children(id, &mut *self.source, iteration) {
            Ok(discovered) => discovered,
            Err(e @ SampleError::Unexpected { .. }) => return Err(e.into()),
            Err(e) => {
                debug!("Skipping child discovery at tick {}: {}", iteration, e);
                return Ok(());
            }
        };

        for child in discovered {
            self.prime(registry, child, iteration)?;
        }
        Ok(())
    }

    fn handle_failed_read(
        &mut self,
        registry: &mut ProcessRegistry,
        err: SampleError,
        iteration: u64,
    ) -> Result<()> {
        match err {
            SampleError::NotFound { pid } if Some(pid) == self.root_pid => {
                // The root's end is recorded by the wait, together with the totals
                debug!("Root pid {} is exiting (tick {})", pid, iteration);
                Ok(())
            }
            SampleError::NotFound { pid } => {
                registry.unregister(pid, iteration);
                Ok(())
            }
            SampleError::PermissionDenied { pid } => {
                warn!(
                    "Permission denied reading pid {} at tick {}; no sample for this tick",
                    pid, iteration
                );
                Ok(())
            }
            err => Err(err.into()),
        }
    }

    /// Invokes the accelerator sampler once for the whole tree.
    ///
    /// `None` when tracking is disabled; an empty map when the sampler
    /// failed, so every process gets zero usage.
    fn sample_accelerator(&mut self) -> Result<Option<HashMap<u32, AcceleratorUsage>>> {
        let Some(sampler) = self.accelerator.as_mut() else {
            return Ok(None);
        };

        let before = self
            .accounting
            .children_usage()
            .map_err(MonitorError::Accounting)?;
        let result = sampler.sample();
        let after = self
            .accounting
            .children_usage()
            .map_err(MonitorError::Accounting)?;
        self.sampler_usage.add(&after.since(&before));

        match result {
            Ok(usage) => Ok(Some(usage)),
            Err(AcceleratorError::Unavailable) => Ok(Some(HashMap::new())),
            Err(e) => {
                warn!("Accelerator sampling failed: {}", e);
                Ok(Some(HashMap::new()))
            }
        }
    }
}
