//! Metric Snapshot Source
//!
//! Reads the current OS-level counters of a process and lists its live
//! children. The [`SnapshotSource`] trait is the seam the poller samples
//! through; [`SystemSource`] is the real implementation.
//!
//! `SystemSource` relies on `sysinfo` for the resident/virtual memory and
//! disk usage. On Linux the remaining counters (CPU times, page faults,
//! threads, I/O, context switches, open files) and the parent/child relation
//! come from `procfs`, which also tells "gone" apart from "not allowed".
//!
//! CPU percent is the change in `utime + stime` divided by the wall time
//! between two reads of the same pid, so 100 means one core kept busy over
//! the window. The first read of a pid has no window and reports 0.
//! Elsewhere the percentage comes from `sysinfo`.

use std::collections::HashMap;

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System};

use super::error::SampleError;
use super::sample::InstantSample;

/// A live child process as reported by the OS.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildProcess {
    pub pid: u32,
    pub command: Vec<String>,
}

/// Capability for reading instantaneous process metrics.
///
/// `refresh` is called once at the start of every sampling round, before
/// any `sample` or `children` call of that round.
pub trait SnapshotSource {
    /// Prepares one sampling round (e.g. rebuilds the process table).
    fn refresh(&mut self) -> Result<(), SampleError>;

    /// Reads the metrics of one process, tagged with the given tick.
    fn sample(&mut self, pid: u32, iteration: u64) -> Result<InstantSample, SampleError>;

    /// Lists the current direct children of a process.
    fn children(&mut self, pid: u32) -> Result<Vec<ChildProcess>, SampleError>;
}

/// Snapshot source backed by the operating system.
pub struct SystemSource {
    system: System,
    refresh_kind: ProcessRefreshKind,
    /// Parent pid -> (child pid, short name), rebuilt by `refresh`
    parents: HashMap<u32, Vec<(u32, String)>>,
    /// Previous CPU reading of each pid
    #[cfg(target_os = "linux")]
    cpu_baselines: HashMap<u32, linux::CpuBaseline>,
}

impl SystemSource {
    /// Creates a source with an empty process table.
    pub fn new() -> Self {
        let refresh_kind = ProcessRefreshKind::new().with_memory().with_disk_usage();
        #[cfg(not(target_os = "linux"))]
        let refresh_kind = refresh_kind.with_cpu();

        Self {
            system: System::new(),
            refresh_kind,
            parents: HashMap::new(),
            #[cfg(target_os = "linux")]
            cpu_baselines: HashMap::new(),
        }
    }

    fn read(&mut self, pid: u32, iteration: u64) -> Result<InstantSample, SampleError> {
        let sys_pid = Pid::from_u32(pid);

        if !self
            .system
            .refresh_process_specifics(sys_pid, self.refresh_kind)
        {
            return Err(SampleError::NotFound { pid });
        }

        let process = self
            .system
            .process(sys_pid)
            .ok_or(SampleError::NotFound { pid })?;

        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return Err(SampleError::NotFound { pid });
        }

        let mut sample = InstantSample::empty(iteration);
        sample.memory.rss = process.memory();
        sample.memory.vms = process.virtual_memory();

        let disk = process.disk_usage();
        sample.io.read_bytes = disk.total_read_bytes;
        sample.io.write_bytes = disk.total_written_bytes;

        #[cfg(not(target_os = "linux"))]
        {
            // sysinfo averages over the time since this pid's last refresh
            sample.cpu_percent = process.cpu_usage();
        }

        #[cfg(target_os = "linux")]
        {
            let stamp = linux::read_details(pid, &mut sample)?;
            let baseline = linux::CpuBaseline {
                start_time: stamp.start_time,
                cpu_time_s: sample.cpu_time_s(),
                at: stamp.read_at,
            };
            if let Some(previous) = self.cpu_baselines.insert(pid, baseline) {
                sample.cpu_percent = previous.percent_at(&baseline);
            }
        }

        Ok(sample)
    }

    #[cfg(target_os = "linux")]
    fn rebuild_parent_index(&mut self) -> Result<(), SampleError> {
        self.parents = linux::parent_index()?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn rebuild_parent_index(&mut self) -> Result<(), SampleError> {
        self.system.refresh_processes_specifics(self.refresh_kind);

        self.parents.clear();
        for (pid, process) in self.system.processes() {
            if let Some(parent) = process.parent() {
                self.parents
                    .entry(parent.as_u32())
                    .or_default()
                    .push((pid.as_u32(), process.name().to_string()));
            }
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn command_of(&self, pid: u32, name: &str) -> Vec<String> {
        match linux::cmdline(pid) {
            Some(cmd) if !cmd.is_empty() => cmd,
            _ => vec![name.to_string()],
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn command_of(&self, pid: u32, name: &str) -> Vec<String> {
        match self.system.process(Pid::from_u32(pid)) {
            Some(process) if !process.cmd().is_empty() => process.cmd().to_vec(),
            _ => vec![name.to_string()],
        }
    }
}

impl Default for SystemSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotSource for SystemSource {
    fn refresh(&mut self) -> Result<(), SampleError> {
        self.rebuild_parent_index()
    }

    fn sample(&mut self, pid: u32, iteration: u64) -> Result<InstantSample, SampleError> {
        let result = self.read(pid, iteration);

        #[cfg(target_os = "linux")]
        {
            if matches!(result, Err(SampleError::NotFound { .. })) {
                self.cpu_baselines.remove(&pid);
            }
        }

        result
    }

    fn children(&mut self, pid: u32) -> Result<Vec<ChildProcess>, SampleError> {
        let Some(entries) = self.parents.get(&pid) else {
            return Ok(Vec::new());
        };

        Ok(entries
            .iter()
            .map(|(child, name)| ChildProcess {
                pid: *child,
                command: self.command_of(*child, name),
            })
            .collect())
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::HashMap;
    use std::time::Instant;

    use procfs::process::Process;
    use procfs::ProcError;

    use super::super::error::SampleError;
    use super::super::sample::{ContextSwitches, InstantSample, IoCounters, MemoryInfo};

    /// Maps a procfs failure onto the three sampling outcomes.
    pub(super) fn classify(pid: u32, err: ProcError) -> SampleError {
        match err {
            ProcError::NotFound(_) | ProcError::Incomplete(_) => SampleError::NotFound { pid },
            ProcError::PermissionDenied(_) => SampleError::PermissionDenied { pid },
            ProcError::Io(ref io, _) if io.raw_os_error() == Some(libc::ESRCH) => {
                SampleError::NotFound { pid }
            }
            other => SampleError::unexpected(pid, other),
        }
    }

    /// CPU time of one process at one instant.
    #[derive(Debug, Clone, Copy)]
    pub(super) struct CpuBaseline {
        /// Start time in clock ticks since boot, tells a reused pid apart
        pub start_time: u64,
        pub cpu_time_s: f64,
        pub at: Instant,
    }

    impl CpuBaseline {
        /// Percent of one core used between this reading and `later`.
        ///
        /// 0 when `later` belongs to another process that reused the pid,
        /// or when no wall time has passed.
        pub fn percent_at(&self, later: &CpuBaseline) -> f32 {
            if later.start_time != self.start_time {
                return 0.0;
            }

            let wall = later.at.saturating_duration_since(self.at).as_secs_f64();
            if wall <= 0.0 {
                return 0.0;
            }

            let cpu = (later.cpu_time_s - self.cpu_time_s).max(0.0);
            (cpu / wall * 100.0) as f32
        }
    }

    /// When and for which incarnation of a pid the `stat` read happened.
    pub(super) struct StatStamp {
        pub start_time: u64,
        pub read_at: Instant,
    }

    /// Fills the Linux-only counters of `sample` from `/proc/<pid>`.
    ///
    /// `stat` is read once and every field derived from it comes from that
    /// single read, so CPU times, faults and threads are mutually consistent.
    pub(super) fn read_details(pid: u32, sample: &mut InstantSample) -> Result<StatStamp, SampleError> {
        let process = Process::new(pid as i32).map_err(|e| classify(pid, e))?;
        let stat = process.stat().map_err(|e| classify(pid, e))?;
        let read_at = Instant::now();

        if matches!(stat.state, 'Z' | 'X' | 'x') {
            return Err(SampleError::NotFound { pid });
        }

        let ticks = procfs::ticks_per_second() as f64;
        let page_size = procfs::page_size();

        sample.user_time_s = stat.utime as f64 / ticks;
        sample.system_time_s = stat.stime as f64 / ticks;
        sample.minor_page_faults = stat.minflt;
        sample.major_page_faults = stat.majflt;
        sample.threads = stat.num_threads.max(0) as u64;

        let statm = process.statm().map_err(|e| classify(pid, e))?;
        let status = process.status().map_err(|e| classify(pid, e))?;
        sample.memory = MemoryInfo {
            rss: statm.resident * page_size,
            vms: statm.size * page_size,
            shared: statm.shared * page_size,
            text: statm.text * page_size,
            data: statm.data * page_size,
            swap: status.vmswap.unwrap_or(0) * 1024,
        };
        sample.context_switches = ContextSwitches {
            voluntary: status.voluntary_ctxt_switches.unwrap_or(0),
            involuntary: status.nonvoluntary_ctxt_switches.unwrap_or(0),
        };

        let io = process.io().map_err(|e| classify(pid, e))?;
        sample.io = IoCounters {
            read_count: io.syscr,
            write_count: io.syscw,
            read_bytes: io.read_bytes,
            write_bytes: io.write_bytes,
            read_chars: io.rchar,
            write_chars: io.wchar,
        };

        sample.open_files = process.fd_count().map_err(|e| classify(pid, e))? as u64;

        Ok(StatStamp {
            start_time: stat.starttime,
            read_at,
        })
    }

    /// Builds the parent pid -> children index from every process in `/proc`.
    ///
    /// Processes that vanish during the scan are skipped.
    pub(super) fn parent_index() -> Result<HashMap<u32, Vec<(u32, String)>>, SampleError> {
        let mut index: HashMap<u32, Vec<(u32, String)>> = HashMap::new();

        let processes = procfs::process::all_processes().map_err(|e| classify(0, e))?;
        for process in processes.flatten() {
            let Ok(stat) = process.stat() else {
                continue;
            };
            if stat.ppid > 0 {
                index
                    .entry(stat.ppid as u32)
                    .or_default()
                    .push((stat.pid as u32, stat.comm));
            }
        }

        Ok(index)
    }

    pub(super) fn cmdline(pid: u32) -> Option<Vec<String>> {
        Process::new(pid as i32).and_then(|p| p.cmdline()).ok()
    }
}
