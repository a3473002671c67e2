//! Process Registry
//!
//! Every process ever observed during a run lives in an arena, indexed by
//! position. A separate live index maps OS pids to arena slots for the
//! processes still being watched. Children are recorded as arena slots in
//! their parent's list, so a pid reused by the OS after its first owner
//! exited gets a fresh record instead of corrupting history.

use std::collections::HashMap;
use std::ops::Index;

use log::debug;

use super::error::SampleError;
use super::sample::InstantSample;
use super::source::SnapshotSource;

/// Arena slot of a monitored process.
pub type ProcessId = usize;

/// A process observed during the run.
#[derive(Debug, Clone)]
pub struct MonitoredProcess {
    pub pid: u32,
    pub command: Vec<String>,
    pub spawned_at_iteration: u64,
    /// Set exactly once, when monitoring of this process stops
    pub terminated_at_iteration: Option<u64>,
    pub children: Vec<ProcessId>,
    pub samples: Vec<InstantSample>,
    /// True once the throw-away first read has been taken
    pub primed: bool,
}

impl MonitoredProcess {
    fn new(pid: u32, command: Vec<String>, iteration: u64) -> Self {
        Self {
            pid,
            command,
            spawned_at_iteration: iteration,
            terminated_at_iteration: None,
            children: Vec::new(),
            samples: Vec::new(),
            primed: false,
        }
    }

    /// Returns true while the process is still being monitored.
    pub fn is_live(&self) -> bool {
        self.terminated_at_iteration.is_none()
    }
}

/// Registry of all processes of one run.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    records: Vec<MonitoredProcess>,
    live: HashMap<u32, ProcessId>,
}

impl ProcessRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `pid`, attaching it to its parent if the parent is live.
    ///
    /// Registering a pid that is already live returns the existing record.
    pub fn register(
        &mut self,
        pid: u32,
        command: Vec<String>,
        parent_pid: Option<u32>,
        iteration: u64,
    ) -> ProcessId {
        if let Some(&id) = self.live.get(&pid) {
            return id;
        }

        let id = self.records.len();
        self.records.push(MonitoredProcess::new(pid, command, iteration));
        self.live.insert(pid, id);

        if let Some(parent) = parent_pid.and_then(|p| self.live.get(&p).copied()) {
            self.records[parent].children.push(id);
        }

        debug!(
            "Tracking pid {} ({:?}) from tick {}",
            pid, self.records[id].command, iteration
        );
        id
    }

    /// Stops tracking `pid` at the given tick. History is kept.
    ///
    /// Returns false when the pid was not live.
    pub fn unregister(&mut self, pid: u32, iteration: u64) -> bool {
        let Some(id) = self.live.remove(&pid) else {
            return false;
        };

        let record = &mut self.records[id];
        // A record leaves the live index exactly once, so this is its only assignment
        record.terminated_at_iteration = Some(iteration.max(record.spawned_at_iteration));
        debug!("Stopped tracking pid {} at tick {}", pid, iteration);
        true
    }

    /// Stops tracking every process still live, at the given tick.
    pub fn unregister_all(&mut self, iteration: u64) {
        for pid in self.live_pids() {
            self.unregister(pid, iteration);
        }
    }

    /// Registers every OS-reported child of `id` not already tracked.
    ///
    /// Returns the slots of the newly registered children.
    pub fn discover_children<S: SnapshotSource + ?Sized>(
        &mut self,
        id: ProcessId,
        source: &mut S,
        iteration: u64,
    ) -> Result<Vec<ProcessId>, SampleError> {
        let parent_pid = self.records[id].pid;
        let mut discovered = Vec::new();

        for child in source.children(parent_pid)? {
            if self.live.contains_key(&child.pid) {
                continue;
            }
            discovered.push(self.register(child.pid, child.command, Some(parent_pid), iteration));
        }

        Ok(discovered)
    }

    /// Appends a sample to a process's series.
    pub fn record_sample(&mut self, id: ProcessId, sample: InstantSample) {
        self.records[id].samples.push(sample);
    }

    /// Marks a process's first read as taken.
    pub fn mark_primed(&mut self, id: ProcessId) {
        self.records[id].primed = true;
    }

    /// Looks up a live process by pid.
    pub fn live_id(&self, pid: u32) -> Option<ProcessId> {
        self.live.get(&pid).copied()
    }

    /// Returns a snapshot of the live pids, in registration order.
    pub fn live_pids(&self) -> Vec<u32> {
        let mut ids: Vec<ProcessId> = self.live.values().copied().collect();
        ids.sort_unstable();
        ids.into_iter().map(|id| self.records[id].pid).collect()
    }

    /// Number of processes still live.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Number of processes ever tracked.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: ProcessId) -> Option<&MonitoredProcess> {
        self.records.get(id)
    }

    /// The first registered process, if any.
    pub fn root(&self) -> Option<&MonitoredProcess> {
        self.records.first()
    }
}

impl Index<ProcessId> for ProcessRegistry {
    type Output = MonitoredProcess;

    fn index(&self, id: ProcessId) -> &MonitoredProcess {
        &self.records[id]
    }
}
