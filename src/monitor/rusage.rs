//! Aggregate Resource Accounting
//!
//! The kernel keeps exact cumulative totals for every terminated and reaped
//! descendant of this process. A run reads them once before spawning and
//! once right after reaping the root; the report carries the difference.

use std::io;
use std::mem::MaybeUninit;

use serde::{Deserialize, Serialize};

/// Raw cumulative counters as returned by one `getrusage` call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub user_time_s: f64,
    pub system_time_s: f64,
    pub minor_page_faults: u64,
    pub major_page_faults: u64,
    pub input_blocks: u64,
    pub output_blocks: u64,
    pub voluntary_context_switches: u64,
    pub involuntary_context_switches: u64,
}

/// Totals for a whole process tree over one run.
///
/// Exact even for descendants that were never sampled individually.
/// `ru_maxrss` and the obsolete `ru_ixrss`-like fields are not reported: the
/// former reflects the largest child ever reaped, not this run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregateUsage {
    pub user_time_s: f64,
    pub system_time_s: f64,
    pub minor_page_faults: u64,
    pub major_page_faults: u64,
    pub input_blocks: u64,
    pub output_blocks: u64,
    pub voluntary_context_switches: u64,
    pub involuntary_context_switches: u64,
}

impl ResourceUsage {
    /// Returns what accumulated between `before` and `self`.
    ///
    /// Counters never decrease, so any negative difference is clamped to zero.
    pub fn since(&self, before: &ResourceUsage) -> AggregateUsage {
        AggregateUsage {
            user_time_s: (self.user_time_s - before.user_time_s).max(0.0),
            system_time_s: (self.system_time_s - before.system_time_s).max(0.0),
            minor_page_faults: self.minor_page_faults.saturating_sub(before.minor_page_faults),
            major_page_faults: self.major_page_faults.saturating_sub(before.major_page_faults),
            input_blocks: self.input_blocks.saturating_sub(before.input_blocks),
            output_blocks: self.output_blocks.saturating_sub(before.output_blocks),
            voluntary_context_switches: self
                .voluntary_context_switches
                .saturating_sub(before.voluntary_context_switches),
            involuntary_context_switches: self
                .involuntary_context_switches
                .saturating_sub(before.involuntary_context_switches),
        }
    }
}

impl AggregateUsage {
    /// Adds `other` to these totals.
    pub fn add(&mut self, other: &AggregateUsage) {
        self.user_time_s += other.user_time_s;
        self.system_time_s += other.system_time_s;
        self.minor_page_faults += other.minor_page_faults;
        self.major_page_faults += other.major_page_faults;
        self.input_blocks += other.input_blocks;
        self.output_blocks += other.output_blocks;
        self.voluntary_context_switches += other.voluntary_context_switches;
        self.involuntary_context_switches += other.involuntary_context_switches;
    }

    /// Returns these totals with `other` taken out, clamped to zero.
    pub fn excluding(&self, other: &AggregateUsage) -> AggregateUsage {
        AggregateUsage {
            user_time_s: (self.user_time_s - other.user_time_s).max(0.0),
            system_time_s: (self.system_time_s - other.system_time_s).max(0.0),
            minor_page_faults: self.minor_page_faults.saturating_sub(other.minor_page_faults),
            major_page_faults: self.major_page_faults.saturating_sub(other.major_page_faults),
            input_blocks: self.input_blocks.saturating_sub(other.input_blocks),
            output_blocks: self.output_blocks.saturating_sub(other.output_blocks),
            voluntary_context_switches: self
                .voluntary_context_switches
                .saturating_sub(other.voluntary_context_switches),
            involuntary_context_switches: self
                .involuntary_context_switches
                .saturating_sub(other.involuntary_context_switches),
        }
    }
}

/// Source of the "resource usage of terminated children" totals.
pub trait Accounting {
    fn children_usage(&mut self) -> io::Result<ResourceUsage>;
}

/// Reads the totals from the kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelAccounting;

impl Accounting for KernelAccounting {
    fn children_usage(&mut self) -> io::Result<ResourceUsage> {
        let mut raw = MaybeUninit::<libc::rusage>::zeroed();

        // SAFETY: getrusage fills the whole struct on success
        let ret = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, raw.as_mut_ptr()) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let raw = unsafe { raw.assume_init() };

        Ok(ResourceUsage {
            user_time_s: timeval_secs(&raw.ru_utime),
            system_time_s: timeval_secs(&raw.ru_stime),
            minor_page_faults: counter(raw.ru_minflt),
            major_page_faults: counter(raw.ru_majflt),
            input_blocks: counter(raw.ru_inblock),
            output_blocks: counter(raw.ru_oublock),
            voluntary_context_switches: counter(raw.ru_nvcsw),
            involuntary_context_switches: counter(raw.ru_nivcsw),
        })
    }
}

fn timeval_secs(tv: &libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}

fn counter(value: libc::c_long) -> u64 {
    value.max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_since_is_a_difference() {
        let before = ResourceUsage {
            user_time_s: 1.0,
            system_time_s: 0.5,
            minor_page_faults: 100,
            major_page_faults: 2,
            input_blocks: 8,
            output_blocks: 16,
            voluntary_context_switches: 30,
            involuntary_context_switches: 4,
        };
        let after = ResourceUsage {
            user_time_s: 3.5,
            system_time_s: 0.75,
            minor_page_faults: 150,
            major_page_faults: 2,
            input_blocks: 10,
            output_blocks: 48,
            voluntary_context_switches: 31,
            involuntary_context_switches: 9,
        };

        let usage = after.since(&before);
        assert_eq!(usage.user_time_s, 2.5);
        assert_eq!(usage.system_time_s, 0.25);
        assert_eq!(usage.minor_page_faults, 50);
        assert_eq!(usage.major_page_faults, 0);
        assert_eq!(usage.input_blocks, 2);
        assert_eq!(usage.output_blocks, 32);
        assert_eq!(usage.voluntary_context_switches, 1);
        assert_eq!(usage.involuntary_context_switches, 5);
    }

    #[test]
    fn test_since_never_negative() {
        let before = ResourceUsage {
            user_time_s: 2.0,
            minor_page_faults: 10,
            ..Default::default()
        };
        let usage = ResourceUsage::default().since(&before);

        assert_eq!(usage.user_time_s, 0.0);
        assert_eq!(usage.minor_page_faults, 0);
    }

    #[test]
    fn test_add_then_exclude() {
        let tool = AggregateUsage {
            user_time_s: 0.25,
            minor_page_faults: 300,
            voluntary_context_switches: 2,
            ..Default::default()
        };
        let mut excluded = AggregateUsage::default();
        excluded.add(&tool);
        excluded.add(&tool);

        let total = AggregateUsage {
            user_time_s: 1.5,
            minor_page_faults: 1000,
            voluntary_context_switches: 3,
            ..Default::default()
        };
        let tree = total.excluding(&excluded);

        assert_eq!(excluded.user_time_s, 0.5);
        assert_eq!(tree.user_time_s, 1.0);
        assert_eq!(tree.minor_page_faults, 400);
        // Clamped rather than wrapped
        assert_eq!(tree.voluntary_context_switches, 0);
    }

    #[test]
    fn test_kernel_accounting_grows_after_reaping_child() {
        let mut accounting = KernelAccounting;
        let before = accounting.children_usage().unwrap();

        let status = Command::new("sh")
            .args(["-c", "i=0; while [ $i -lt 20000 ]; do i=$((i+1)); done"])
            .status()
            .unwrap();
        assert!(status.success());

        let after = accounting.children_usage().unwrap();
        let usage = after.since(&before);

        assert!(after.user_time_s + after.system_time_s >= before.user_time_s + before.system_time_s);
        assert!(usage.minor_page_faults > 0);
    }
}
