//! Accelerator Sampling
//!
//! Per-process GPU usage is obtained from an external tool, invoked at most
//! once per tick for the whole process tree. A pid absent from the tool's
//! latest output simply has zero usage.

use std::collections::HashMap;
use std::io;
use std::process::Command;

use log::{debug, warn};
use thiserror::Error;

use super::sample::AcceleratorUsage;

/// Failure of one accelerator sampler invocation.
#[derive(Error, Debug)]
pub enum AcceleratorError {
    #[error("accelerator sampling tool is not available")]
    Unavailable,

    #[error("accelerator sampling tool failed: {0}")]
    Failed(String),

    #[error("I/O error running the accelerator sampling tool: {0}")]
    Io(#[from] io::Error),
}

/// Source of per-process accelerator usage.
pub trait AcceleratorSampler {
    /// Returns the usage of every process currently using an accelerator.
    fn sample(&mut self) -> Result<HashMap<u32, AcceleratorUsage>, AcceleratorError>;
}

/// Samples NVIDIA GPUs through `nvidia-smi pmon`.
pub struct NvidiaSmiSampler {
    program: String,
    available: bool,
}

impl NvidiaSmiSampler {
    /// Creates a sampler using `nvidia-smi` from `PATH`.
    pub fn new() -> Self {
        Self::with_program("nvidia-smi")
    }

    /// Creates a sampler running the given executable instead.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            available: true,
        }
    }
}

impl Default for NvidiaSmiSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceleratorSampler for NvidiaSmiSampler {
    fn sample(&mut self) -> Result<HashMap<u32, AcceleratorUsage>, AcceleratorError> {
        if !self.available {
            return Err(AcceleratorError::Unavailable);
        }

        let output = match Command::new(&self.program)
            .args(["pmon", "-c", "1", "-s", "um"])
            .output()
        {
            Ok(output) => output,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "'{}' not found; accelerator usage will be reported as zero",
                    self.program
                );
                self.available = false;
                return Err(AcceleratorError::Unavailable);
            }
            Err(e) => return Err(e.into()),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AcceleratorError::Failed(stderr.trim().to_string()));
        }

        let usage = parse_pmon(&String::from_utf8_lossy(&output.stdout));
        debug!("Accelerator usage reported for {} process(es)", usage.len());
        Ok(usage)
    }
}

/// Parses the table printed by `nvidia-smi pmon -s um`.
///
/// Columns are located through the `# gpu pid ...` header line. `-` cells
/// count as zero and a pid using several GPUs has its usage summed.
pub fn parse_pmon(text: &str) -> HashMap<u32, AcceleratorUsage> {
    let mut usage: HashMap<u32, AcceleratorUsage> = HashMap::new();
    let mut columns: Option<(usize, Option<usize>, Option<usize>)> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(header) = trimmed.strip_prefix('#') {
            let names: Vec<&str> = header.split_whitespace().collect();
            if let Some(pid_col) = names.iter().position(|n| *n == "pid") {
                columns = Some((
                    pid_col,
                    names.iter().position(|n| *n == "sm"),
                    names.iter().position(|n| *n == "fb"),
                ));
            }
            continue;
        }

        let Some((pid_col, sm_col, fb_col)) = columns else {
            continue;
        };

        let cells: Vec<&str> = trimmed.split_whitespace().collect();
        let Some(pid) = cells.get(pid_col).and_then(|c| c.parse::<u32>().ok()) else {
            continue;
        };

        let sm = sm_col.map(|i| parse_cell::<f32>(cells.get(i))).unwrap_or(0.0);
        let fb_mib = fb_col.map(|i| parse_cell::<u64>(cells.get(i))).unwrap_or(0);

        let entry = usage.entry(pid).or_default();
        entry.utilization_percent += sm;
        entry.memory_bytes += fb_mib * 1024 * 1024;
    }

    usage
}

fn parse_cell<T: std::str::FromStr + Default>(cell: Option<&&str>) -> T {
    cell.and_then(|c| c.parse().ok()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PMON_OUTPUT: &str = "\
# gpu         pid   type     sm    mem    enc    dec     fb   command
# Idx           #    C/G      %      %      %      %     MB   name
    0        1234     C     45     12      -      -    300   python
    0        5678     C      -      -      -      -     20   worker
    1        1234     C     10      3      -      -    100   python
    1           -     -      -      -      -      -      -   -
";

    #[test]
    fn test_parse_pmon() {
        let usage = parse_pmon(PMON_OUTPUT);

        assert_eq!(usage.len(), 2);

        let python = usage.get(&1234).unwrap();
        assert_eq!(python.utilization_percent, 55.0);
        assert_eq!(python.memory_bytes, 400 * 1024 * 1024);

        let worker = usage.get(&5678).unwrap();
        assert_eq!(worker.utilization_percent, 0.0);
        assert_eq!(worker.memory_bytes, 20 * 1024 * 1024);
    }

    #[test]
    fn test_parse_pmon_without_header() {
        let usage = parse_pmon("    0   1234   C   45   12   -   -   300   python\n");
        assert!(usage.is_empty());
    }

    #[test]
    fn test_parse_pmon_empty() {
        assert!(parse_pmon("").is_empty());
    }

    #[test]
    fn test_parse_pmon_without_fb_column() {
        let text = "# gpu pid type sm mem enc dec command\n 0 42 C 7 1 - - app\n";
        let usage = parse_pmon(text);

        assert_eq!(usage.get(&42).unwrap().utilization_percent, 7.0);
        assert_eq!(usage.get(&42).unwrap().memory_bytes, 0);
    }

    #[test]
    fn test_missing_tool_is_unavailable() {
        let mut sampler = NvidiaSmiSampler::with_program("definitely-not-a-real-nvidia-smi");

        assert!(matches!(sampler.sample(), Err(AcceleratorError::Unavailable)));
        // Second call does not try to run the tool again
        assert!(!sampler.available);
        assert!(matches!(sampler.sample(), Err(AcceleratorError::Unavailable)));
    }
}
