//! Monitoring Options

use std::collections::BTreeMap;
use std::time::Duration;

/// Default sampling cadence.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Environment variable carrying the parallelism hint to the program.
pub const PARALLELISM_VARIABLE: &str = "OMP_NUM_THREADS";

/// Options for one monitored run.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use bottlenecks::monitor::MonitorOptions;
///
/// let options = MonitorOptions::default()
///     .with_interval(Duration::from_millis(50))
///     .with_parallelism(4);
///
/// assert_eq!(options.environment_overlay["OMP_NUM_THREADS"], "4");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorOptions {
    /// Time between two sampling ticks
    pub interval: Duration,
    /// Whether to query per-process accelerator usage every tick
    pub track_accelerator: bool,
    /// Variables merged over the inherited environment of the root process
    pub environment_overlay: BTreeMap<String, String>,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            track_accelerator: false,
            environment_overlay: BTreeMap::new(),
        }
    }
}

impl MonitorOptions {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_accelerator(mut self, enabled: bool) -> Self {
        self.track_accelerator = enabled;
        self
    }

    /// Adds one variable to the environment overlay.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_overlay.insert(key.into(), value.into());
        self
    }

    /// Passes a thread-count hint to the program through `OMP_NUM_THREADS`.
    pub fn with_parallelism(self, threads: usize) -> Self {
        self.with_env(PARALLELISM_VARIABLE, threads.to_string())
    }
}
