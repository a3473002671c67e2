//! Size Calibration
//!
//! Finds the integer size argument that makes a program run for about a
//! target duration. The size is doubled from 1 until the program is slow
//! enough, then bisected between the last two sizes tried.

use std::time::Duration;

use log::{debug, info};
use thiserror::Error;

use crate::monitor::{self, MonitorError, MonitorOptions};

/// Sizes at or above this make the program "too quick" to calibrate.
pub const MAX_SIZE: u64 = 1 << 30;

/// Errors that can occur during calibration.
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("program is too quick: still under target at size {}", MAX_SIZE)]
    TooQuick,

    #[error("measurement failed: {0}")]
    Measure(#[from] MonitorError),

    #[error("program exited with code {code:?} (signal {signal:?}) at size {size}")]
    NonZeroExit {
        size: u64,
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("target duration must be positive and tolerance non-negative")]
    InvalidTarget,
}

/// Searches the size whose measured duration is within `tolerance`
/// (relative) of `target`.
///
/// `measure` runs the program at one size and returns its duration.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use bottlenecks::calibrate::calibrate;
///
/// // A program taking one millisecond per unit of size
/// let size = calibrate(Duration::from_secs(1), 0.05, |size| {
///     Ok(Duration::from_millis(size))
/// })
/// .unwrap();
///
/// assert_eq!(size, 1024);
/// ```
pub fn calibrate<F>(target: Duration, tolerance: f64, mut measure: F) -> Result<u64, CalibrationError>
where
    F: FnMut(u64) -> Result<Duration, CalibrationError>,
{
    if target.is_zero() || !(tolerance >= 0.0) {
        return Err(CalibrationError::InvalidTarget);
    }

    let relative_error =
        |duration: Duration| (duration.as_secs_f64() - target.as_secs_f64()).abs() / target.as_secs_f64();

    let mut lo = 0;
    let mut size = 1;
    let mut duration = measure(size)?;
    debug!("Size {} took {:.3}s", size, duration.as_secs_f64());

    while duration < target {
        lo = size;
        size *= 2;
        if size >= MAX_SIZE {
            return Err(CalibrationError::TooQuick);
        }
        duration = measure(size)?;
        debug!("Size {} took {:.3}s", size, duration.as_secs_f64());
    }

    let mut hi = size;
    while relative_error(duration) > tolerance && hi - lo > 1 {
        size = lo + (hi - lo) / 2;
        duration = measure(size)?;
        debug!("Size {} took {:.3}s", size, duration.as_secs_f64());

        if duration > target {
            hi = size;
        } else {
            lo = size;
        }
    }

    info!(
        "Duration reached: {:.2}s, relative error: {:.2}",
        duration.as_secs_f64(),
        relative_error(duration)
    );
    Ok(size)
}

/// Runs `program size` under monitoring and returns its wall-clock duration.
///
/// A non-zero exit is an error here: its duration says nothing about `size`.
pub fn measure_program(
    program: &str,
    size: u64,
    options: &MonitorOptions,
) -> Result<Duration, CalibrationError> {
    let command = vec![program.to_string(), size.to_string()];
    let report = monitor::run(&command, options.clone())?;

    if report.exit_code != Some(0) {
        return Err(CalibrationError::NonZeroExit {
            size,
            code: report.exit_code,
            signal: report.signal,
        });
    }

    Ok(Duration::from_secs_f64(report.clock_duration_s))
}
