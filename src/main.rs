//! Bottlenecks CLI Entry Point
//!
//! Provides command-line interface for parallelism sweeps and calibration.
//!
//! # Usage
//!
//! ```bash
//! # Find the size making ./solver last about 10 seconds
//! bottlenecks calibrate ./solver
//!
//! # Run ./solver 2000 with OMP_NUM_THREADS from 1 to 1.5x the CPU count
//! bottlenecks run ./solver 2000
//!
//! # Restrict the sweep and append the results to a file
//! bottlenecks run ./solver 2000 --min-parallelism 2 --max-parallelism 8 --output runs.jsonl
//! ```

use std::env;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use colored::Colorize;
use log::{info, warn};
use serde::Serialize;

use bottlenecks::calibrate::{calibrate, measure_program};
use bottlenecks::monitor::{self, write_json_line, MonitorOptions, RunReport, MIN_RELIABLE_DURATION};
use bottlenecks::{APP_NAME, VERSION};

/// Default duration targeted by calibration.
const DEFAULT_TARGET_DURATION: Duration = Duration::from_secs(10);

/// Default relative tolerance of calibration.
const DEFAULT_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Run,
    Calibrate,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    mode: Mode,
    program: String,
    size: String,
    min_parallelism: usize,
    max_parallelism: usize,
    interval: Duration,
    gpu: bool,
    output: Option<PathBuf>,
    target_duration: Duration,
    tolerance: f64,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Run,
            program: String::new(),
            size: String::new(),
            min_parallelism: 1,
            max_parallelism: default_max_parallelism(),
            interval: monitor::DEFAULT_INTERVAL,
            gpu: false,
            output: None,
            target_duration: DEFAULT_TARGET_DURATION,
            tolerance: DEFAULT_TOLERANCE,
            verbose: false,
        }
    }
}

/// One line of a sweep's output.
#[derive(Serialize)]
struct SweepRecord<'a> {
    parallelism: usize,
    #[serde(flatten)]
    report: &'a RunReport,
}

/// One and a half threads per CPU, to see the effect of oversubscription.
fn default_max_parallelism() -> usize {
    (num_cpus::get() * 3 / 2).max(1)
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
///
/// Goes to stderr: stdout carries the results.
fn print_banner() {
    eprintln!();
    eprintln!("{} v{}", APP_NAME.bold(), VERSION);
    eprintln!("Process Tree Resource Monitor");
    eprintln!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: bottlenecks run [OPTIONS] <PROGRAM> <SIZE>");
    println!("       bottlenecks calibrate [OPTIONS] <PROGRAM>");
    println!();
    println!("Commands:");
    println!("  run                       Run PROGRAM SIZE once per parallelism, one JSON line per run");
    println!("  calibrate                 Print the SIZE making PROGRAM last about the target duration");
    println!();
    println!("Run options:");
    println!("  --min-parallelism N       First OMP_NUM_THREADS value (default: 1)");
    println!(
        "  --max-parallelism N       Last OMP_NUM_THREADS value (default: {})",
        default_max_parallelism()
    );
    println!("  --interval SECONDS        Sampling interval (default: {})", monitor::DEFAULT_INTERVAL.as_secs_f64());
    println!("  --gpu                     Also sample GPU usage through nvidia-smi");
    println!("  --output FILE             Append results to FILE instead of stdout");
    println!();
    println!("Calibrate options:");
    println!(
        "  --target-duration SECONDS Target duration (default: {})",
        DEFAULT_TARGET_DURATION.as_secs()
    );
    println!("  --tolerance F             Accepted relative error (default: {})", DEFAULT_TOLERANCE);
    println!();
    println!("  --verbose                 Enable debug logging");
    println!("  --help                    Show this help message");
    println!("  --version                 Show version information");
}

fn option_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", name))
}

fn parse_seconds(value: &str, name: &str) -> Result<Duration, String> {
    let seconds: f64 = value
        .parse()
        .map_err(|_| format!("Invalid {} value: {}", name, value))?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(format!("{} must be a positive number of seconds", name));
    }
    Ok(Duration::from_secs_f64(seconds))
}

fn parse_count(value: &str, name: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("Invalid {} value: {}", name, value)),
    }
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positionals: Vec<String> = Vec::new();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--gpu" => {
                config.gpu = true;
            }
            "--min-parallelism" => {
                let value = option_value(args, &mut i, arg)?;
                config.min_parallelism = parse_count(value, arg)?;
            }
            "--max-parallelism" => {
                let value = option_value(args, &mut i, arg)?;
                config.max_parallelism = parse_count(value, arg)?;
            }
            "--interval" => {
                let value = option_value(args, &mut i, arg)?;
                config.interval = parse_seconds(value, arg)?;
            }
            "--output" => {
                let value = option_value(args, &mut i, arg)?;
                config.output = Some(PathBuf::from(value));
            }
            "--target-duration" => {
                let value = option_value(args, &mut i, arg)?;
                config.target_duration = parse_seconds(value, arg)?;
            }
            "--tolerance" => {
                let value = option_value(args, &mut i, arg)?;
                config.tolerance = value
                    .parse::<f64>()
                    .ok()
                    .filter(|t| t.is_finite() && *t >= 0.0)
                    .ok_or_else(|| format!("Invalid --tolerance value: {}", value))?;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => positionals.push(arg.clone()),
        }
        i += 1;
    }

    let mut positionals = positionals.into_iter();
    config.mode = match positionals.next().as_deref() {
        Some("run") => Mode::Run,
        Some("calibrate") => Mode::Calibrate,
        Some(other) => return Err(format!("Unknown command: {}", other)),
        None => return Err("Missing command".to_string()),
    };
    config.program = positionals.next().ok_or("Missing PROGRAM argument")?;
    if config.mode == Mode::Run {
        config.size = positionals.next().ok_or("Missing SIZE argument")?;
    }
    if let Some(extra) = positionals.next() {
        return Err(format!("Unexpected argument: {}", extra));
    }

    if config.min_parallelism > config.max_parallelism {
        return Err(format!(
            "--min-parallelism ({}) is greater than --max-parallelism ({})",
            config.min_parallelism, config.max_parallelism
        ));
    }

    Ok(config)
}

/// Opens the destination of the JSON lines.
fn open_output(path: Option<&PathBuf>) -> io::Result<Box<dyn Write>> {
    match path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            info!("Appending results to {}", path.display());
            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stdout())),
    }
}

/// Runs the program once per parallelism value.
fn run_sweep(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let command = vec![config.program.clone(), config.size.clone()];
    let mut output = open_output(config.output.as_ref())?;

    for parallelism in config.min_parallelism..=config.max_parallelism {
        info!("Running {:?} with {} threads", command, parallelism);

        let options = MonitorOptions::default()
            .with_interval(config.interval)
            .with_accelerator(config.gpu)
            .with_parallelism(parallelism);
        let report = monitor::run(&command, options)?;

        if report.exit_code != Some(0) {
            return Err(format!(
                "{:?} with {} threads failed ({})",
                command,
                parallelism,
                match (report.exit_code, report.signal) {
                    (Some(code), _) => format!("exit code {}", code),
                    (None, Some(signal)) => format!("killed by signal {}", signal),
                    (None, None) => "unknown status".to_string(),
                }
            )
            .into());
        }

        if report.clock_duration_s < MIN_RELIABLE_DURATION.as_secs_f64() {
            warn!(
                "Running {:?} with {} threads took {:.2}s. This is too quick to guarantee accurate measurements",
                command, parallelism, report.clock_duration_s
            );
        } else {
            info!(
                "Running {:?} with {} threads took {:.2}s",
                command, parallelism, report.clock_duration_s
            );
        }

        write_json_line(
            &mut output,
            &SweepRecord {
                parallelism,
                report: &report,
            },
        )?;
        output.flush()?;
    }

    Ok(())
}

/// Prints the calibrated size on stdout.
fn run_calibration(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Calibrating {} for {:.1}s (tolerance {})",
        config.program,
        config.target_duration.as_secs_f64(),
        config.tolerance
    );

    let options = MonitorOptions::default().with_interval(config.interval);
    let size = calibrate(config.target_duration, config.tolerance, |size| {
        measure_program(&config.program, size, &options)
    })?;

    println!("{}", size);
    Ok(())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    match config.mode {
        Mode::Run => run_sweep(&config),
        Mode::Calibrate => run_calibration(&config),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        std::iter::once("bottlenecks")
            .chain(parts.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_run_defaults() {
        let config = parse_arguments(&args(&["run", "./solver", "2000"])).unwrap();

        assert_eq!(config.mode, Mode::Run);
        assert_eq!(config.program, "./solver");
        assert_eq!(config.size, "2000");
        assert_eq!(config.min_parallelism, 1);
        assert_eq!(config.max_parallelism, default_max_parallelism());
        assert_eq!(config.interval, monitor::DEFAULT_INTERVAL);
        assert!(config.output.is_none());
    }

    #[test]
    fn test_parse_run_options() {
        let config = parse_arguments(&args(&[
            "run",
            "--min-parallelism",
            "2",
            "./solver",
            "2000",
            "--max-parallelism",
            "6",
            "--interval",
            "0.25",
            "--gpu",
            "--output",
            "runs.jsonl",
        ]))
        .unwrap();

        assert_eq!(config.min_parallelism, 2);
        assert_eq!(config.max_parallelism, 6);
        assert_eq!(config.interval, Duration::from_millis(250));
        assert!(config.gpu);
        assert_eq!(config.output, Some(PathBuf::from("runs.jsonl")));
    }

    #[test]
    fn test_parse_calibrate() {
        let config = parse_arguments(&args(&[
            "calibrate",
            "./solver",
            "--target-duration",
            "3",
            "--tolerance",
            "0.1",
        ]))
        .unwrap();

        assert_eq!(config.mode, Mode::Calibrate);
        assert_eq!(config.target_duration, Duration::from_secs(3));
        assert_eq!(config.tolerance, 0.1);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&[])).is_err());
        assert!(parse_arguments(&args(&["bench", "./solver"])).is_err());
        assert!(parse_arguments(&args(&["run", "./solver"])).is_err());
        assert!(parse_arguments(&args(&["run", "./solver", "1", "extra"])).is_err());
        assert!(parse_arguments(&args(&["run", "./solver", "1", "--interval", "0"])).is_err());
        assert!(parse_arguments(&args(&["run", "./solver", "1", "--interval"])).is_err());
        assert!(parse_arguments(&args(&["run", "./solver", "1", "--bogus"])).is_err());
        assert!(parse_arguments(&args(&[
            "run",
            "./solver",
            "1",
            "--min-parallelism",
            "4",
            "--max-parallelism",
            "2"
        ]))
        .is_err());
    }

    #[test]
    fn test_sweep_record_is_flat() {
        let report: RunReport = serde_json::from_value(serde_json::json!({
            "command": ["./solver", "10"],
            "started_at": "2024-01-01T00:00:00Z",
            "interval_s": 0.1,
            "exit_code": 0,
            "signal": null,
            "clock_duration_s": 1.5,
            "usage": {
                "user_time_s": 1.0,
                "system_time_s": 0.1,
                "minor_page_faults": 0,
                "major_page_faults": 0,
                "input_blocks": 0,
                "output_blocks": 0,
                "voluntary_context_switches": 0,
                "involuntary_context_switches": 0
            },
            "root": {
                "pid": 1,
                "command": ["./solver", "10"],
                "spawned_at_iteration": 0,
                "terminated_at_iteration": 15,
                "spawned_at_s": 0.0,
                "terminated_at_s": 1.5,
                "samples": [],
                "children": []
            }
        }))
        .unwrap();

        let mut line = Vec::new();
        write_json_line(
            &mut line,
            &SweepRecord {
                parallelism: 3,
                report: &report,
            },
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();

        assert_eq!(value["parallelism"], 3);
        assert_eq!(value["clock_duration_s"], 1.5);
        assert!(value.get("report").is_none());
    }
}
