//! Helpers for the command line front end: logger setup and input discovery.

use orchard_pf::config::LoggingConfig;
use std::error::Error;
use std::path::{Path, PathBuf};

/// Install the process logger: records at `logging.level` and above, stamped with the local
/// time and the thread that wrote them, appended to `logging.file` or written to stderr.
///
/// # Errors
/// Returns an error if the log file cannot be opened or a logger is already installed.
pub fn init_logger(logging: &LoggingConfig) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let mut builder = env_logger::Builder::new();
    builder.filter_level(logging.level.filter());
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {} - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            std::thread::current().name().unwrap_or("-"),
            record.args()
        )
    });

    if let Some(log_path) = &logging.file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

/// Logging settings from the configuration file with the command line flags applied on top.
pub fn resolve_logging(
    config: &LoggingConfig,
    level: Option<&str>,
    file: Option<&PathBuf>,
) -> Result<LoggingConfig, Box<dyn Error>> {
    let mut logging = config.clone();
    if let Some(level) = level {
        logging.level = level.parse()?;
    }
    if let Some(file) = file {
        logging.file = Some(file.clone());
    }
    Ok(logging)
}

/// Expand replay inputs into cached log files.
///
/// Files are taken as given; directories contribute their `.json` files in name order.
pub fn collect_logs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, Box<dyn Error>> {
    let mut logs = Vec::new();
    for input in inputs {
        logs.extend(logs_in(input)?);
    }
    if logs.is_empty() {
        return Err("No cached logs given.".into());
    }
    Ok(logs)
}

fn logs_in(input: &Path) -> Result<Vec<PathBuf>, Box<dyn Error>> {
    if input.is_file() {
        Ok(vec![input.to_path_buf()])
    } else if input.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(input)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("json")
            })
            .collect();
        if files.is_empty() {
            return Err(format!("No JSON logs found in directory '{}'.", input.display()).into());
        }
        files.sort();
        Ok(files)
    } else {
        Err(format!("Input path '{}' does not exist.", input.display()).into())
    }
}
