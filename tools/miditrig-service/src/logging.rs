//! Log sinks
//!
//! `console` writes to stderr. Any other output is a file written through a
//! rolling appender on a background worker. `default-file` resolves to
//! `/var/log/midi-request-trigger.log` when that location is writable, and
//! otherwise to the same name next to the executable.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::config::{Config, LogConfig, LogFormat, LogRotation};

const CONSOLE: &str = "console";
const DEFAULT_FILE: &str = "default-file";
const LOG_NAME: &str = "midi-request-trigger.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Flushes file outputs when dropped; hold it for the life of the process
#[must_use]
pub struct LogGuard {
    _workers: Vec<WorkerGuard>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Console,
    DefaultFile,
    File(PathBuf),
}

impl Output {
    pub fn parse(raw: &str) -> Self {
        match raw {
            CONSOLE => Output::Console,
            DEFAULT_FILE => Output::DefaultFile,
            path => Output::File(PathBuf::from(path)),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Minutely => Rotation::MINUTELY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Directories tried for `default-file`, in order
pub fn default_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    #[cfg(unix)]
    dirs.push(PathBuf::from("/var/log"));
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(dir);
    }
    dirs
}

/// Rolling appender for `path`. The file stem and extension frame the
/// rotation date, so `pads.log` rolls daily into `pads.2026-01-31.log`.
pub fn file_appender(path: &Path, config: &LogConfig) -> Result<RollingFileAppender> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .with_context(|| format!("Log output {} has no file name", path.display()))?;

    let mut builder = RollingFileAppender::builder()
        .rotation(config.rotation.into())
        .filename_prefix(stem);
    if let Some(extension) = path.extension() {
        builder = builder.filename_suffix(extension.to_string_lossy().into_owned());
    }
    if config.max_backups > 0 {
        builder = builder.max_log_files(config.max_backups + 1);
    }

    builder
        .build(dir)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// First candidate directory that accepts the service log file
pub fn default_file_appender(
    dirs: &[PathBuf],
    config: &LogConfig,
) -> Option<(PathBuf, RollingFileAppender)> {
    dirs.iter().find_map(|dir| {
        let path = dir.join(LOG_NAME);
        file_appender(&path, config).ok().map(|appender| (path, appender))
    })
}

fn layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
        LogFormat::Console => fmt::layer()
            .with_target(false)
            .compact()
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
    }
}

/// Install the global subscriber. Outputs that cannot be opened are skipped
/// and returned as warnings for the caller to log.
pub fn init(config: &Config) -> Result<(LogGuard, Vec<String>)> {
    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .context("Failed to parse log level")?;
    if config.http.debug {
        filter = filter.add_directive("tower_http=debug".parse()?);
    }

    let log = &config.log;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut workers = Vec::new();
    let mut warnings = Vec::new();

    for raw in &log.outputs {
        let appender = match Output::parse(raw) {
            Output::Console => {
                layers.push(layer(log.format, std::io::stderr, true));
                continue;
            }
            Output::DefaultFile => match default_file_appender(&default_dirs(), log) {
                Some((_, appender)) => appender,
                None => {
                    warnings.push("Unable to find a writable path for the default log file".to_string());
                    continue;
                }
            },
            Output::File(path) => match file_appender(&path, log) {
                Ok(appender) => appender,
                Err(e) => {
                    warnings.push(format!("{:#}", e));
                    continue;
                }
            },
        };

        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(layer(log.format, writer, false));
        workers.push(guard);
    }

    if layers.is_empty() {
        warnings.push("No usable log output configured, logging to console".to_string());
        layers.push(layer(log.format, std::io::stderr, true));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .init();

    Ok((LogGuard { _workers: workers }, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "miditrig-logging-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_parse_outputs() {
        assert_eq!(Output::parse("console"), Output::Console);
        assert_eq!(Output::parse("default-file"), Output::DefaultFile);
        assert_eq!(
            Output::parse("/var/log/pads.log"),
            Output::File(PathBuf::from("/var/log/pads.log"))
        );
    }

    #[test]
    fn test_rotation_mapping() {
        assert_eq!(Rotation::from(LogRotation::Hourly), Rotation::HOURLY);
        assert_eq!(Rotation::from(LogRotation::Never), Rotation::NEVER);
        assert_eq!(Rotation::from(LogConfig::default().rotation), Rotation::DAILY);
    }

    #[test]
    fn test_unrotated_file_keeps_its_name() {
        let dir = scratch_dir("plain");
        let config = LogConfig {
            rotation: LogRotation::Never,
            ..Default::default()
        };

        let path = dir.join("pads.log");
        let mut appender = file_appender(&path, &config).unwrap();
        appender.write_all(b"hello\n").unwrap();
        appender.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_default_file_falls_back_to_next_dir() {
        let dir = scratch_dir("fallback");
        let dirs = vec![PathBuf::from("/proc/miditrig-unwritable"), dir.clone()];
        let config = LogConfig {
            rotation: LogRotation::Never,
            ..Default::default()
        };

        let (path, _appender) = default_file_appender(&dirs, &config).unwrap();
        assert_eq!(path, dir.join("midi-request-trigger.log"));
        assert!(path.is_file());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_no_writable_default_dir() {
        let dirs = vec![PathBuf::from("/proc/miditrig-unwritable")];
        assert!(default_file_appender(&dirs, &LogConfig::default()).is_none());
    }

    #[test]
    fn test_default_dirs_end_with_executable_dir() {
        let dirs = default_dirs();
        let exe_dir = std::env::current_exe()
            .unwrap()
            .parent()
            .unwrap()
            .to_path_buf();
        assert_eq!(dirs.last(), Some(&exe_dir));
        #[cfg(unix)]
        assert_eq!(dirs[0], PathBuf::from("/var/log"));
    }
}
