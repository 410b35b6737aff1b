//! Service configuration file
//!
//! ```toml
//! [http]
//! bind_addr = "0.0.0.0"
//! port = 34936
//!
//! [log]
//! level = "info"
//! format = "console"
//! outputs = ["console", "default-file"]
//! rotation = "daily"
//! max_backups = 3
//!
//! [[midi_routers]]
//! name = "Pads"
//! device = "^nanoPAD2"
//!
//! [[midi_routers.request_triggers]]
//! uri = "/scene/1"
//! note = 60
//! velocity = 100
//! ```

use anyhow::{Context, Result};
use miditrig_core::RouterConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "midi-request-trigger";
const FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Log every inbound request
    pub debug: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 34936,
            debug: true,
        }
    }
}

impl HttpConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let raw = format!("{}:{}", self.bind_addr, self.port);
        raw.parse()
            .with_context(|| format!("Invalid http bind address: {}", raw))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

/// How often file outputs roll over to a new file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Any `EnvFilter` directive; `RUST_LOG` takes precedence
    pub level: String,
    #[serde(alias = "type")]
    pub format: LogFormat,
    /// `console` (stderr), `default-file`, or a log file path
    pub outputs: Vec<String>,
    pub rotation: LogRotation,
    /// Rolled-over files kept next to the active one; 0 keeps all
    pub max_backups: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Console,
            outputs: vec!["console".to_string()],
            rotation: LogRotation::Daily,
            max_backups: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub log: LogConfig,
    pub midi_routers: Vec<RouterConfig>,
}

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("In {}", path.display()))
    }

    /// Locations searched for a configuration file, most specific first
    pub fn candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(path) = explicit {
            paths.push(path.to_path_buf());
        }
        paths.push(PathBuf::from(FILE_NAME));
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join(APP_DIR).join(FILE_NAME));
        }
        paths.push(Path::new("/etc").join(APP_DIR).join(FILE_NAME));
        paths
    }

    pub fn discover(explicit: Option<&Path>) -> Option<PathBuf> {
        Self::candidates(explicit).into_iter().find(|p| p.is_file())
    }

    /// Configuration-shape warnings across every router
    pub fn warnings(&self) -> Vec<String> {
        self.midi_routers
            .iter()
            .flat_map(|router| {
                router
                    .validate()
                    .into_iter()
                    .map(move |w| format!("router {}: {}", router.name, w))
            })
            .collect()
    }
}
