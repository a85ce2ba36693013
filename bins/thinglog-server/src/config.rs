use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use thinglog_bus::BusConfig;
use thinglog_bus::ingest::IngestConfig;
use thinglog_engine::{HostPaths, LoggerConfig};

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "thinglog-server", about = "Records bus messages into per-entity log files")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the recorder until Ctrl+C
    Serve(ServeArgs),
    /// Resolve the config and verify the logs folder, then exit
    Check(ServeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Path to the TOML config file
    #[arg(long, default_value = "thinglog.toml", env = "THINGLOG_CONFIG")]
    pub config: String,
}

// ---- TOML Config ----

#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub host: HostSection,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// Directories the recorder is hosted in.
#[derive(Debug, Default, Deserialize)]
pub struct HostSection {
    /// Base for relative logs folders. Defaults to the working directory.
    #[serde(default)]
    pub home: Option<PathBuf>,
    /// Folder used when `[logger] logs_folder` is empty. Defaults to `<home>/logs`.
    #[serde(default)]
    pub logs_folder: Option<PathBuf>,
}

impl HostSection {
    pub fn host_paths(&self) -> Result<HostPaths, ServerError> {
        let home = match &self.home {
            Some(home) => home.clone(),
            None => std::env::current_dir().map_err(|e| ServerError::Config {
                context: "host",
                detail: format!("working directory: {e}"),
            })?,
        };
        let mut paths = HostPaths::with_home(home);
        if let Some(folder) = &self.logs_folder {
            paths.default_logs_folder = if folder.is_absolute() {
                folder.clone()
            } else {
                paths.home.join(folder)
            };
        }
        Ok(paths)
    }
}

impl ServerConfig {
    /// Read `path`; a missing file yields the defaults.
    pub fn load(path: &str) -> Result<Self, ServerError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(config = %path, "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ServerError::Config { context: "read", detail: format!("'{path}': {e}") });
            }
        };
        Self::parse(&content)
            .map_err(|e| ServerError::Config { context: "parse", detail: format!("'{path}': {e}") })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
