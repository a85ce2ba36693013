use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thinglog_api::TopicFilter;

use crate::error::RouterError;

/// Default client id of the recorder on the bus.
pub const DEFAULT_CLIENT_ID: &str = "logger";

/// Durability of a single appended record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// Flush only: records survive a process crash, not a power loss.
    DevLoose,
    /// fsync (`sync_data`) after every record.
    #[default]
    AuditStrict,
}

/// Recorder options, as written in the `[logger]` config section.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggerConfig {
    /// Identity of the recorder's bus connection.
    #[serde(default = "default_client_id", alias = "clientID")]
    pub client_id: String,

    /// Absolute, home-relative, or empty for the host default.
    #[serde(default, alias = "logsFolder")]
    pub logs_folder: String,

    /// Entities to record. Empty records every entity.
    #[serde(default, alias = "entityFilter", alias = "thingIDs")]
    pub entity_filter: Vec<String>,

    #[serde(default, alias = "publishSelfDescription", alias = "publishTD")]
    pub publish_description: bool,

    /// Zone used in the service id of the self-description.
    #[serde(default = "default_zone")]
    pub zone: String,

    #[serde(default)]
    pub durability: Durability,
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_zone() -> String {
    "local".to_string()
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            logs_folder: String::new(),
            entity_filter: Vec::new(),
            publish_description: false,
            zone: default_zone(),
            durability: Durability::default(),
        }
    }
}

/// Directories supplied by the hosting process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    /// Base for relative `logs_folder` values.
    pub home: PathBuf,
    /// Used when `logs_folder` is empty.
    pub default_logs_folder: PathBuf,
}

impl HostPaths {
    /// `home` with `<home>/logs` as the default logs folder.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let default_logs_folder = home.join("logs");
        Self { home, default_logs_folder }
    }
}

/// Resolved, immutable routing settings of one running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingConfig {
    pub client_id: String,
    pub logs_folder: PathBuf,
    pub entity_filter: BTreeSet<String>,
    pub self_describe: bool,
    pub zone: String,
    pub durability: Durability,
}

impl RoutingConfig {
    /// Subscriptions to open: one wildcard, or one per filtered entity.
    pub fn filters(&self) -> Vec<TopicFilter> {
        if self.entity_filter.is_empty() {
            vec![TopicFilter::All]
        } else {
            self.entity_filter
                .iter()
                .map(|id| TopicFilter::Entity(id.clone()))
                .collect()
        }
    }

    /// The only start-up precondition: the logs folder exists, is a
    /// directory and can be listed.
    pub fn verify_logs_folder(&self) -> Result<(), RouterError> {
        let path = &self.logs_folder;
        let fail = |source: std::io::Error| {
            tracing::error!(folder = %path.display(), error = %source, "logging folder is not usable");
            RouterError::LogsFolder { path: path.clone(), source }
        };

        let meta = std::fs::metadata(path).map_err(fail)?;
        if !meta.is_dir() {
            return Err(fail(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                "not a directory",
            )));
        }
        std::fs::read_dir(path).map_err(fail)?;
        Ok(())
    }
}

impl LoggerConfig {
    pub fn resolve(&self, host: &HostPaths) -> RoutingConfig {
        RoutingConfig {
            client_id: self.client_id.clone(),
            logs_folder: resolve_logs_folder(&self.logs_folder, host),
            entity_filter: self
                .entity_filter
                .iter()
                .filter(|id| !id.is_empty())
                .cloned()
                .collect(),
            self_describe: self.publish_description,
            zone: self.zone.clone(),
            durability: self.durability,
        }
    }
}

/// Empty → host default; relative → joined onto home; then made absolute
/// against the working directory if still relative.
pub fn resolve_logs_folder(configured: &str, host: &HostPaths) -> PathBuf {
    let folder = if configured.is_empty() {
        host.default_logs_folder.clone()
    } else {
        let path = Path::new(configured);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            host.home.join(path)
        }
    };
    std::path::absolute(&folder).unwrap_or(folder)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostPaths {
        HostPaths {
            home: PathBuf::from("/srv/hub"),
            default_logs_folder: PathBuf::from("/var/log/hub"),
        }
    }

    #[test]
    fn empty_folder_uses_host_default() {
        assert_eq!(resolve_logs_folder("", &host()), PathBuf::from("/var/log/hub"));
    }

    #[test]
    fn relative_folder_is_joined_onto_home() {
        assert_eq!(resolve_logs_folder("logs/things", &host()), PathBuf::from("/srv/hub/logs/things"));
    }

    #[test]
    fn absolute_folder_is_kept() {
        assert_eq!(resolve_logs_folder("/tmp", &host()), PathBuf::from("/tmp"));
    }

    #[test]
    fn relative_home_becomes_absolute() {
        let resolved = resolve_logs_folder("", &HostPaths::with_home("."));
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("logs"));
    }

    #[test]
    fn filter_topology() {
        let all = LoggerConfig::default().resolve(&host());
        assert_eq!(all.filters(), vec![TopicFilter::All]);

        let cfg = LoggerConfig {
            entity_filter: vec!["thing2".into(), "thing1".into(), "thing2".into(), String::new()],
            ..LoggerConfig::default()
        };
        assert_eq!(
            cfg.resolve(&host()).filters(),
            vec![
                TopicFilter::Entity("thing1".into()),
                TopicFilter::Entity("thing2".into()),
            ]
        );
    }

    #[test]
    fn logs_folder_must_be_a_listable_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let routing = |folder: &Path| LoggerConfig {
            logs_folder: folder.display().to_string(),
            ..LoggerConfig::default()
        }
        .resolve(&host());

        assert!(routing(tmp.path()).verify_logs_folder().is_ok());

        let file = tmp.path().join("plain");
        std::fs::write(&file, b"").unwrap();
        let err = routing(&file).verify_logs_folder().unwrap_err();
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::NotADirectory));

        let err = routing(&tmp.path().join("nope")).verify_logs_folder().unwrap_err();
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::NotFound));
    }

    #[test]
    fn accepts_legacy_option_names() {
        let cfg: LoggerConfig = serde_json::from_str(
            r#"{"clientID":"rec-1","logsFolder":"/tmp","thingIDs":["a"],"publishTD":true}"#,
        )
        .unwrap();
        assert_eq!(cfg.client_id, "rec-1");
        assert_eq!(cfg.logs_folder, "/tmp");
        assert_eq!(cfg.entity_filter, vec!["a".to_string()]);
        assert!(cfg.publish_description);
        assert_eq!(cfg.durability, Durability::AuditStrict);

        let cfg: LoggerConfig =
            serde_json::from_str(r#"{"entityFilter":["b"],"publishSelfDescription":true,"durability":"dev_loose"}"#)
                .unwrap();
        assert_eq!(cfg.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(cfg.entity_filter, vec!["b".to_string()]);
        assert!(cfg.publish_description);
        assert_eq!(cfg.durability, Durability::DevLoose);
    }
}
