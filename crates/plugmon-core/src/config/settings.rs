use crate::Result;
use crate::config::Directories;
use crate::handler::HandlerSpec;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 50;
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 5000;

/// Daemon configuration, loaded from `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Capacity of each connection's up and down queues
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long `close()` waits for the loops before forcing the send loop
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,

    /// Optional TCP listener in addition to the Unix socket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_listen: Option<SocketAddr>,

    /// Overrides the location of `services.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<PathBuf>,

    /// Overrides the directory used by the default report handler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<PathBuf>,

    /// Handlers attached to every service. `None` means one `file_report`
    /// handler writing into the report directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_handlers: Option<Vec<HandlerSpec>>,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_close_timeout_ms() -> u64 {
    DEFAULT_CLOSE_TIMEOUT_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            socket_path: None,
            tcp_listen: None,
            storage_path: None,
            report_dir: None,
            default_handlers: None,
        }
    }
}

impl Config {
    /// Load config from file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains invalid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)?;

        if config.queue_capacity == 0 {
            warn!("queueCapacity must be at least 1, using 1");
            config.queue_capacity = 1;
        }

        Ok(config)
    }

    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    #[must_use]
    pub fn storage_path(&self, dirs: &Directories) -> PathBuf {
        self.storage_path
            .clone()
            .unwrap_or_else(|| dirs.services_file.clone())
    }

    #[must_use]
    pub fn report_dir(&self, dirs: &Directories) -> PathBuf {
        self.report_dir
            .clone()
            .unwrap_or_else(|| dirs.reports.clone())
    }

    /// Handlers every service starts with
    #[must_use]
    pub fn handler_specs(&self, dirs: &Directories) -> Vec<HandlerSpec> {
        self.default_handlers.clone().unwrap_or_else(|| {
            vec![HandlerSpec::FileReport {
                dir: self.report_dir(dirs),
            }]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerKind;
    use plugmon_types::UpEventType;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.queue_capacity, 50);
        assert_eq!(config.close_timeout(), Duration::from_secs(5));
        assert!(config.tcp_listen.is_none());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"queueCapacity": 8, "tcpListen": "127.0.0.1:7100", "defaultHandlers": [{"type": "log", "kind": "report"}]}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.close_timeout_ms, DEFAULT_CLOSE_TIMEOUT_MS);
        assert_eq!(config.tcp_listen, Some("127.0.0.1:7100".parse().unwrap()));

        let dirs = Directories::with_base(dir.path().to_path_buf());
        assert_eq!(
            config.handler_specs(&dirs),
            vec![HandlerSpec::Log {
                kind: HandlerKind::Only(UpEventType::Report)
            }]
        );
    }

    #[test]
    fn test_zero_queue_capacity_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"queueCapacity": 0}"#).unwrap();

        assert_eq!(Config::load(&path).unwrap().queue_capacity, 1);
    }

    #[test]
    fn test_default_handler_writes_into_report_dir() {
        let dirs = Directories::with_base(PathBuf::from("/tmp/plugmon-test"));
        let specs = Config::default().handler_specs(&dirs);
        assert_eq!(
            specs,
            vec![HandlerSpec::FileReport {
                dir: PathBuf::from("/tmp/plugmon-test/reports")
            }]
        );
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
