//! On-disk image of the service registry (`services.json`).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use plugmon_types::ServiceId;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::Result;
use crate::handler::HandlerSpec;

pub const STORE_VERSION: u32 = 1;

/// Persisted form of one service. Connections are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub id: ServiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub handlers: Vec<HandlerSpec>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRegistry {
    version: u32,
    saved_at: DateTime<Utc>,
    services: Vec<ServiceRecord>,
}

/// Reads and writes the registry file. Writes are serialized and go through
/// a temporary file that is renamed into place.
#[derive(Debug)]
pub struct ServiceStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ServiceStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all records. Returns `Ok(None)` if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid image.
    pub async fn load(&self) -> Result<Option<Vec<ServiceRecord>>> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Service store not found at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let stored: StoredRegistry = serde_json::from_slice(&content)?;
        if stored.version != STORE_VERSION {
            warn!(
                "Service store {} has version {}, expected {}",
                self.path.display(),
                stored.version,
                STORE_VERSION
            );
        }

        info!(
            "Loaded {} services from {}",
            stored.services.len(),
            self.path.display()
        );
        Ok(Some(stored.services))
    }

    /// Replace the stored image with `services`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the file cannot be written.
    pub async fn save(&self, services: Vec<ServiceRecord>) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let count = services.len();
        let stored = StoredRegistry {
            version: STORE_VERSION,
            saved_at: Utc::now(),
            services,
        };
        let content = serde_json::to_vec_pretty(&stored)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("Saved {} services to {}", count, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn record(name: Option<&str>) -> ServiceRecord {
        ServiceRecord {
            id: ServiceId::new(),
            name: name.map(String::from),
            created_at: Utc::now(),
            handlers: vec![HandlerSpec::FileReport {
                dir: PathBuf::from("/tmp/reports"),
            }],
        }
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ServiceStore::new(dir.path().join("services.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ServiceStore::new(dir.path().join("data").join("services.json"));
        let records = vec![record(Some("plugin-a")), record(None)];

        store.save(records.clone()).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();

        assert_eq!(loaded, records);
        assert!(!dir.path().join("data").join("services.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = ServiceStore::new(dir.path().join("services.json"));
        store.save(vec![record(Some("weather"))]).await.unwrap();

        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert!(raw["savedAt"].is_string());
        assert_eq!(raw["services"][0]["name"], "weather");
        assert!(raw["services"][0]["createdAt"].is_string());
        assert_eq!(raw["services"][0]["handlers"][0]["type"], "file_report");
        assert!(raw["services"][0].get("clients").is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = ServiceStore::new(path);
        assert!(store.load().await.is_err());
    }
}
