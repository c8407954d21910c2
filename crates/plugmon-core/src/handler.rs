//! Handlers consume up-events dispatched by a service.
//!
//! A handler declares a [`HandlerKind`]: either one event type or the
//! wildcard `default`, which matches everything. Built-in handlers can be
//! described by a [`HandlerSpec`] so that they survive a save/load cycle.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use plugmon_types::{DecodeError, UpEvent, UpEventType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{Error, Result};

const WILDCARD: &str = "default";

/// Which up-events a handler wants to see
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HandlerKind {
    Any,
    Only(UpEventType),
}

impl HandlerKind {
    #[must_use]
    pub fn matches(self, event_type: UpEventType) -> bool {
        match self {
            Self::Any => true,
            Self::Only(kind) => kind == event_type,
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str(WILDCARD),
            Self::Only(kind) => write!(f, "{kind}"),
        }
    }
}

impl FromStr for HandlerKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == WILDCARD {
            Ok(Self::Any)
        } else {
            s.parse().map(Self::Only)
        }
    }
}

impl TryFrom<String> for HandlerKind {
    type Error = DecodeError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HandlerKind> for String {
    fn from(kind: HandlerKind) -> Self {
        kind.to_string()
    }
}

/// An asynchronous sink for up-events
#[async_trait]
pub trait Handler: Send + Sync {
    /// Short label used in logs and failure reports
    fn name(&self) -> &str;

    fn kind(&self) -> HandlerKind;

    /// Consume one event.
    ///
    /// # Errors
    ///
    /// Any error is logged and counted by the dispatching service; it never
    /// affects other handlers.
    async fn emit(&self, event: &UpEvent) -> Result<()>;
}

/// Serializable description of a built-in handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerSpec {
    /// Append reports to `<dir>/<serviceId>_report.json`
    FileReport { dir: PathBuf },

    /// Log matching events through `tracing`
    Log {
        #[serde(default = "any_kind")]
        kind: HandlerKind,
    },
}

fn any_kind() -> HandlerKind {
    HandlerKind::Any
}

impl HandlerSpec {
    #[must_use]
    pub fn build(&self) -> Arc<dyn Handler> {
        match self {
            Self::FileReport { dir } => Arc::new(FileReportHandler::new(dir.clone())),
            Self::Log { kind } => Arc::new(LogHandler::new(*kind)),
        }
    }
}

/// Appends every report as a JSON object to a per-service array file
pub struct FileReportHandler {
    dir: PathBuf,
    // Serializes read-modify-write of the report files
    write_lock: Mutex<()>,
}

impl FileReportHandler {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn report_path(&self, service_id: plugmon_types::ServiceId) -> PathBuf {
        self.dir.join(format!("{service_id}_report.json"))
    }

    async fn append(&self, path: &Path, entry: Value) -> Result<usize> {
        let _guard = self.write_lock.lock().await;

        tokio::fs::create_dir_all(&self.dir).await?;

        let mut entries: Vec<Value> = match tokio::fs::read(path).await {
            Ok(content) if content.is_empty() => Vec::new(),
            Ok(content) => serde_json::from_slice(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        entries.push(entry);

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&entries)?).await?;
        tokio::fs::rename(&tmp, path).await?;

        Ok(entries.len())
    }
}

#[async_trait]
impl Handler for FileReportHandler {
    fn name(&self) -> &'static str {
        "file_report"
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Only(UpEventType::Report)
    }

    async fn emit(&self, event: &UpEvent) -> Result<()> {
        let UpEvent::Report(report) = event else {
            return Ok(());
        };
        let service_id = report
            .service_id
            .ok_or_else(|| Error::handler(self.name(), "report carries no service id"))?;

        let path = self.report_path(service_id);
        let total = self.append(&path, serde_json::to_value(report)?).await?;
        debug!(
            "[{}] appended {} report ({} total) to {}",
            service_id,
            report.level,
            total,
            path.display()
        );
        Ok(())
    }
}

/// Logs every matching event
pub struct LogHandler {
    kind: HandlerKind,
}

impl LogHandler {
    #[must_use]
    pub fn new(kind: HandlerKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Handler for LogHandler {
    fn name(&self) -> &'static str {
        "log"
    }

    fn kind(&self) -> HandlerKind {
        self.kind
    }

    async fn emit(&self, event: &UpEvent) -> Result<()> {
        let service = event
            .service_id()
            .map_or_else(|| "-".to_string(), |id| id.to_string());

        match event {
            UpEvent::Report(report) => info!(
                "[{}] {} report: {}",
                service, report.level, report.description
            ),
            UpEvent::Required(data) | UpEvent::Fetch(data) => {
                let payload = data.data.clone().unwrap_or_default();
                info!("[{}] {} event: {}", service, event.event_type(), payload);
            }
        }
        Ok(())
    }
}
