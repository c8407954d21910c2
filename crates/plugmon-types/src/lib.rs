//! Shared types for plugmon components.
//!
//! This crate provides the event model exchanged between plugins and the
//! plugmon daemon, plus the identity and response types shared by the daemon,
//! the RPC clients and the CLI. All types are serializable for transport.
//!
//! Events are split by direction:
//! - [`UpEvent`]: plugin to daemon (`report`, `required`, `fetch`)
//! - [`DownEvent`]: daemon to plugin (`status`, `broadcast`, `alert`, `hmr`, `execute`)
//!
//! Both are internally tagged on a `type` field. Decoding an unknown `type`
//! is an error, never a fallback.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod envelope;
mod locator;

pub use envelope::Envelope;
pub use locator::{LocatorError, ServiceLocator};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[must_use]
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Stable identity of a registered service. Immutable for the service's lifetime.
    ServiceId
);

define_id!(
    /// Identity of one live client connection, generated at attach time.
    ConnectionId
);

/// Descriptive record a plugin sends about itself when it connects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form metadata (package info and the like)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl ClientInfo {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Discriminator values of up-events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpEventType {
    Report,
    Required,
    Fetch,
}

impl UpEventType {
    pub const ALL: [UpEventType; 3] = [Self::Report, Self::Required, Self::Fetch];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Report => "report",
            Self::Required => "required",
            Self::Fetch => "fetch",
        }
    }
}

impl fmt::Display for UpEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpEventType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownType(s.to_string()))
    }
}

/// Severity of a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportLevel {
    Info,
    Warn,
    Fails,
    Error,
    Crash,
}

impl ReportLevel {
    pub const ALL: [ReportLevel; 5] = [
        Self::Info,
        Self::Warn,
        Self::Fails,
        Self::Error,
        Self::Crash,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Fails => "fails",
            Self::Error => "error",
            Self::Crash => "crash",
        }
    }
}

impl fmt::Display for ReportLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown [`ReportLevel`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown report level '{0}' (expected info, warn, fails, error or crash)")]
pub struct UnknownLevel(pub String);

impl FromStr for ReportLevel {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| UnknownLevel(s.to_string()))
    }
}

/// A JavaScript-style error attached to a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JavascriptError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Accepts epoch seconds (integer or fractional) or an RFC 3339 string.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Seconds(i64),
        Fractional(f64),
        Text(String),
    }

    match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Seconds(secs) => DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {secs}"))),
        // Sub-microsecond precision is not meaningful for reports
        #[allow(clippy::cast_possible_truncation)]
        RawTimestamp::Fractional(secs) => {
            DateTime::from_timestamp_micros((secs * 1_000_000.0) as i64)
                .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {secs}")))
        }
        RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| D::Error::custom(format!("invalid timestamp '{text}': {e}"))),
    }
}

/// A structured report (log line, failure, crash) sent by a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<ServiceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    pub level: ReportLevel,
    #[serde(default = "now", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JavascriptError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl ReportEvent {
    #[must_use]
    pub fn new(level: ReportLevel, description: impl Into<String>) -> Self {
        Self {
            service_id: None,
            connection_id: None,
            level,
            timestamp: Utc::now(),
            description: description.into(),
            info: None,
            error: None,
            log: None,
        }
    }

    #[must_use]
    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: JavascriptError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Payload-carrying up-event used by `required` and `fetch`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<ServiceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Events sent from a plugin to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpEvent {
    Report(ReportEvent),
    Required(DataEvent),
    Fetch(DataEvent),
}

impl UpEvent {
    #[must_use]
    pub fn event_type(&self) -> UpEventType {
        match self {
            Self::Report(_) => UpEventType::Report,
            Self::Required(_) => UpEventType::Required,
            Self::Fetch(_) => UpEventType::Fetch,
        }
    }

    fn ids(&self) -> (Option<ServiceId>, Option<ConnectionId>) {
        match self {
            Self::Report(e) => (e.service_id, e.connection_id),
            Self::Required(e) | Self::Fetch(e) => (e.service_id, e.connection_id),
        }
    }

    #[must_use]
    pub fn service_id(&self) -> Option<ServiceId> {
        self.ids().0
    }

    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.ids().1
    }

    /// Attach origin identity. The service id is always overwritten; the
    /// connection id is only filled in when the peer did not send one.
    pub fn stamp(&mut self, service_id: ServiceId, connection_id: ConnectionId) {
        let (sid, cid) = match self {
            Self::Report(e) => (&mut e.service_id, &mut e.connection_id),
            Self::Required(e) | Self::Fetch(e) => (&mut e.service_id, &mut e.connection_id),
        };
        *sid = Some(service_id);
        cid.get_or_insert(connection_id);
    }

    /// Decode an inbound JSON frame.
    ///
    /// The discriminator is checked before the body so that an unknown `type`
    /// is reported as such rather than as a generic shape mismatch.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] if the frame is not an object, has no string
    /// `type`, names an unknown type, or has fields that do not fit the type.
    pub fn from_frame(frame: Value) -> Result<Self, DecodeError> {
        let Value::Object(ref map) = frame else {
            return Err(DecodeError::NotAnObject);
        };
        let Some(Value::String(type_name)) = map.get("type") else {
            return Err(DecodeError::MissingType);
        };
        let event_type: UpEventType = type_name.parse()?;

        serde_json::from_value(frame).map_err(|source| DecodeError::Invalid {
            event_type: event_type.as_str(),
            source,
        })
    }
}

impl From<ReportEvent> for UpEvent {
    fn from(report: ReportEvent) -> Self {
        Self::Report(report)
    }
}

/// Errors produced while decoding an inbound event frame
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no 'type' discriminator")]
    MissingType,

    #[error("unknown event type '{0}'")]
    UnknownType(String),

    #[error("invalid '{event_type}' event: {source}")]
    Invalid {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Connection status greeting and close notices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub service_id: ServiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Close code, present only on the final status of a rejected connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub message: String,
    #[serde(default)]
    pub highlight: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<ReportLevel>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HmrEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteEvent {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Events sent from the daemon to a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownEvent {
    Status(StatusEvent),
    Broadcast(BroadcastEvent),
    Alert(AlertEvent),
    Hmr(HmrEvent),
    Execute(ExecuteEvent),
}

impl DownEvent {
    #[must_use]
    pub fn broadcast(message: impl Into<String>, highlight: bool) -> Self {
        Self::Broadcast(BroadcastEvent {
            message: message.into(),
            highlight,
        })
    }

    #[must_use]
    pub fn alert(message: impl Into<String>, level: Option<ReportLevel>) -> Self {
        Self::Alert(AlertEvent {
            message: message.into(),
            level,
        })
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Broadcast(_) => "broadcast",
            Self::Alert(_) => "alert",
            Self::Hmr(_) => "hmr",
            Self::Execute(_) => "execute",
        }
    }
}
