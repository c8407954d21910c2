//! Handshake and control request types.
//!
//! The first frame a client writes is a [`Hello`] naming its role. Plugins
//! then exchange [`UpEvent`](plugmon_types::UpEvent) and
//! [`DownEvent`](plugmon_types::DownEvent) frames; control clients exchange
//! [`ControlRequest`] frames for [`Envelope`](plugmon_types::Envelope) replies.

use plugmon_types::{ClientInfo, ConnectionId, ServiceLocator};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Close code sent when a peer violates the frame protocol
pub const POLICY_VIOLATION: u16 = 1008;

/// First frame sent by every client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Hello {
    /// Attach to a service as a plugin connection
    Plugin {
        service: ServiceLocator,
        #[serde(
            default,
            rename = "connectionId",
            skip_serializing_if = "Option::is_none"
        )]
        connection_id: Option<ConnectionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info: Option<ClientInfo>,
    },

    /// Issue control requests
    Control,
}

impl Hello {
    #[must_use]
    pub fn plugin(service: ServiceLocator) -> Self {
        Self::Plugin {
            service,
            connection_id: None,
            info: None,
        }
    }
}

/// Requests accepted on a control connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Register a new service under a fresh id
    Register { name: String },

    /// Describe an existing service
    Fetch { service: ServiceLocator },

    /// Submit a report on behalf of a service. The payload is validated by
    /// the daemon so that failures can name the offending field.
    Report { service: ServiceLocator, report: Value },

    /// Push a broadcast to every connection of a service
    Broadcast {
        service: ServiceLocator,
        message: String,
        #[serde(default)]
        highlight: bool,
    },

    /// Persist the service registry now
    Save,

    /// Describe every registered service
    List,

    /// Stop the daemon
    Shutdown,
}

impl ControlRequest {
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Fetch { .. } => "fetch",
            Self::Report { .. } => "report",
            Self::Broadcast { .. } => "broadcast",
            Self::Save => "save",
            Self::List => "list",
            Self::Shutdown => "shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plugin_hello_wire_shape() {
        let hello = Hello::plugin(ServiceLocator::name("plugin-a").unwrap());
        let value = serde_json::to_value(&hello).unwrap();
        assert_eq!(value, json!({"role": "plugin", "service": "name/plugin-a"}));
    }

    #[test]
    fn test_plugin_hello_with_info() {
        let hello: Hello = serde_json::from_value(json!({
            "role": "plugin",
            "service": "name/weather",
            "info": {"name": "weather", "version": "0.0.1"}
        }))
        .unwrap();
        let Hello::Plugin { info, .. } = hello else {
            panic!("Expected Plugin hello");
        };
        assert_eq!(info.unwrap().version.as_deref(), Some("0.0.1"));
    }

    #[test]
    fn test_hello_rejects_bad_locator() {
        let result = serde_json::from_value::<Hello>(json!({
            "role": "plugin",
            "service": "weather"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_control_hello() {
        let hello: Hello = serde_json::from_value(json!({"role": "control"})).unwrap();
        assert_eq!(hello, Hello::Control);
    }

    #[test]
    fn test_control_request_tags() {
        let req: ControlRequest = serde_json::from_value(json!({
            "op": "broadcast",
            "service": "name/plugin-a",
            "message": "hi"
        }))
        .unwrap();
        assert_eq!(req.op(), "broadcast");
        assert!(matches!(
            req,
            ControlRequest::Broadcast {
                highlight: false,
                ..
            }
        ));

        let save: ControlRequest = serde_json::from_value(json!({"op": "save"})).unwrap();
        assert_eq!(save, ControlRequest::Save);
    }

    #[test]
    fn test_unknown_op_fails() {
        assert!(serde_json::from_value::<ControlRequest>(json!({"op": "reboot"})).is_err());
    }
}
