//! Control request handlers.
//!
//! Each [`ControlRequest`] is answered with exactly one [`Envelope`]. Handler
//! errors are mapped to envelope codes through [`DaemonError`].

use plugmon_core::ServiceRegistry;
use plugmon_rpc::ControlRequest;
use plugmon_types::{
    ConnectionId, Envelope, JavascriptError, ReportEvent, ReportLevel, ServiceLocator, UpEvent,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{DaemonError, Result};

/// Answer one control request.
///
/// `shutdown` is acknowledged here; stopping the server is left to the
/// caller once the reply has been written.
pub async fn handle(registry: &ServiceRegistry, request: ControlRequest) -> Envelope {
    let op = request.op();
    debug!("control op={}", op);

    let result = match request {
        ControlRequest::Register { name } => register(registry, name).await,
        ControlRequest::Fetch { service } => fetch(registry, &service).await,
        ControlRequest::Report { service, report } => {
            submit_report(registry, &service, report).await
        }
        ControlRequest::Broadcast {
            service,
            message,
            highlight,
        } => broadcast(registry, &service, &message, highlight).await,
        ControlRequest::Save => save(registry).await,
        ControlRequest::List => list(registry).await,
        ControlRequest::Shutdown => Ok(Envelope::ok_msg("Shutting down")),
    };

    result.unwrap_or_else(|e| {
        warn!("control op={} failed: {}", op, e);
        Envelope::from(e)
    })
}

async fn register(registry: &ServiceRegistry, name: String) -> Result<Envelope> {
    let locator =
        ServiceLocator::name(name).map_err(|e| DaemonError::invalid_field("name", e))?;
    let Some(name) = locator.name_str() else {
        return Err(DaemonError::MissingField("name"));
    };

    let service = registry.register(name).await?;
    info!("[{}] registered as '{}'", service.id(), name);
    Ok(Envelope::ok_with(Value::String(service.id().to_string())))
}

async fn fetch(registry: &ServiceRegistry, locator: &ServiceLocator) -> Result<Envelope> {
    let Some(service) = registry.find(locator).await else {
        return Err(DaemonError::ServiceNotFound(locator.to_string()));
    };
    let info = service.info().await;
    Ok(Envelope::ok_with(serde_json::to_value(info)?))
}

async fn submit_report(
    registry: &ServiceRegistry,
    locator: &ServiceLocator,
    payload: Value,
) -> Result<Envelope> {
    let report = parse_report(payload)?;
    let service = registry.locate(locator).await?;

    let mut event = UpEvent::Report(report);
    event.stamp(service.id(), ConnectionId::new());
    let summary = service.dispatch(&event).await;
    debug!(
        "[{}] control report dispatched to {} handlers ({} failed)",
        service.id(),
        summary.matched,
        summary.failed
    );

    Ok(Envelope::ok_msg("Report successfully"))
}

async fn broadcast(
    registry: &ServiceRegistry,
    locator: &ServiceLocator,
    message: &str,
    highlight: bool,
) -> Result<Envelope> {
    let service = registry.locate(locator).await?;
    let delivered = service.broadcast(message, highlight).await;
    debug!("[{}] broadcast delivered to {} clients", service.id(), delivered);
    Ok(Envelope::no_content())
}

async fn save(registry: &ServiceRegistry) -> Result<Envelope> {
    registry.save().await?;
    Ok(Envelope::ok_msg("Saved"))
}

async fn list(registry: &ServiceRegistry) -> Result<Envelope> {
    let infos = registry.infos().await;
    Ok(Envelope::ok_with(serde_json::to_value(infos)?))
}

fn require_string(fields: &Map<String, Value>, field: &'static str) -> Result<()> {
    match fields.get(field) {
        None | Some(Value::Null) => Err(DaemonError::MissingField(field)),
        Some(Value::String(_)) => Ok(()),
        Some(_) => Err(DaemonError::invalid_field(field, "expected a string")),
    }
}

fn is_present(fields: &Map<String, Value>, field: &str) -> bool {
    fields.get(field).is_some_and(|value| !value.is_null())
}

/// Validate a report submitted over the control channel, naming the first
/// offending field on failure.
fn parse_report(payload: Value) -> Result<ReportEvent> {
    let Value::Object(mut fields) = payload else {
        return Err(DaemonError::InvalidParams(
            "report must be a JSON object".to_string(),
        ));
    };

    require_string(&fields, "level")?;
    if let Some(Value::String(level)) = fields.get("level") {
        level
            .parse::<ReportLevel>()
            .map_err(|e| DaemonError::invalid_field("level", e))?;
    }
    require_string(&fields, "description")?;

    // Older plugins send the error object JSON-encoded
    let decoded = match fields.get("error") {
        Some(Value::String(raw)) => Some(
            serde_json::from_str::<Value>(raw)
                .map_err(|e| DaemonError::invalid_field("error", e))?,
        ),
        _ => None,
    };
    if let Some(error) = decoded {
        fields.insert("error".to_string(), error);
    }
    if let Some(error) = fields.get("error").filter(|e| !e.is_null()) {
        serde_json::from_value::<JavascriptError>(error.clone())
            .map_err(|e| DaemonError::invalid_field("error", e))?;
    }

    if !is_present(&fields, "info") && !is_present(&fields, "error") {
        return Err(DaemonError::MissingField("info or error"));
    }

    if fields
        .get("info")
        .is_some_and(|info| !info.is_null() && !info.is_string())
    {
        return Err(DaemonError::invalid_field("info", "expected a string"));
    }
    if fields
        .get("timestamp")
        .is_some_and(|ts| !ts.is_null() && !ts.is_number() && !ts.is_string())
    {
        return Err(DaemonError::invalid_field(
            "timestamp",
            "expected epoch seconds or an RFC 3339 string",
        ));
    }

    serde_json::from_value(Value::Object(fields))
        .map_err(|e| DaemonError::InvalidParams(format!("invalid report: {e}")))
}
