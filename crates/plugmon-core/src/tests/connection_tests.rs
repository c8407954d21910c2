//! Tests for the connection loops and the close protocol

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use plugmon_rpc::{FrameCodec, POLICY_VIOLATION};
use plugmon_types::{ClientInfo, DecodeError, DownEvent, UpEvent, UpEventType};
use serde_json::json;
use tokio_util::codec::Framed;

use super::fixtures::{
    RecordingHandler, connect, next_frame, registry_in, registry_with, tight_settings, within,
};
use crate::Error;
use crate::handler::HandlerKind;

#[tokio::test]
async fn test_greeting_is_first_frame() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_in(dir.path())
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();

    let (connection, _handle, _peer, greeting) = connect(&service).await;

    assert_eq!(greeting["type"], "status");
    assert_eq!(greeting["message"], "Connected to server");
    assert_eq!(greeting["serviceId"], service.id().to_string());
    assert_eq!(greeting["connectionId"], connection.id().to_string());
    assert_eq!(greeting["name"], "plugin-a");
    assert!(greeting.get("code").is_none());
}

#[tokio::test]
async fn test_register_attach_report_broadcast_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(dir.path());
    let service = registry.register("plugin-a").await.unwrap();
    let reports = RecordingHandler::new(HandlerKind::Only(UpEventType::Report));
    service.add_handler(reports.clone()).await;

    let (connection, _handle, mut peer, _) = connect(&service).await;
    peer.send(json!({
        "type": "report",
        "level": "error",
        "description": "boom",
        "info": "stack overflow in render"
    }))
    .await
    .unwrap();

    reports.wait_for(1).await;
    let events = reports.events();
    assert_eq!(events.len(), 1);
    let UpEvent::Report(report) = &events[0] else {
        panic!("Expected Report");
    };
    assert_eq!(report.description, "boom");
    assert_eq!(report.service_id, Some(service.id()));
    assert_eq!(report.connection_id, Some(connection.id()));

    assert_eq!(service.broadcast("hello", false).await, 1);
    let frame = next_frame(&mut peer).await;
    assert_eq!(frame, json!({"type": "broadcast", "message": "hello", "highlight": false}));
}

#[tokio::test]
async fn test_up_events_dispatched_in_receipt_order() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_in(dir.path())
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();
    let recorder = RecordingHandler::new(HandlerKind::Any);
    service.add_handler(recorder.clone()).await;

    let (_connection, _handle, mut peer, _) = connect(&service).await;
    for i in 0..25 {
        peer.send(json!({"type": "report", "level": "info", "description": format!("{i}")}))
            .await
            .unwrap();
    }

    recorder.wait_for(25).await;
    let order: Vec<String> = recorder
        .events()
        .into_iter()
        .map(|e| match e {
            UpEvent::Report(r) => r.description,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    let expected: Vec<String> = (0..25).map(|i| i.to_string()).collect();
    assert_eq!(order, expected);
}

#[tokio::test]
async fn test_peer_connection_id_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_in(dir.path())
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();
    let recorder = RecordingHandler::new(HandlerKind::Any);
    service.add_handler(recorder.clone()).await;

    let (_connection, _handle, mut peer, _) = connect(&service).await;
    let foreign = plugmon_types::ConnectionId::new();
    let other_service = plugmon_types::ServiceId::new();
    peer.send(json!({
        "type": "fetch",
        "serviceId": other_service.to_string(),
        "connectionId": foreign.to_string(),
        "data": {"key": "weather"}
    }))
    .await
    .unwrap();

    recorder.wait_for(1).await;
    let event = &recorder.events()[0];
    assert_eq!(event.service_id(), Some(service.id()));
    assert_eq!(event.connection_id(), Some(foreign));
}

#[tokio::test]
async fn test_unknown_event_type_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_in(dir.path())
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();
    let recorder = RecordingHandler::new(HandlerKind::Any);
    service.add_handler(recorder.clone()).await;

    let (connection, handle, mut peer, _) = connect(&service).await;
    peer.send(json!({"type": "not-a-real-type"})).await.unwrap();

    let status = next_frame(&mut peer).await;
    assert_eq!(status["type"], "status");
    assert_eq!(status["code"], POLICY_VIOLATION);

    let result = within(handle).await.unwrap();
    assert!(matches!(
        result,
        Err(Error::Decode(DecodeError::UnknownType(ref t))) if t == "not-a-real-type"
    ));
    assert_eq!(recorder.count(), 0);
    assert!(service.client(connection.id()).is_none());
    assert_eq!(connection.active_loops(), 0);
}

#[tokio::test]
async fn test_non_object_frame_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_in(dir.path())
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();

    let (_connection, handle, mut peer, _) = connect(&service).await;
    peer.send(json!(["not", "an", "object"])).await.unwrap();

    assert_eq!(next_frame(&mut peer).await["code"], POLICY_VIOLATION);
    assert!(matches!(within(handle).await.unwrap(), Err(Error::Codec(_))));
}

#[tokio::test]
async fn test_full_queue_blocks_send_and_fails_try_send() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_with(dir.path(), tight_settings(2))
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();
    let connection = service.attach(None, None).unwrap();

    connection
        .try_send(DownEvent::broadcast("one", false))
        .unwrap();
    connection
        .send(DownEvent::broadcast("two", false))
        .await
        .unwrap();

    let err = connection
        .try_send(DownEvent::broadcast("three", false))
        .unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded));

    let blocked = tokio::time::timeout(
        Duration::from_millis(100),
        connection.send(DownEvent::broadcast("three", false)),
    )
    .await;
    assert!(blocked.is_err(), "send should wait while the queue is full");

    // Nothing queued so far was dropped
    let (server_side, client_side) = tokio::io::duplex(64 * 1024);
    let runner = Arc::clone(&connection);
    let _handle = tokio::spawn(async move { runner.run(server_side).await });
    let mut peer = Framed::new(client_side, FrameCodec::new());

    assert_eq!(next_frame(&mut peer).await["type"], "status");
    assert_eq!(next_frame(&mut peer).await["message"], "one");
    assert_eq!(next_frame(&mut peer).await["message"], "two");
}

#[tokio::test]
async fn test_close_removes_connection_and_stops_loops() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_in(dir.path())
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();

    let (connection, handle, _peer, _) = connect(&service).await;
    assert_eq!(service.client_count(), 1);

    within(connection.close()).await;

    assert!(service.client(connection.id()).is_none());
    assert_eq!(connection.active_loops(), 0);
    assert!(connection.is_closed());
    assert!(within(handle).await.unwrap().is_ok());
}

#[tokio::test]
async fn test_close_flushes_queued_events() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_in(dir.path())
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();

    let (connection, _handle, mut peer, _) = connect(&service).await;
    connection
        .send(DownEvent::broadcast("last words", false))
        .await
        .unwrap();
    within(connection.close()).await;

    assert_eq!(next_frame(&mut peer).await["message"], "last words");
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_in(dir.path())
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();

    let (connection, _handle, _peer, _) = connect(&service).await;
    within(async { tokio::join!(connection.close(), connection.close()) }).await;
    within(connection.close()).await;

    assert_eq!(service.client_count(), 0);
    assert_eq!(connection.active_loops(), 0);
}

#[tokio::test]
async fn test_send_after_close_fails() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_in(dir.path())
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();

    let (connection, _handle, _peer, _) = connect(&service).await;
    within(connection.close()).await;

    assert!(matches!(
        connection.send(DownEvent::broadcast("late", false)).await,
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(
        connection.try_send(DownEvent::broadcast("late", false)),
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_close_without_run_completes_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_in(dir.path())
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();

    let connection = service.attach(None, None).unwrap();
    within(connection.close()).await;

    assert_eq!(service.client_count(), 0);
    assert!(connection.is_closed());

    let (server_side, _client_side) = tokio::io::duplex(1024);
    assert!(matches!(
        connection.run(server_side).await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_second_run_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_in(dir.path())
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();

    let (connection, _handle, _peer, _) = connect(&service).await;
    let (server_side, _client_side) = tokio::io::duplex(1024);
    assert!(matches!(
        connection.run(server_side).await,
        Err(Error::AlreadyRunning)
    ));
}

#[tokio::test]
async fn test_peer_hangup_closes_connection() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_in(dir.path())
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();

    let (connection, handle, peer, _) = connect(&service).await;
    drop(peer);

    assert!(within(handle).await.unwrap().is_ok());
    assert!(connection.is_closed());
    assert_eq!(service.client_count(), 0);
}

#[tokio::test]
async fn test_stalled_peer_is_force_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_with(dir.path(), tight_settings(16))
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();

    let connection = service.attach(None, None).unwrap();
    let (server_side, client_side) = tokio::io::duplex(256);
    let runner = Arc::clone(&connection);
    let handle = tokio::spawn(async move { runner.run(server_side).await });

    let mut peer = Framed::new(client_side, FrameCodec::new());
    next_frame(&mut peer).await;

    // The peer stops reading; these fill the pipe and stall the send loop
    let payload = "x".repeat(1024);
    for _ in 0..4 {
        connection
            .send(DownEvent::broadcast(payload.clone(), false))
            .await
            .unwrap();
    }

    within(connection.close()).await;

    assert_eq!(service.client_count(), 0);
    assert_eq!(connection.active_loops(), 0);
    assert!(within(handle).await.unwrap().is_ok());
}

#[tokio::test]
async fn test_dropped_run_still_detaches() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_in(dir.path())
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();

    let (connection, handle, _peer, _) = connect(&service).await;
    handle.abort();
    let _ = handle.await;

    within(connection.wait_closed()).await;
    assert!(service.client(connection.id()).is_none());
    within(connection.close()).await;
}

#[tokio::test]
async fn test_client_info_defaults_and_name_override() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(dir.path());
    let named = registry.resolve(None, Some("weather")).await.unwrap();
    let anonymous = registry
        .resolve(Some(plugmon_types::ServiceId::new()), None)
        .await
        .unwrap();

    let default_info = named.attach(None, None).unwrap();
    assert_eq!(default_info.info().name, "weather");

    let supplied = named
        .attach(
            None,
            Some(ClientInfo::named("something-else").with_version("0.0.1")),
        )
        .unwrap();
    assert_eq!(supplied.info().name, "weather");
    assert_eq!(supplied.info().version.as_deref(), Some("0.0.1"));

    let unnamed = anonymous.attach(None, Some(ClientInfo::named("custom"))).unwrap();
    assert_eq!(unnamed.info().name, "custom");
    let fallback = anonymous.attach(None, None).unwrap();
    assert_eq!(fallback.info().name, anonymous.id().to_string());
}

#[tokio::test]
async fn test_registry_close_all() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(dir.path());
    let a = registry.resolve(None, Some("alpha")).await.unwrap();
    let b = registry.resolve(None, Some("beta")).await.unwrap();

    let (_c1, h1, _p1, _) = connect(&a).await;
    let (_c2, h2, _p2, _) = connect(&a).await;
    let (_c3, h3, _p3, _) = connect(&b).await;

    within(registry.close_all()).await;

    assert_eq!(a.client_count(), 0);
    assert_eq!(b.client_count(), 0);
    for handle in [h1, h2, h3] {
        assert!(within(handle).await.unwrap().is_ok());
    }
}

#[tokio::test]
async fn test_duplicate_connection_id_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_in(dir.path());
    let service = registry.resolve(None, Some("plugin-a")).await.unwrap();

    let (first, handle, mut peer, _) = connect(&service).await;

    let err = service
        .attach(Some(first.id()), Some(ClientInfo::named("impostor")))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateConnection(id) if id == first.id()));
    assert_eq!(service.client_count(), 1);
    assert!(Arc::ptr_eq(&service.client(first.id()).unwrap(), &first));

    assert_eq!(service.broadcast("still here", false).await, 1);
    assert_eq!(next_frame(&mut peer).await["message"], "still here");

    within(registry.close_all()).await;
    assert!(first.is_closed());
    assert_eq!(first.active_loops(), 0);
    assert!(within(handle).await.unwrap().is_ok());

    // The id is free again once the first connection has gone
    let reused = service.attach(Some(first.id()), None).unwrap();
    assert_eq!(reused.id(), first.id());
}

#[tokio::test]
async fn test_close_while_greeting_is_stalled() {
    let dir = tempfile::tempdir().unwrap();
    let service = registry_with(dir.path(), tight_settings(4))
        .resolve(None, Some("plugin-a"))
        .await
        .unwrap();

    let connection = service.attach(None, None).unwrap();
    // Too small for the greeting, and the peer never reads
    let (server_side, _client_side) = tokio::io::duplex(8);
    let runner = Arc::clone(&connection);
    let handle = tokio::spawn(async move { runner.run(server_side).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    within(connection.close()).await;

    assert!(connection.is_closed());
    assert_eq!(service.client_count(), 0);
    assert!(within(handle).await.unwrap().is_ok());
}
