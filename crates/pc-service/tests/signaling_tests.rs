//! Signaling endpoint integration tests.
//!
//! Drives the real `/ws` endpoint over a WebSocket using the `TestPcServer`
//! harness. The media engine is the in-memory mock, so every engine call the
//! coordinator makes can be inspected.

use pc_service::actors::coordinator::EVICTION_REASON;
use pc_service::media::codecs::RtpCapabilities;
use pc_service::media::engine::mock::EngineCall;
use pc_service::media::engine::EngineHandle;
use pc_test_utils::{fixtures, TestClient, TestPcServer};
use serde_json::Value;
use std::time::Duration;

/// Window used when asserting that something did NOT arrive.
const QUIET_WINDOW: Duration = Duration::from_millis(300);

/// Register a client and discard the events registration causes.
async fn register(
    client: &mut TestClient,
    name: &str,
    stable_user_id: Option<&str>,
) -> Result<(), anyhow::Error> {
    let result = client
        .request("register", fixtures::register(name, stable_user_id))
        .await?;
    assert_eq!(result["ok"], true, "register failed: {}", result);
    client.next_event("resyncStreamState").await?;
    Ok(())
}

async fn open_transport(client: &mut TestClient, direction: &str) -> Result<String, anyhow::Error> {
    let result = client
        .request("openTransport", fixtures::open_transport(direction))
        .await?;
    let id = result["id"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("openTransport failed: {}", result))?;
    Ok(id.to_string())
}

async fn produce(client: &mut TestClient, kind: &str) -> Result<String, anyhow::Error> {
    let result = client.request("produce", fixtures::produce(kind)).await?;
    let id = result["id"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("produce failed: {}", result))?;
    Ok(id.to_string())
}

fn error_of(result: &Value) -> (&str, i64) {
    (
        result["error"].as_str().unwrap_or_default(),
        result["code"].as_i64().unwrap_or_default(),
    )
}

// ============================================================================
// Connection lifecycle
// ============================================================================

/// The first frame on every connection is `welcome` with a fresh id.
#[tokio::test]
async fn test_welcome_assigns_distinct_connection_ids() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;

    let first = server.connect_client().await?;
    let second = server.connect_client().await?;

    assert!(!first.connection_id().as_str().is_empty());
    assert_ne!(first.connection_id(), second.connection_id());

    Ok(())
}

/// A fresh connection receives a snapshot shortly after connecting, even
/// before registering.
#[tokio::test]
async fn test_fresh_connection_receives_snapshot() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;
    let mut client = server.connect_client().await?;

    let snapshot = client.next_event("presenceSnapshot").await?;
    assert_eq!(snapshot["list"], serde_json::json!([]));

    Ok(())
}

/// Connections beyond the configured limit are closed with a client message.
#[tokio::test]
async fn test_connection_refused_at_capacity() -> Result<(), anyhow::Error> {
    let mut config = TestPcServer::test_config()?;
    config.max_connections = 1;
    let server = TestPcServer::spawn_with(config).await?;

    let _first = server.connect_client().await?;
    let reason = TestClient::connect_refused(&server.ws_url()).await?;

    assert_eq!(reason, "Server is at capacity, please try again");

    Ok(())
}

// ============================================================================
// Request validation
// ============================================================================

/// A frame that is not a valid request is answered when its id can be
/// recovered, and the connection stays usable.
#[tokio::test]
async fn test_malformed_frame_with_id_gets_validation_error() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;
    let mut client = server.connect_client().await?;

    client.send_raw(r#"{"id": 41, "params": {}}"#).await?;
    let result = client.response(41).await?;

    let (message, code) = error_of(&result);
    assert!(message.starts_with("Malformed request"), "got {}", message);
    assert_eq!(code, 1);

    let peers = client.request("getPeersList", Value::Null).await?;
    assert_eq!(peers, serde_json::json!([]));

    Ok(())
}

#[tokio::test]
async fn test_unknown_method_is_rejected() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;
    let mut client = server.connect_client().await?;

    let result = client.request("teleport", serde_json::json!({})).await?;

    assert_eq!(error_of(&result), ("Unknown method: teleport", 1));

    Ok(())
}

/// Unknown settings keys fail validation before reaching the coordinator.
#[tokio::test]
async fn test_stream_state_with_unknown_setting_is_rejected() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;
    let mut client = server.connect_client().await?;
    register(&mut client, "Ann", None).await?;

    let result = client
        .request(
            "updateStreamState",
            serde_json::json!({ "isStreaming": true, "settings": { "lasers": true } }),
        )
        .await?;

    assert_eq!(error_of(&result).1, 1);
    let status = server
        .wait_for_status(Duration::from_secs(2), |s| s.session_count == 1)
        .await?;
    assert_eq!(status.streaming_count, 0);

    Ok(())
}

/// Requests before `register` fail with the session error.
#[tokio::test]
async fn test_stream_state_before_register_fails() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;
    let mut client = server.connect_client().await?;

    let result = client
        .request("updateStreamState", fixtures::go_live("web"))
        .await?;

    assert_eq!(error_of(&result), ("Session not found", 4));

    Ok(())
}

// ============================================================================
// Identity and presence
// ============================================================================

/// Registering an identity that another connection holds evicts the older
/// connection. The newcomer inherits the last known display name.
#[tokio::test]
async fn test_register_evicts_previous_connection() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;

    let mut old = server.connect_client().await?;
    register(&mut old, "Ann", Some("user-ann")).await?;

    let mut new = server.connect_client().await?;
    let result = new
        .request("register", serde_json::json!({ "stableUserId": "user-ann" }))
        .await?;
    assert_eq!(result["ok"], true);

    let evicted = old.next_event("evicted").await?;
    assert_eq!(evicted["reason"], EVICTION_REASON);
    assert_eq!(old.wait_closed().await?, EVICTION_REASON);

    let peers = new.request("getPeersList", Value::Null).await?;
    let peers = peers.as_array().cloned().unwrap_or_default();
    assert_eq!(peers.len(), 1);
    let peer = peers.first().cloned().unwrap_or_default();
    assert_eq!(peer["displayName"], "Ann");
    assert_eq!(peer["stableId"], "user-ann");
    assert_eq!(peer["connectionId"], new.connection_id().as_str());

    Ok(())
}

/// A reconnecting identity resumes its streaming state and is told so.
#[tokio::test]
async fn test_reconnect_resyncs_stream_state() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;

    let mut old = server.connect_client().await?;
    register(&mut old, "Ann", Some("user-ann")).await?;
    let result = old
        .request("updateStreamState", fixtures::go_live("web"))
        .await?;
    assert_eq!(result["ok"], true);

    let mut new = server.connect_client().await?;
    new.request("register", fixtures::register("Ann", Some("user-ann")))
        .await?;
    let resync = new.next_event("resyncStreamState").await?;

    assert_eq!(resync["isStreaming"], true);
    assert_eq!(resync["platform"], "web");
    assert_eq!(resync["settings"]["camera"], true);

    Ok(())
}

/// Other peers see join, update and exactly one leave for a connection.
#[tokio::test]
async fn test_presence_deltas_join_update_leave() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;

    let mut watcher = server.connect_client().await?;
    register(&mut watcher, "Bob", None).await?;

    let mut streamer = server.connect_client().await?;
    register(&mut streamer, "Ann", None).await?;
    let streamer_id = streamer.connection_id().as_str().to_string();

    let join = watcher.next_event("presenceDelta").await?;
    assert_eq!(join["kind"], "join");
    assert_eq!(join["peer"]["displayName"], "Ann");

    streamer
        .request("updateStreamState", fixtures::go_live("ios"))
        .await?;
    let update = watcher.next_event("presenceDelta").await?;
    assert_eq!(update["kind"], "update");
    assert_eq!(update["peer"]["isStreaming"], true);

    let snapshot = watcher.next_event("presenceSnapshot").await?;
    let live: Vec<&Value> = snapshot["list"]
        .as_array()
        .map(|list| list.iter().collect())
        .unwrap_or_default();
    assert!(live.iter().any(|p| p["connectionId"] == streamer_id.as_str()));

    streamer.close().await?;

    let deltas = watcher
        .events_named("presenceDelta", Duration::from_millis(500))
        .await?;
    let leaves: Vec<&Value> = deltas.iter().filter(|d| d["kind"] == "leave").collect();
    assert_eq!(leaves.len(), 1, "Expected exactly one leave, got {:?}", deltas);
    assert!(leaves.iter().all(|leave| leave["id"] == streamer_id.as_str()));

    Ok(())
}

/// Re-sending an unchanged stream state produces no broadcast.
#[tokio::test]
async fn test_unchanged_stream_state_is_not_broadcast() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;

    let mut watcher = server.connect_client().await?;
    register(&mut watcher, "Bob", None).await?;
    let mut streamer = server.connect_client().await?;
    register(&mut streamer, "Ann", None).await?;
    streamer
        .request("updateStreamState", fixtures::go_live("web"))
        .await?;
    watcher.drain_events(QUIET_WINDOW).await?;

    let result = streamer
        .request("updateStreamState", fixtures::go_live("web"))
        .await?;
    assert_eq!(result["ok"], true);

    let events = watcher.drain_events(QUIET_WINDOW).await?;
    assert!(
        events
            .iter()
            .all(|e| e["name"] != "presenceDelta" && e["name"] != "presenceSnapshot"),
        "Unexpected broadcast: {:?}",
        events
    );

    Ok(())
}

// ============================================================================
// Media
// ============================================================================

/// `getCapabilities` narrows the router's codecs to the configured set plus
/// their retransmission entries.
#[tokio::test]
async fn test_get_capabilities_filters_router_codecs() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;
    let router: RtpCapabilities = serde_json::from_value(serde_json::json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2, "preferredPayloadType": 100 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000, "preferredPayloadType": 101 },
            { "kind": "video", "mimeType": "video/rtx", "clockRate": 90000, "preferredPayloadType": 102,
              "parameters": { "apt": 101 } },
            { "kind": "video", "mimeType": "video/H264", "clockRate": 90000, "preferredPayloadType": 103 },
            { "kind": "video", "mimeType": "video/rtx", "clockRate": 90000, "preferredPayloadType": 104,
              "parameters": { "apt": 103 } }
        ],
        "headerExtensions": [{ "uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "preferredId": 1 }]
    }))?;
    server.engine().set_router_capabilities(router);

    let mut client = server.connect_client().await?;
    let result = client.request("getCapabilities", Value::Null).await?;

    let codecs = result["codecs"].as_array().cloned().unwrap_or_default();
    let payload_types: Vec<u64> = codecs
        .iter()
        .filter_map(|codec| codec["preferredPayloadType"].as_u64())
        .collect();
    assert_eq!(payload_types, vec![100, 101, 102], "got {}", result);
    assert!(codecs
        .iter()
        .all(|codec| codec["mimeType"] != "video/H264"));
    assert_eq!(
        result["headerExtensions"],
        serde_json::json!([{ "uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "preferredId": 1 }])
    );

    Ok(())
}

#[tokio::test]
async fn test_get_capabilities_surfaces_engine_error() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;
    server.engine().fail("rtp_capabilities", "router not ready");

    let mut client = server.connect_client().await?;
    let result = client.request("getCapabilities", Value::Null).await?;

    assert_eq!(error_of(&result), ("router not ready", 9));

    Ok(())
}

#[tokio::test]
async fn test_produce_without_send_transport() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;
    let mut client = server.connect_client().await?;
    register(&mut client, "Ann", None).await?;

    let result = client.request("produce", fixtures::produce("video")).await?;

    assert_eq!(error_of(&result), ("No send transport", 4));

    Ok(())
}

/// Transport parameters come back to the client and `connectTransport`
/// reaches the engine.
#[tokio::test]
async fn test_open_and_connect_transport() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;
    let mut client = server.connect_client().await?;
    register(&mut client, "Ann", None).await?;

    let result = client
        .request("openTransport", fixtures::open_transport("send"))
        .await?;
    let transport_id = result["id"].as_str().unwrap_or_default().to_string();
    assert!(!transport_id.is_empty());
    assert!(result.get("iceParameters").is_some());
    assert!(result.get("dtlsParameters").is_some());

    let connected = client
        .request("connectTransport", fixtures::connect_transport(&transport_id))
        .await?;
    assert_eq!(connected["ok"], true);
    assert!(server
        .engine()
        .calls()
        .contains(&EngineCall::ConnectTransport(transport_id)));

    let unknown = client
        .request("connectTransport", fixtures::connect_transport("transport-x"))
        .await?;
    assert_eq!(error_of(&unknown), ("Transport not found", 4));

    Ok(())
}

/// A new producer is announced to everyone but its owner, and listed by
/// `getPeerProducers`.
#[tokio::test]
async fn test_new_producer_announced_to_peers() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;

    let mut owner = server.connect_client().await?;
    register(&mut owner, "Ann", None).await?;
    let mut viewer = server.connect_client().await?;
    register(&mut viewer, "Bob", None).await?;

    open_transport(&mut owner, "send").await?;
    let producer_id = produce(&mut owner, "video").await?;

    let announced = viewer.next_event("newProducer").await?;
    assert_eq!(announced["producerId"], producer_id.as_str());
    assert_eq!(announced["kind"], "video");
    assert_eq!(announced["ownerConnectionId"], owner.connection_id().as_str());

    let owner_events = owner.events_named("newProducer", QUIET_WINDOW).await?;
    assert!(owner_events.is_empty());

    let producers = viewer
        .request(
            "getPeerProducers",
            fixtures::peer_ref(owner.connection_id().as_str()),
        )
        .await?;
    assert_eq!(
        producers,
        serde_json::json!([{ "producerId": producer_id, "kind": "video" }])
    );

    Ok(())
}

/// Full consume flow: the consumer is created paused and resumed by the
/// server after the configured delay.
#[tokio::test]
async fn test_consume_is_resumed_by_server() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;

    let mut owner = server.connect_client().await?;
    register(&mut owner, "Ann", None).await?;
    let mut viewer = server.connect_client().await?;
    register(&mut viewer, "Bob", None).await?;

    open_transport(&mut owner, "send").await?;
    let producer_id = produce(&mut owner, "video").await?;
    open_transport(&mut viewer, "recv").await?;

    let consumed = viewer
        .request("consume", fixtures::consume(&producer_id))
        .await?;
    let consumer_id = consumed["id"].as_str().unwrap_or_default().to_string();
    assert!(!consumer_id.is_empty(), "consume failed: {}", consumed);
    assert_eq!(consumed["producerId"], producer_id.as_str());
    assert_eq!(consumed["ownerConnectionId"], owner.connection_id().as_str());

    let engine = server.engine();
    assert!(engine.calls().iter().any(|call| matches!(
        call,
        EngineCall::Consume { paused: true, .. }
    )));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !engine
        .calls()
        .contains(&EngineCall::ResumeConsumer(consumer_id.clone()))
    {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Consumer was never resumed"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Ok(())
}

#[tokio::test]
async fn test_consume_with_incompatible_capabilities() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;

    let mut owner = server.connect_client().await?;
    register(&mut owner, "Ann", None).await?;
    let mut viewer = server.connect_client().await?;
    register(&mut viewer, "Bob", None).await?;
    open_transport(&mut owner, "send").await?;
    let producer_id = produce(&mut owner, "audio").await?;
    open_transport(&mut viewer, "recv").await?;

    server.engine().set_can_consume(false);
    let result = viewer
        .request("consume", fixtures::consume(&producer_id))
        .await?;

    assert_eq!(error_of(&result), ("Cannot consume", 8));

    Ok(())
}

/// The owner leaving while a consume is in flight: the late consumer is
/// closed and the viewer gets an error instead of a dangling consumer.
#[tokio::test]
async fn test_consume_racing_owner_disconnect() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;
    let engine = server.engine();

    let mut owner = server.connect_client().await?;
    register(&mut owner, "Ann", None).await?;
    let mut viewer = server.connect_client().await?;
    register(&mut viewer, "Bob", None).await?;
    open_transport(&mut owner, "send").await?;
    let producer_id = produce(&mut owner, "video").await?;
    open_transport(&mut viewer, "recv").await?;

    engine.hold_consume();
    let request = serde_json::json!({
        "id": 900,
        "method": "consume",
        "params": fixtures::consume(&producer_id),
    });
    viewer.send_raw(&request.to_string()).await?;
    engine.consume_started.notified().await;

    owner.close().await?;
    server
        .wait_for_status(Duration::from_secs(2), |s| s.session_count == 1)
        .await?;
    engine.release_consume();

    let result = viewer.response(900).await?;
    assert_eq!(error_of(&result), ("Producer not found", 4));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let closed_consumers = engine
            .closed()
            .into_iter()
            .filter(|h| matches!(h, EngineHandle::Consumer(_)))
            .count();
        if closed_consumers == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "Orphaned consumer was not closed"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Ok(())
}

/// Closing a producer tells its viewers and closes their consumers.
#[tokio::test]
async fn test_close_producer_notifies_viewers() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;

    let mut owner = server.connect_client().await?;
    register(&mut owner, "Ann", None).await?;
    let mut viewer = server.connect_client().await?;
    register(&mut viewer, "Bob", None).await?;
    open_transport(&mut owner, "send").await?;
    let producer_id = produce(&mut owner, "video").await?;
    open_transport(&mut viewer, "recv").await?;
    let consumed = viewer
        .request("consume", fixtures::consume(&producer_id))
        .await?;
    let consumer_id = consumed["id"].as_str().unwrap_or_default().to_string();

    let result = owner
        .request("closeProducer", fixtures::producer_ref(&producer_id))
        .await?;
    assert_eq!(result["ok"], true);

    let closed = viewer.next_event("producerClosed").await?;
    assert_eq!(closed["producerId"], producer_id.as_str());
    assert_eq!(closed["ownerConnectionId"], owner.connection_id().as_str());

    let resumed = viewer
        .request("resume", fixtures::consumer_ref(&consumer_id))
        .await?;
    assert_eq!(error_of(&resumed), ("Consumer not found", 4));

    Ok(())
}

/// Engine failures are surfaced to the client verbatim.
#[tokio::test]
async fn test_engine_error_surfaced_to_client() -> Result<(), anyhow::Error> {
    let server = TestPcServer::spawn().await?;
    let mut client = server.connect_client().await?;
    register(&mut client, "Ann", None).await?;

    server
        .engine()
        .fail("create_transport", "router overloaded");
    let result = client
        .request("openTransport", fixtures::open_transport("send"))
        .await?;

    let (message, code) = error_of(&result);
    assert!(message.contains("router overloaded"), "got {}", message);
    assert_eq!(code, 9);

    Ok(())
}
