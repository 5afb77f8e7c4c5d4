//! Connection lifecycle, correlation and routing against an in-memory peer.

mod common;

use std::time::Duration;

use common::{full_server, mock_pair, ready_connection};
use mcpsim_client::{
    AnomalyKind, ConnectionConfig, ConnectionState, Event, EventKind, Outcome, Query, Session,
};
use mcpsim_client::Connection;
use mcpsim_protocol::ErrorKind;
use mcpsim_protocol::RequestId;
use mcpsim_protocol::types::ExecutionOutcome;
use mcpsim_transport::{Framing, PipeTransport, Transport, TransportError};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio_test::assert_ok;

fn count(events: &[Event], predicate: impl Fn(&EventKind) -> bool) -> usize {
    events.iter().filter(|event| predicate(&event.kind)).count()
}

fn anomalies(events: &[Event], kind: &AnomalyKind) -> usize {
    count(events, |event| {
        matches!(event, EventKind::Anomaly { anomaly, .. } if anomaly == kind)
    })
}

#[tokio::test]
async fn test_negotiation_intersects_capabilities() {
    let offer = mcpsim_protocol::CapabilitySet::client_default().without("sampling");
    let (connection, _peer) = ready_connection(
        json!({"tools": {}, "resources": {"subscribe": true}, "sampling": {}}),
        ConnectionConfig::default().with_offer(offer),
    )
    .await;

    assert_eq!(connection.state(), ConnectionState::Ready);
    let caps = connection.capabilities().expect("negotiated");
    assert_eq!(caps.features().collect::<Vec<_>>(), vec!["resources", "tools"]);
    assert!(!connection.sampling_enabled());
    assert_eq!(
        connection.server_info().map(|info| info.name.as_str()),
        Some("mock-server")
    );

    let transitions: Vec<String> = connection
        .recent_events(100)
        .into_iter()
        .filter_map(|event| match event.kind {
            EventKind::StateChanged { to, .. } => Some(to.name().to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(transitions, vec!["connecting", "negotiating", "ready"]);
}

#[tokio::test]
async fn test_invocation_before_ready_sends_nothing() {
    let (transport, peer) = mock_pair();
    let connection = Connection::new(transport, ConnectionConfig::default());

    let err = connection.list_tools().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
    assert_eq!(peer.sends(), 0);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disabled_feature_is_capability_error_without_traffic() {
    let (connection, peer) =
        ready_connection(json!({"resources": {}, "prompts": {}}), ConnectionConfig::default())
            .await;
    let sent_before = peer.sends();

    let err = connection
        .execute_tool("calculator", json!({"expression": "1+1"}))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::CapabilityNotSupported);
    assert_eq!(peer.sends(), sent_before);
    assert_eq!(connection.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_peer_hang_up_fails_pending_request_once() {
    let (connection, mut peer) = ready_connection(full_server(), ConnectionConfig::default()).await;

    for _ in 0..5 {
        let call = connection.start(&Query::list_tools()).await.unwrap();
        let request = peer.expect("tools/list").await;
        peer.reply(&request["id"], json!({"tools": []}));
        assert_ok!(call.wait().await);
    }

    let call = connection.start(&Query::list_tools()).await.unwrap();
    assert_eq!(call.id(), &RequestId::from(7));
    peer.expect("tools/list").await;
    peer.hang_up();

    let err = call.wait().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Transport);
    assert_eq!(err.request_id, Some(RequestId::from(7)));
    assert!(matches!(connection.state(), ConnectionState::Failed { .. }));
    assert!(!connection.transport().is_open());

    let events = connection.recent_events(1000);
    assert_eq!(
        count(&events, |event| matches!(
            event,
            EventKind::RequestAbandoned { id, outcome: Outcome::Failed, .. } if *id == RequestId::from(7)
        )),
        1
    );
    assert_eq!(anomalies(&events, &AnomalyKind::ConnectionFailed), 1);

    let err = connection.list_tools().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_out_of_order_replies_keep_session_order() {
    let (connection, mut peer) = ready_connection(full_server(), ConnectionConfig::default()).await;

    // id 2
    let warm_up = connection.start(&Query::list_prompts()).await.unwrap();
    let request = peer.expect("prompts/list").await;
    peer.reply(&request["id"], json!({"prompts": []}));
    assert_ok!(warm_up.wait().await);

    let session = Session::new();
    let third = tokio::spawn(session.track(&connection, Query::list_tools()));
    let request3 = peer.expect("tools/list").await;
    let fourth = tokio::spawn(session.track(&connection, Query::list_resources()));
    let request4 = peer.expect("resources/list").await;
    assert_eq!(request3["id"], json!(3));
    assert_eq!(request4["id"], json!(4));

    peer.reply(&request4["id"], json!({"resources": [{"uri": "file:///r"}]}));
    peer.reply(&request3["id"], json!({"tools": [{"id": "t"}]}));

    let tools = third.await.unwrap().unwrap();
    let resources = fourth.await.unwrap().unwrap();
    assert_eq!(tools, json!({"tools": [{"id": "t"}]}));
    assert_eq!(resources, json!({"resources": [{"uri": "file:///r"}]}));

    let turns = session.turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].request_id, Some(RequestId::from(3)));
    assert_eq!(turns[0].query, Query::list_tools());
    assert_eq!(turns[1].request_id, Some(RequestId::from(4)));
    assert!(turns.iter().all(|turn| turn.reply.is_settled()));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_expires_request_and_late_reply_is_anomaly() {
    let config = ConnectionConfig::default().with_request_timeout(Some(Duration::from_secs(1)));
    let (connection, mut peer) = ready_connection(full_server(), config).await;

    let call = connection.start(&Query::list_tools()).await.unwrap();
    let request = peer.expect("tools/list").await;
    let err = call.wait().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(connection.pending(), 0);

    peer.reply(&request["id"], json!({"tools": []}));

    // The next exchange proves the reader got past the late reply
    let next = tokio::spawn({
        let connection = connection.clone();
        async move { connection.list_prompts().await }
    });
    let request = peer.expect("prompts/list").await;
    peer.reply(&request["id"], json!({"prompts": []}));
    assert_ok!(next.await.unwrap());

    let events = connection.recent_events(1000);
    assert_eq!(anomalies(&events, &AnomalyKind::UnknownResponseId), 1);
    assert_eq!(
        count(&events, |event| matches!(
            event,
            EventKind::RequestAbandoned { outcome: Outcome::Timeout, .. }
        )),
        1
    );
    assert_eq!(connection.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_cancel_one_request() {
    let (connection, mut peer) = ready_connection(full_server(), ConnectionConfig::default()).await;

    let call = connection.start(&Query::list_tools()).await.unwrap();
    peer.expect("tools/list").await;
    assert!(call.cancel());
    assert!(!call.cancel());
    assert_eq!(call.wait().await.unwrap_err().kind, ErrorKind::Cancelled);
    assert_eq!(connection.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_close_cancels_pending_and_is_idempotent() {
    let (connection, mut peer) = ready_connection(full_server(), ConnectionConfig::default()).await;

    let call = connection.start(&Query::list_resources()).await.unwrap();
    peer.expect("resources/list").await;

    assert_ok!(connection.close().await);
    assert_eq!(call.wait().await.unwrap_err().kind, ErrorKind::Cancelled);
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(!connection.transport().is_open());

    assert_ok!(connection.close().await);
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_shutdown_sends_request_then_closes() {
    let (connection, mut peer) = ready_connection(full_server(), ConnectionConfig::default()).await;

    let closing = tokio::spawn({
        let connection = connection.clone();
        async move { connection.shutdown().await }
    });
    let request = peer.expect("shutdown").await;
    peer.reply(&request["id"], json!({}));

    assert_ok!(closing.await.unwrap());
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_error_envelope_is_application_error() {
    let (connection, mut peer) = ready_connection(full_server(), ConnectionConfig::default()).await;

    let call = connection
        .start(&Query::get_resource("file:///missing"))
        .await
        .unwrap();
    let request = peer.expect("resources/get").await;
    assert_eq!(request["params"], json!({"uri": "file:///missing"}));
    peer.reply_error(&request["id"], -32602, "Resource not found: file:///missing");

    let err = call.wait().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Application);
    assert_eq!(err.rpc_code(), Some(-32602));
    assert_eq!(connection.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_execute_rejection_is_not_an_error() {
    let (connection, mut peer) = ready_connection(full_server(), ConnectionConfig::default()).await;

    let executing = tokio::spawn({
        let connection = connection.clone();
        async move { connection.execute_prompt("greeting", json!({})).await }
    });
    let request = peer.expect("prompts/execute").await;
    assert_eq!(request["params"], json!({"id": "greeting", "args": {}}));
    peer.reply_error(&request["id"], -32602, "Missing required argument: name");

    match executing.await.unwrap().unwrap() {
        ExecutionOutcome::Rejected(rejection) => {
            assert_eq!(rejection.code, Some(-32602));
            assert_eq!(rejection.message, "Missing required argument: name");
        }
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_undecodable_reply_fails_only_its_request() {
    let (connection, mut peer) = ready_connection(full_server(), ConnectionConfig::default()).await;

    let call = connection.start(&Query::list_tools()).await.unwrap();
    peer.expect("tools/list").await;
    peer.send_raw(r#"{"jsonrpc":"1.0","id":2,"result":{}}"#);

    let err = call.wait().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Decode);
    assert_eq!(connection.state(), ConnectionState::Ready);
    assert_eq!(
        anomalies(&connection.recent_events(100), &AnomalyKind::UndecodableFrame),
        1
    );
}

#[tokio::test]
async fn test_non_protocol_output_is_not_fatal() {
    let (connection, mut peer) = ready_connection(full_server(), ConnectionConfig::default()).await;

    peer.fail(TransportError::NonProtocolOutput("Server listening...".into()));
    let call = connection.start(&Query::list_tools()).await.unwrap();
    let request = peer.expect("tools/list").await;
    peer.reply(&request["id"], json!({"tools": []}));
    assert_ok!(call.wait().await);

    assert_eq!(
        anomalies(&connection.recent_events(100), &AnomalyKind::NonProtocolOutput),
        1
    );
    assert_eq!(connection.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_strict_violations_fail_the_connection() {
    let config = ConnectionConfig::default().with_strict_violations(true);
    let (connection, peer) = ready_connection(full_server(), config).await;
    let mut state = connection.watch_state();

    peer.reply(&json!(99), json!({}));

    let failed = state.wait_for(|state| state.is_terminal()).await.unwrap().clone();
    assert!(matches!(failed, ConnectionState::Failed { .. }));
}

#[tokio::test]
async fn test_notifications_arrive_in_wire_order() {
    let (connection, peer) = ready_connection(full_server(), ConnectionConfig::default()).await;
    let mut notifications = connection.subscribe_notifications();

    for n in 0..3 {
        peer.notify("notifications/progress", json!({"n": n}));
    }

    for n in 0..3 {
        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.method, "notifications/progress");
        assert_eq!(notification.params, Some(json!({"n": n})));
    }
}

#[tokio::test]
async fn test_unknown_server_request_is_method_not_found() {
    let (_connection, mut peer) =
        ready_connection(full_server(), ConnectionConfig::default()).await;

    peer.request(json!("r1"), "roots/list", json!({}));
    let reply = peer.next_sent().await;
    assert_eq!(reply["id"], json!("r1"));
    assert_eq!(reply["error"]["code"], json!(-32601));
}

#[tokio::test]
async fn test_describe_resource_filters_list() {
    let (connection, mut peer) = ready_connection(full_server(), ConnectionConfig::default()).await;

    let describing = tokio::spawn({
        let connection = connection.clone();
        async move {
            let found = connection.describe_resource("file:///b").await?;
            let missing = connection.describe_resource("file:///zzz").await?;
            Ok::<_, mcpsim_protocol::Error>((found, missing))
        }
    });
    for _ in 0..2 {
        let request = peer.expect("resources/list").await;
        peer.reply(
            &request["id"],
            json!({"resources": [
                {"uri": "file:///a", "type": "text/plain"},
                {"uri": "file:///b", "type": "application/json", "name": "b"}
            ]}),
        );
    }

    let (found, missing) = describing.await.unwrap().unwrap();
    let found = found.expect("listed");
    assert_eq!(found.name.as_deref(), Some("b"));
    assert_eq!(found.mime_type.as_deref(), Some("application/json"));
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_events_are_sequenced_and_tagged() {
    let (connection, mut peer) = ready_connection(full_server(), ConnectionConfig::default()).await;
    let mut events = connection.subscribe_events(16);

    let call = connection.start(&Query::list_tools()).await.unwrap();
    let request = peer.expect("tools/list").await;
    peer.reply(&request["id"], json!({"tools": []}));
    assert_ok!(call.wait().await);

    let sent = events.recv().await.unwrap();
    let received = events.recv().await.unwrap();
    assert_eq!(sent.connection, connection.id());
    assert_eq!(received.sequence, sent.sequence + 1);
    assert!(matches!(
        sent.kind,
        EventKind::EnvelopeSent { ref method, .. } if method.as_deref() == Some("tools/list")
    ));
    assert!(matches!(
        received.kind,
        EventKind::EnvelopeReceived {
            outcome: Some(Outcome::Success),
            elapsed_ms: Some(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_initialize_error_fails_the_handshake() {
    let (transport, mut peer) = mock_pair();
    let connection = Connection::new(transport, ConnectionConfig::default());

    let connecting = tokio::spawn({
        let connection = connection.clone();
        async move { connection.connect().await }
    });
    let init = peer.expect("initialize").await;
    peer.reply_error(&init["id"], -32603, "server not ready");

    let err = connecting.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Application);
    assert!(matches!(connection.state(), ConnectionState::Failed { .. }));
    assert!(connection.capabilities().is_none());
    assert!(!connection.transport().is_open());
}

#[tokio::test(start_paused = true)]
async fn test_silent_server_misses_the_negotiation_deadline() {
    let (transport, mut peer) = mock_pair();
    let config = ConnectionConfig::default().with_negotiation_timeout(Duration::from_secs(2));
    let connection = Connection::new(transport, config);

    let connecting = tokio::spawn({
        let connection = connection.clone();
        async move { connection.connect().await }
    });
    peer.expect("initialize").await;

    let err = connecting.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(matches!(connection.state(), ConnectionState::Failed { .. }));
    assert_eq!(connection.pending(), 0);
}

#[tokio::test]
async fn test_malformed_server_request_leaves_client_ids_alone() {
    let (connection, mut peer) = ready_connection(full_server(), ConnectionConfig::default()).await;

    let call = connection.start(&Query::list_tools()).await.unwrap();
    let request = peer.expect("tools/list").await;
    assert_eq!(request["id"], json!(2));

    // Same id as the pending call, but it is the server's own request
    peer.send_raw(r#"{"jsonrpc":"2.0","id":2,"method":"sampling/createMessage","params":"bad"}"#);
    let rejection = peer.next_sent().await;
    assert_eq!(rejection["id"], json!(2));
    assert_eq!(rejection["error"]["code"], json!(-32602));
    assert_eq!(connection.pending(), 1);

    peer.send_raw(r#"{"jsonrpc":"2.0","id":"r9","method":""}"#);
    let rejection = peer.next_sent().await;
    assert_eq!(rejection["id"], json!("r9"));
    assert_eq!(rejection["error"]["code"], json!(-32600));

    peer.reply(&request["id"], json!({"tools": []}));
    assert_eq!(call.wait().await.unwrap(), json!({"tools": []}));
    assert_eq!(connection.state(), ConnectionState::Ready);
    assert_eq!(
        anomalies(&connection.recent_events(100), &AnomalyKind::UndecodableFrame),
        2
    );
}

async fn next_request<R: AsyncBufRead + Unpin>(lines: &mut Lines<R>) -> Value {
    let line = lines.next_line().await.unwrap().expect("client wrote nothing");
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn test_invalid_utf8_on_a_pipe_is_not_fatal() {
    let (client, server) = tokio::io::duplex(4096);
    let (read, write) = tokio::io::split(client);
    let connection = Connection::new(
        PipeTransport::from_raw(read, write, Framing::Newline),
        ConnectionConfig::default(),
    );
    let (server_read, mut server_write) = tokio::io::split(server);
    let mut lines = BufReader::new(server_read).lines();

    let connecting = tokio::spawn({
        let connection = connection.clone();
        async move { connection.connect().await }
    });
    let init = next_request(&mut lines).await;
    let reply = json!({
        "jsonrpc": "2.0",
        "id": init["id"],
        "result": {
            "capabilities": full_server(),
            "serverInfo": {"name": "pipe-server", "version": "1.0.0"}
        }
    });
    server_write
        .write_all(format!("{reply}\n").as_bytes())
        .await
        .unwrap();
    assert_ok!(connecting.await.unwrap());
    assert_eq!(next_request(&mut lines).await["method"], json!("notifications/initialized"));

    server_write.write_all(b"\xff\xfe garbage\n").await.unwrap();
    server_write
        .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"\xff\"}\n")
        .await
        .unwrap();

    let listing = tokio::spawn({
        let connection = connection.clone();
        async move { connection.list_tools().await }
    });
    let request = next_request(&mut lines).await;
    let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": {"tools": []}});
    server_write
        .write_all(format!("{reply}\n").as_bytes())
        .await
        .unwrap();
    assert_ok!(listing.await.unwrap());

    assert_eq!(connection.state(), ConnectionState::Ready);
    let events = connection.recent_events(100);
    assert_eq!(anomalies(&events, &AnomalyKind::NonProtocolOutput), 1);
    assert_eq!(anomalies(&events, &AnomalyKind::UndecodableFrame), 1);
}
