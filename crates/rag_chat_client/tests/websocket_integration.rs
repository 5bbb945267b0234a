//! Integration tests for the persistent channel: connect, send query, receive events.
//! Uses a minimal in-process WebSocket server (no mocks).

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rag_chat_client::{
    ConversationController, DeliveryStatus, Endpoint, EventKind, Role, ServerEvent, Transport,
    TransportClient,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

const RESPONSE: &str = r#"{"event":"query_response","data":{"query":"What is antimatter?","status":"completed",
    "response":{"query":"What is antimatter?","expanded_queries":["antimatter"],
    "answer":"Matter composed of antiparticles.","sources":["physics.pdf","dirac.epub"],
    "source_attribution":[{"source":"physics.pdf","methods":[{"method":"bm25","confidence":0.8374629}]}]}}}"#;

async fn bind() -> (TcpListener, Endpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, Endpoint::new("127.0.0.1", port))
}

fn free_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

/// Subscribe to every event kind and funnel events into a channel.
fn collect(client: &TransportClient) -> mpsc::UnboundedReceiver<ServerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: rag_chat_client::EventHandler = Arc::new(move |event: &ServerEvent| {
        let _ = tx.send(event.clone());
    });
    for kind in EventKind::ALL {
        client.subscribe(kind, handler.clone());
    }
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn query_round_trip_delivers_events_in_order() {
    let (listener, endpoint) = bind().await;
    let (frame_tx, frame_rx) = oneshot::channel::<String>();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let ws = accept_async(tcp).await.unwrap();
        let (mut write, mut read) = ws.split();
        write
            .send(Message::Text(
                r#"{"event":"connected","data":{"message":"Connected to RAG server","session_id":"sid-1"}}"#.into(),
            ))
            .await
            .unwrap();
        if let Some(Ok(Message::Text(text))) = read.next().await {
            let _ = frame_tx.send(text);
        }
        write
            .send(Message::Text(
                r#"{"event":"query_received","data":{"query":"What is antimatter?","status":"processing"}}"#.into(),
            ))
            .await
            .unwrap();
        write.send(Message::Text(RESPONSE.into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let client = TransportClient::new(endpoint);
    let mut events = collect(&client);
    client.connect();

    assert_eq!(
        next(&mut events).await,
        ServerEvent::Connected {
            session_id: "sid-1".into()
        }
    );
    assert!(client.is_connected());

    client.send_persistent("What is antimatter?");
    let sent: serde_json::Value = serde_json::from_str(&frame_rx.await.unwrap()).unwrap();
    assert_eq!(
        sent,
        serde_json::json!({"event": "send_query", "data": {"query": "What is antimatter?"}})
    );

    assert_eq!(
        next(&mut events).await,
        ServerEvent::QueryReceived {
            query: "What is antimatter?".into()
        }
    );
    match next(&mut events).await {
        ServerEvent::QueryResponse { response } => {
            assert_eq!(response.answer, "Matter composed of antiparticles.");
            assert_eq!(response.sources, vec!["physics.pdf", "dirac.epub"]);
            assert_eq!(
                response.source_attribution[0].methods[0].confidence,
                0.8374629
            );
        }
        other => panic!("expected query_response, got {other:?}"),
    }

    client.disconnect();
}

#[tokio::test]
async fn absent_server_reports_disconnected() {
    let client = TransportClient::new(Endpoint::new("127.0.0.1", free_port()));
    let mut events = collect(&client);

    client.connect();

    match next(&mut events).await {
        ServerEvent::Disconnected { reason } => assert!(reason.is_some()),
        other => panic!("expected disconnected, got {other:?}"),
    }
    assert!(!client.is_connected());
}

#[tokio::test]
async fn server_close_reports_disconnected() {
    let (listener, endpoint) = bind().await;
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        ws.send(Message::Text(
            r#"{"event":"connected","data":{"session_id":"s"}}"#.into(),
        ))
        .await
        .unwrap();
        ws.close(None).await.unwrap();
    });

    let client = TransportClient::new(endpoint);
    let mut events = collect(&client);
    client.connect();

    assert!(matches!(next(&mut events).await, ServerEvent::Connected { .. }));
    match next(&mut events).await {
        ServerEvent::Disconnected { reason } => assert!(reason.is_some()),
        other => panic!("expected disconnected, got {other:?}"),
    }
    assert!(!client.is_connected());

    client.send_persistent("too late");
    assert_eq!(
        next(&mut events).await,
        ServerEvent::Error {
            message: "Not connected to server".into()
        }
    );
}

#[tokio::test]
async fn disconnect_is_idempotent_and_subscriptions_survive_reconnect() {
    let (listener, endpoint) = bind().await;
    tokio::spawn(async move {
        for session in ["first", "second"] {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let hello = format!(r#"{{"event":"connected","data":{{"session_id":"{session}"}}}}"#);
            ws.send(Message::Text(hello)).await.unwrap();
            // Hold the socket until the client closes it.
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        }
    });

    let client = TransportClient::new(endpoint);
    let mut events = collect(&client);

    client.connect();
    assert_eq!(
        next(&mut events).await,
        ServerEvent::Connected {
            session_id: "first".into()
        }
    );

    client.disconnect();
    client.disconnect();
    assert_eq!(
        next(&mut events).await,
        ServerEvent::Disconnected { reason: None }
    );
    assert!(!client.is_connected());

    client.connect();
    assert_eq!(
        next(&mut events).await,
        ServerEvent::Connected {
            session_id: "second".into()
        }
    );
    client.disconnect();
    assert_eq!(
        next(&mut events).await,
        ServerEvent::Disconnected { reason: None }
    );
    assert!(events.try_recv().is_err(), "no duplicate disconnect events");
}

#[tokio::test]
async fn history_request_and_undecodable_frames() {
    let (listener, endpoint) = bind().await;
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let ws = accept_async(tcp).await.unwrap();
        let (mut write, mut read) = ws.split();
        write
            .send(Message::Text(
                r#"{"event":"connected","data":{"session_id":"s"}}"#.into(),
            ))
            .await
            .unwrap();
        let request = read.next().await;
        assert!(matches!(
            request,
            Some(Ok(Message::Text(ref t))) if t.contains("get_conversation")
        ));
        write.send(Message::Text("not json".into())).await.unwrap();
        write
            .send(Message::Text(r#"{"event":"stream_chunk","data":{"chunk":"x"}}"#.into()))
            .await
            .unwrap();
        write
            .send(Message::Text(
                r#"{"event":"conversation_history","data":{"conversation":[
                    {"type":"user","message":"hi","timestamp":"t0"},
                    {"type":"bot","message":{"answer":"hello"},"timestamp":"t1"}]}}"#
                    .into(),
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let client = TransportClient::new(endpoint);
    let mut events = collect(&client);
    client.connect();
    assert!(matches!(next(&mut events).await, ServerEvent::Connected { .. }));

    client.request_history();

    match next(&mut events).await {
        ServerEvent::ConversationHistory { entries } => {
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].kind, "user");
            assert_eq!(entries[1].kind, "bot");
        }
        other => panic!("expected conversation_history, got {other:?}"),
    }
    client.disconnect();
}

#[tokio::test]
async fn bad_response_payload_settles_the_query() {
    let (listener, endpoint) = bind().await;
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let ws = accept_async(tcp).await.unwrap();
        let (mut write, mut read) = ws.split();
        write
            .send(Message::Text(
                r#"{"event":"connected","data":{"session_id":"s"}}"#.into(),
            ))
            .await
            .unwrap();
        let _ = read.next().await;
        write
            .send(Message::Text(
                r#"{"event":"query_response","data":{"query":"q","status":"completed"}}"#.into(),
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let client = Arc::new(TransportClient::new(endpoint));
    let mut events = collect(&client);
    let mut controller = ConversationController::new(client.clone());
    client.connect();
    assert!(matches!(next(&mut events).await, ServerEvent::Connected { .. }));

    controller.submit_query("q").unwrap();
    tokio::time::timeout(Duration::from_secs(5), controller.wait_idle())
        .await
        .expect("query should settle");

    let last = controller.transcript().last().unwrap();
    assert_eq!(last.role, Role::System);
    assert_eq!(last.delivery_status, Some(DeliveryStatus::Failed));
    assert!(last.payload.text().starts_with("Error: Malformed response:"));
    assert_eq!(
        controller.transcript()[1].delivery_status,
        Some(DeliveryStatus::Failed)
    );
    client.disconnect();
}
