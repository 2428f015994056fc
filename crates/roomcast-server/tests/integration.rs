//! End-to-end tests: real sockets against `Server::start` on an ephemeral port.

use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use roomcast_server::{
    MiddlewareContext, MiddlewareError, Middleware, Next, Server, ServerError, ServerHandle,
    middleware_fn,
};
use roomcast_settings::{ServerSettings, SettingsError};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

fn settings() -> ServerSettings {
    ServerSettings {
        hostname: "127.0.0.1".into(),
        port: 0,
        ..ServerSettings::default()
    }
}

/// Server with a few application listeners used across tests:
///
/// - on connect: `["welcome", <client id>]`
/// - `["join_room", room]` → joins, replies `["joined", room]`
/// - `["ping", ...args]` → replies `["pong", ...args]`
fn app(settings: ServerSettings) -> Server {
    let server = Server::new(settings);
    let _ = server.on_connect(|(client, _)| {
        let _ = client.invoke("welcome", &[json!(client.id().as_str())]);
        async {}
    });
    let _ = server.on("join_room", |(client, args)| {
        if let Some(room) = args.first().and_then(Value::as_str) {
            let _ = client.join(room);
            let _ = client.invoke("joined", &[json!(room)]);
        }
        async {}
    });
    let _ = server.on("ping", |(client, args)| {
        let _ = client.invoke("pong", &args);
        async {}
    });
    server
}

async fn connect(handle: &ServerHandle) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/", handle.local_addr()))
        .await
        .expect("websocket connect");
    ws
}

/// Connect and consume the welcome frame. Returns the client and its id.
async fn connect_welcomed(handle: &ServerHandle) -> (Client, String) {
    let mut ws = connect(handle).await;
    let welcome = recv(&mut ws).await;
    assert_eq!(welcome[0], "welcome");
    let id = welcome[1].as_str().unwrap().to_owned();
    (ws, id)
}

async fn send(ws: &mut Client, frame: Value) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

/// Next text frame, parsed. Panics on timeout or close.
async fn recv(ws: &mut Client) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<Value>(text.as_str()).unwrap();
                }
                Some(Ok(_)) => {}
                other => panic!("connection ended while waiting for a frame: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

async fn join(ws: &mut Client, room: &str) {
    send(ws, json!(["join_room", room])).await;
    assert_eq!(recv(ws).await, json!(["joined", room]));
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn room_broadcast_reaches_only_members() {
    let server = app(settings());
    let handle = server.start().await.unwrap();

    let (mut a, _) = connect_welcomed(&handle).await;
    let (mut b, b_id) = connect_welcomed(&handle).await;
    let (mut c, _) = connect_welcomed(&handle).await;

    join(&mut a, "lobby").await;
    join(&mut b, "lobby").await;
    assert_eq!(
        recv(&mut a).await,
        json!(["join", {"roomId": "lobby", "userId": b_id}])
    );

    let room = server.room_manager().get_room("lobby").unwrap();
    assert_eq!(room.broadcast("news", &[json!("hi")]), 2);

    assert_eq!(recv(&mut a).await, json!(["news", "hi"]));
    assert_eq!(recv(&mut b).await, json!(["news", "hi"]));

    // Per-connection order is FIFO, so a stray "news" would arrive first.
    send(&mut c, json!(["ping", "marker"])).await;
    assert_eq!(recv(&mut c).await, json!(["pong", "marker"]));

    server.shutdown(handle, Some(WAIT)).await;
}

#[tokio::test]
async fn server_broadcast_reaches_every_client() {
    let server = app(settings());
    let handle = server.start().await.unwrap();

    let (mut a, _) = connect_welcomed(&handle).await;
    let (mut b, _) = connect_welcomed(&handle).await;

    assert_eq!(server.broadcast("tick", &[json!(42)]), 2);
    assert_eq!(recv(&mut a).await, json!(["tick", 42]));
    assert_eq!(recv(&mut b).await, json!(["tick", 42]));

    server.shutdown(handle, Some(WAIT)).await;
}

struct StallOn(&'static str);

#[async_trait]
impl Middleware for StallOn {
    async fn handle(
        &self,
        ctx: &mut MiddlewareContext,
        next: &mut Next,
    ) -> Result<(), MiddlewareError> {
        if ctx.event() == self.0 {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
        next.proceed();
        Ok(())
    }
}

#[tokio::test]
async fn stalled_middleware_does_not_block_other_connections() {
    let server = app(settings());
    let _ = server.use_middleware(StallOn("slow"));
    let handle = server.start().await.unwrap();

    let (mut a, _) = connect_welcomed(&handle).await;
    let (mut b, _) = connect_welcomed(&handle).await;

    send(&mut a, json!(["slow"])).await;
    send(&mut b, json!(["ping", 1])).await;
    assert_eq!(recv(&mut b).await, json!(["pong", 1]));

    server.stop();
}

#[tokio::test]
async fn client_close_during_stalled_dispatch_tears_down() {
    let server = app(settings());
    let _ = server.use_middleware(StallOn("slow"));
    let handle = server.start().await.unwrap();

    let (mut a, _) = connect_welcomed(&handle).await;
    join(&mut a, "lobby").await;
    send(&mut a, json!(["slow"])).await;
    a.close(None).await.unwrap();

    wait_until(|| server.connection_count() == 0).await;
    assert!(server.room_manager().get_room("lobby").is_none());

    server.shutdown(handle, Some(WAIT)).await;
}

#[tokio::test]
async fn stop_during_stalled_dispatch_closes_session() {
    let server = app(settings());
    let _ = server.use_middleware(StallOn("slow"));
    let handle = server.start().await.unwrap();

    let (mut a, _) = connect_welcomed(&handle).await;
    send(&mut a, json!(["slow"])).await;
    send(&mut a, json!(["ping", 1])).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.stop();

    let close = tokio::time::timeout(WAIT, async {
        loop {
            match a.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => {}
                other => panic!("expected a close frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("no close frame");
    assert_eq!(close.map(|f| f.code), Some(CloseCode::Away));

    wait_until(|| server.connection_count() == 0).await;
    handle.stopped().await;
}

#[tokio::test]
async fn late_join_after_disconnect_creates_no_room() {
    let server = app(settings());
    let _ = server.on("later", |(client, _)| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = client.join("ghost");
    });
    let handle = server.start().await.unwrap();

    let (mut a, _) = connect_welcomed(&handle).await;
    send(&mut a, json!(["later"])).await;
    a.close(None).await.unwrap();

    wait_until(|| server.connection_count() == 0).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(server.room_manager().get_room("ghost").is_none());
    assert!(server.room_manager().is_empty());

    server.shutdown(handle, Some(WAIT)).await;
}

#[tokio::test]
async fn middleware_rewrites_reach_listeners() {
    let server = app(settings());
    let _ = server.use_middleware(middleware_fn(|ctx, next| {
        if ctx.event() == "ping" {
            ctx.args.push(json!("checked"));
        }
        next.proceed();
        Ok(())
    }));
    let handle = server.start().await.unwrap();

    let (mut a, _) = connect_welcomed(&handle).await;
    send(&mut a, json!(["ping", 7])).await;
    assert_eq!(recv(&mut a).await, json!(["pong", 7, "checked"]));

    server.shutdown(handle, Some(WAIT)).await;
}

#[tokio::test]
async fn halted_chain_suppresses_emit_when_configured() {
    let server = app(ServerSettings {
        dispatch_on_halt: false,
        ..settings()
    });
    let _ = server.use_middleware(middleware_fn(|ctx, next| {
        if ctx.event() != "blocked" {
            next.proceed();
        }
        Ok(())
    }));
    let _ = server.on("blocked", |(client, _)| {
        let _ = client.invoke("leaked", &[]);
        async {}
    });
    let handle = server.start().await.unwrap();

    let (mut a, _) = connect_welcomed(&handle).await;
    send(&mut a, json!(["blocked"])).await;
    send(&mut a, json!(["ping"])).await;
    assert_eq!(recv(&mut a).await, json!(["pong"]));

    server.shutdown(handle, Some(WAIT)).await;
}

#[tokio::test]
async fn malformed_frame_keeps_connection_open() {
    let server = app(settings());
    let handle = server.start().await.unwrap();

    let (mut a, _) = connect_welcomed(&handle).await;
    a.send(Message::text("not json")).await.unwrap();
    send(&mut a, json!({"not": "an array"})).await;
    send(&mut a, json!(["ping", "still-here"])).await;
    assert_eq!(recv(&mut a).await, json!(["pong", "still-here"]));
    assert_eq!(server.connection_count(), 1);

    server.shutdown(handle, Some(WAIT)).await;
}

#[tokio::test]
async fn binary_utf8_frames_are_accepted() {
    let server = app(settings());
    let handle = server.start().await.unwrap();

    let (mut a, _) = connect_welcomed(&handle).await;
    a.send(Message::binary(br#"["ping","bin"]"#.to_vec()))
        .await
        .unwrap();
    assert_eq!(recv(&mut a).await, json!(["pong", "bin"]));

    server.shutdown(handle, Some(WAIT)).await;
}

#[tokio::test]
async fn disconnect_removes_client_from_every_room() {
    let server = app(settings());
    let handle = server.start().await.unwrap();

    let (mut a, a_id) = connect_welcomed(&handle).await;
    let (mut b, _) = connect_welcomed(&handle).await;
    join(&mut a, "lobby").await;
    join(&mut a, "side").await;
    join(&mut b, "lobby").await;
    let _ = recv(&mut a).await; // b's join notice

    a.close(None).await.unwrap();

    assert_eq!(
        recv(&mut b).await,
        json!(["leave", {"roomId": "lobby", "userId": a_id}])
    );
    let rooms = server.room_manager().clone();
    wait_until(|| server.connection_count() == 1).await;
    assert!(rooms.get_room("side").is_none());
    let lobby = rooms.get_room("lobby").unwrap();
    assert!(!lobby.contains(&a_id));
    assert_eq!(lobby.len(), 1);

    server.shutdown(handle, Some(WAIT)).await;
}

#[tokio::test]
async fn on_connect_receives_request_metadata() {
    let server = Server::new(settings());
    let _ = server.on_connect(|(client, args)| {
        let _ = client.invoke("meta", &args);
        async {}
    });
    let handle = server.start().await.unwrap();

    let mut request = format!("ws://{}/", handle.local_addr())
        .into_client_request()
        .unwrap();
    let _ = request
        .headers_mut()
        .insert("x-user", "alice".parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();

    let meta = recv(&mut ws).await;
    assert_eq!(meta[0], "meta");
    assert_eq!(meta[1]["path"], "/");
    assert_eq!(meta[1]["headers"]["x-user"], "alice");

    server.shutdown(handle, Some(WAIT)).await;
}

#[tokio::test]
async fn direct_message_via_to() {
    let server = app(settings());
    let _ = server.on("dm", |(client, args)| {
        let target = args.first().and_then(Value::as_str).unwrap_or_default();
        if let Some(peer) = client.to(target) {
            let _ = peer.invoke("dm", &[json!(client.id().as_str()), args[1].clone()]);
        }
        async {}
    });
    let handle = server.start().await.unwrap();

    let (mut a, a_id) = connect_welcomed(&handle).await;
    let (mut b, b_id) = connect_welcomed(&handle).await;
    send(&mut a, json!(["dm", b_id, "psst"])).await;
    assert_eq!(recv(&mut b).await, json!(["dm", a_id, "psst"]));

    server.shutdown(handle, Some(WAIT)).await;
}

#[tokio::test]
async fn non_upgrade_request_gets_501() {
    let server = app(settings());
    let handle = server.start().await.unwrap();

    let resp = reqwest::get(format!("http://{}/", handle.local_addr()))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 501);

    let health: Value = reqwest::get(format!("http://{}/health", handle.local_addr()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 0);

    server.shutdown(handle, Some(WAIT)).await;
}

// The only test in this binary that installs the global recorder.
#[tokio::test]
async fn metrics_endpoint_counts_connections() {
    let recorder = roomcast_server::metrics::install_recorder().unwrap();
    let server = app(settings()).with_metrics(recorder);
    let handle = server.start().await.unwrap();

    let (_a, _) = connect_welcomed(&handle).await;
    let body = reqwest::get(format!("http://{}/metrics", handle.local_addr()))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("ws_connections_total"), "{body}");
    assert!(body.contains("ws_connections_active"), "{body}");

    server.shutdown(handle, Some(WAIT)).await;
}

#[tokio::test]
async fn connection_limit_refuses_upgrade() {
    let server = app(ServerSettings {
        max_connections: 1,
        ..settings()
    });
    let handle = server.start().await.unwrap();

    let (_a, _) = connect_welcomed(&handle).await;
    let refused = connect_async(format!("ws://{}/", handle.local_addr())).await;
    assert_matches!(
        refused,
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) if resp.status().as_u16() == 503
    );

    server.shutdown(handle, Some(WAIT)).await;
}

#[tokio::test]
async fn stop_closes_open_sessions() {
    let server = app(settings());
    let handle = server.start().await.unwrap();
    let (mut a, _) = connect_welcomed(&handle).await;

    server.stop();

    let close = tokio::time::timeout(WAIT, async {
        loop {
            match a.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => {}
                other => panic!("expected a close frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("no close frame");
    assert_eq!(close.map(|f| f.code), Some(CloseCode::Away));

    wait_until(|| server.connection_count() == 0).await;
    handle.stopped().await;
}

#[tokio::test]
async fn secure_without_tls_files_fails_start() {
    let server = app(ServerSettings {
        secure: true,
        key_file: Some("key.pem".into()),
        ..settings()
    });
    assert_matches!(
        server.start().await,
        Err(ServerError::Config(SettingsError::MissingTlsMaterial("certFile")))
    );
}
