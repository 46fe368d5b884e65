use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use synth_relay::{build_relay, config::Config, router, storage::MemoryStore};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay() -> SocketAddr {
    spawn_relay_with(Config::default()).await
}

async fn spawn_relay_with(config: Config) -> SocketAddr {
    let relay = build_relay(Arc::new(MemoryStore::new()), &config);
    let app = router(relay, &config, None);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn send(socket: &mut Socket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn recv(socket: &mut Socket) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Register, then round-trip a get-controller so registration is known to have completed.
async fn register(addr: SocketAddr, id: &str) -> (Socket, Value) {
    let (mut socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    send(&mut socket, json!({"type": "register", "id": id})).await;
    send(&mut socket, json!({"type": "get-controller"})).await;
    let info = recv(&mut socket).await;
    (socket, info)
}

#[tokio::test]
async fn live_offer_is_forwarded_with_source() {
    let addr = spawn_relay().await;
    let (mut controller, info) = register(addr, "controller-abc").await;
    assert_eq!(info, json!({"type": "controller-info", "controllerId": "controller-abc"}));

    let (mut synth, info) = register(addr, "synth-1").await;
    assert_eq!(info["controllerId"], "controller-abc");

    send(
        &mut synth,
        json!({"type": "offer", "target": "controller-abc", "data": {"sdp": "v=0"}}),
    )
    .await;
    assert_eq!(
        recv(&mut controller).await,
        json!({"type": "offer", "source": "synth-1", "data": {"sdp": "v=0"}})
    );
}

#[tokio::test]
async fn answer_for_offline_peer_is_delivered_on_register() {
    let addr = spawn_relay().await;
    let (mut controller, _) = register(addr, "controller-abc").await;
    send(
        &mut controller,
        json!({"type": "answer", "target": "synth-7", "data": {"sdp": "answer"}}),
    )
    .await;
    // Heartbeat + get-controller round trip orders the answer before the synth connects.
    send(&mut controller, json!({"type": "heartbeat"})).await;
    send(&mut controller, json!({"type": "get-controller"})).await;
    recv(&mut controller).await;

    let (mut synth, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    send(&mut synth, json!({"type": "register", "id": "synth-7"})).await;
    assert_eq!(
        recv(&mut synth).await,
        json!({"type": "answer", "source": "controller-abc", "data": {"sdp": "answer"}})
    );
}

#[tokio::test]
async fn malformed_frames_do_not_close_the_socket() {
    let addr = spawn_relay().await;
    let (mut socket, _) = register(addr, "synth-1").await;
    socket
        .send(Message::Text("not json".to_string().into()))
        .await
        .unwrap();
    send(&mut socket, json!({"type": "unknown-kind"})).await;
    send(&mut socket, json!({"type": "get-controller"})).await;
    assert_eq!(recv(&mut socket).await, json!({"type": "controller-info", "controllerId": null}));
}

#[tokio::test]
async fn http_takeover_kicks_current_controller() {
    let addr = spawn_relay().await;
    let (mut first, _) = register(addr, "controller-a").await;
    let http = reqwest::Client::new();
    let endpoint = format!("http://{addr}/controller/active");

    let conflict = http
        .post(&endpoint)
        .json(&json!({"controllerClientId": "controller-b"}))
        .send()
        .await
        .unwrap();
    assert_eq!(conflict.status(), reqwest::StatusCode::CONFLICT);

    let takeover = http
        .post(&endpoint)
        .json(&json!({"controllerClientId": "controller-b", "force": true}))
        .send()
        .await
        .unwrap();
    assert!(takeover.status().is_success());
    let body: Value = takeover.json().await.unwrap();
    assert_eq!(body, json!({"success": true, "takeover": true}));

    assert_eq!(
        recv(&mut first).await,
        json!({"type": "controller-kicked", "newControllerId": "controller-b", "source": "controller-b"})
    );

    let status: Value = http
        .get(format!("{endpoint}?clientId=controller-b"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        status,
        json!({"active": true, "isCurrentClient": true, "controllerClientId": "controller-b"})
    );
}

#[tokio::test]
async fn lock_requests_without_client_id_are_rejected() {
    let addr = spawn_relay().await;
    let http = reqwest::Client::new();
    let endpoint = format!("http://{addr}/controller/active");

    let acquire = http
        .post(&endpoint)
        .json(&json!({"controllerClientId": "  "}))
        .send()
        .await
        .unwrap();
    assert_eq!(acquire.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = acquire.json().await.unwrap();
    assert_eq!(body["error"], "missing_controller_client_id");

    let release = http
        .delete(&endpoint)
        .json(&json!({"controllerClientId": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(release.status(), reqwest::StatusCode::BAD_REQUEST);

    let status: Value = http.get(&endpoint).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["active"], false);
}

#[tokio::test]
async fn release_requires_owner_or_force_sentinel() {
    let addr = spawn_relay().await;
    let (_controller, _) = register(addr, "controller-a").await;
    let http = reqwest::Client::new();
    let endpoint = format!("http://{addr}/controller/active");

    let forbidden = http
        .delete(&endpoint)
        .json(&json!({"controllerClientId": "controller-z"}))
        .send()
        .await
        .unwrap();
    assert_eq!(forbidden.status(), reqwest::StatusCode::FORBIDDEN);

    for expected in [true, false] {
        let body: Value = http
            .delete(&endpoint)
            .json(&json!({"controllerClientId": "force-deactivate"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, json!({"success": true, "released": expected}));
    }
}

async fn wait_for_release(addr: SocketAddr, attempts: usize) -> bool {
    let http = reqwest::Client::new();
    for _ in 0..attempts {
        let status: Value = http
            .get(format!("http://{addr}/controller/active"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if status["active"] == false {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn wait_for_close(socket: &mut Socket, within: Duration) -> bool {
    timeout(within, async {
        loop {
            match socket.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn controller_disconnect_releases_lock() {
    let addr = spawn_relay().await;
    let (controller, _) = register(addr, "controller-a").await;
    drop(controller);
    assert!(
        wait_for_release(addr, 50).await,
        "lock still held after controller socket closed"
    );
}

#[tokio::test]
async fn silent_socket_is_closed_and_releases_lock() {
    let addr = spawn_relay_with(Config {
        idle_timeout_seconds: 1,
        ..Config::default()
    })
    .await;
    let (mut controller, info) = register(addr, "controller-a").await;
    assert_eq!(info["controllerId"], "controller-a");

    assert!(
        wait_for_close(&mut controller, Duration::from_secs(5)).await,
        "idle socket was not closed"
    );
    assert!(wait_for_release(addr, 50).await, "idle controller kept the lock");

    // The peer is unbound too: a fresh offer to it is queued, not lost on a dead socket.
    let (mut synth, info) = register(addr, "synth-1").await;
    assert_eq!(info["controllerId"], Value::Null);
    send(
        &mut synth,
        json!({"type": "offer", "target": "controller-a", "data": {"sdp": "v=0"}}),
    )
    .await;
    send(&mut synth, json!({"type": "get-controller"})).await;
    recv(&mut synth).await;
    let (mut controller, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    send(&mut controller, json!({"type": "register", "id": "controller-a"})).await;
    assert_eq!(
        recv(&mut controller).await,
        json!({"type": "offer", "source": "synth-1", "data": {"sdp": "v=0"}})
    );
}

#[tokio::test]
async fn heartbeats_keep_socket_open_past_idle_timeout() {
    let addr = spawn_relay_with(Config {
        idle_timeout_seconds: 1,
        ..Config::default()
    })
    .await;
    let (mut controller, _) = register(addr, "controller-a").await;

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        send(&mut controller, json!({"type": "heartbeat"})).await;
    }
    send(&mut controller, json!({"type": "get-controller"})).await;
    assert_eq!(
        recv(&mut controller).await,
        json!({"type": "controller-info", "controllerId": "controller-a"})
    );
}

#[tokio::test]
async fn re_registration_closes_previous_socket() {
    let addr = spawn_relay().await;
    let (mut old, _) = register(addr, "synth-1").await;
    let (_new, _) = register(addr, "synth-1").await;
    assert!(
        wait_for_close(&mut old, Duration::from_secs(5)).await,
        "displaced socket was not closed"
    );
}
