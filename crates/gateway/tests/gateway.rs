//! Gateway integration tests
//!
//! Each test runs a real listener on a loopback port and talks to it with
//! WebSocket and HTTP clients.

use futures::{SinkExt, StreamExt};
use loco_common::{Instance, InstanceSource};
use loco_gateway::config::{BridgeConfig, MonitorConfig};
use loco_gateway::monitor::recovery::UnmanagedController;
use loco_gateway::{
    ActiveFocusStore, GatewayServer, GatewayState, HealthMonitor, InstanceDirectory,
    RecoveryManager, SignalingRelay,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestGateway {
    addr: SocketAddr,
    state: Arc<GatewayState>,
    _dir: TempDir,
}

impl TestGateway {
    fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn ws(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

fn instance(id: &str, vnc_target: &str, provisioned: bool) -> Instance {
    Instance {
        id: id.to_string(),
        display_name: id.to_string(),
        vnc_target: vnc_target.to_string(),
        stream_url: String::new(),
        provisioned,
        source: InstanceSource::Static,
        ready: true,
        pod_name: None,
        description: None,
        endpoint: None,
    }
}

async fn spawn_gateway(instances: Vec<Instance>) -> TestGateway {
    let dir = tempfile::tempdir().unwrap();

    let directory = Arc::new(InstanceDirectory::new(instances, Duration::from_secs(10)));
    let recovery = Arc::new(RecoveryManager::new(
        directory.clone(),
        Arc::new(UnmanagedController),
        3,
    ));
    let monitor_config = MonitorConfig {
        interval_secs: 60,
        probe_timeout_ms: 500,
        deep_health: false,
        auto_recovery: false,
        ..Default::default()
    };
    let monitor = Arc::new(HealthMonitor::new(directory.clone(), recovery, monitor_config).unwrap());

    let server = GatewayServer::new(GatewayState {
        directory,
        active: Arc::new(ActiveFocusStore::new(dir.path().join("active.json"))),
        signaling: Arc::new(SignalingRelay::new()),
        monitor,
        bridge: BridgeConfig::default(),
        static_dir: None,
        started: Instant::now(),
    });
    let state = server.state().clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve_listener(listener));

    TestGateway {
        addr,
        state,
        _dir: dir,
    }
}

/// TCP server echoing every byte back
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn next_message(ws: &mut Client) -> Message {
    tokio::time::timeout(Duration::from_secs(3), ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("socket closed")
        .expect("socket error")
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        if let Message::Text(text) = next_message(ws).await {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn test_vnc_bridge_relays_bytes_verbatim() {
    let echo = spawn_echo_server().await;
    let gw = spawn_gateway(vec![instance("instance-0", &echo.to_string(), true)]).await;

    let (mut ws, _) = connect_async(gw.ws("/proxy/vnc/instance-0")).await.unwrap();

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    assert_eq!(next_message(&mut ws).await, Message::Binary(vec![1, 2, 3]));

    // Text frames go upstream as their bytes
    ws.send(Message::Text("RFB".into())).await.unwrap();
    assert_eq!(next_message(&mut ws).await, Message::Binary(b"RFB".to_vec()));
}

#[tokio::test]
async fn test_vnc_bridge_accepts_trailing_path() {
    let echo = spawn_echo_server().await;
    let target = format!("vnc://{echo}/");
    let gw = spawn_gateway(vec![instance("instance-4", &target, true)]).await;

    let (mut ws, _) = connect_async(gw.ws("/proxy/vnc/instance-4/websockify"))
        .await
        .unwrap();
    ws.send(Message::Binary(vec![9, 8, 7])).await.unwrap();
    assert_eq!(next_message(&mut ws).await, Message::Binary(vec![9, 8, 7]));
}

#[tokio::test]
async fn test_vnc_bridge_accepts_trailing_slash() {
    let echo = spawn_echo_server().await;
    let gw = spawn_gateway(vec![instance("instance-0", &echo.to_string(), true)]).await;

    let (mut ws, _) = connect_async(gw.ws("/proxy/vnc/instance-0/")).await.unwrap();
    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    assert_eq!(next_message(&mut ws).await, Message::Binary(vec![1, 2, 3]));
}

#[tokio::test]
async fn test_vnc_route_without_upgrade_is_bad_request() {
    let gw = spawn_gateway(vec![instance("instance-0", "127.0.0.1:5901", true)]).await;

    let resp = reqwest::get(gw.http("/proxy/vnc/instance-0")).await.unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_vnc_bridge_closes_when_upstream_refuses() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let gw = spawn_gateway(vec![instance("instance-0", &closed.to_string(), true)]).await;

    let (mut ws, _) = connect_async(gw.ws("/proxy/vnc/instance-0")).await.unwrap();
    let ended = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}

#[tokio::test]
async fn test_unroutable_upgrades_fail_handshake() {
    let gw = spawn_gateway(vec![instance("instance-0", "127.0.0.1:5901", true)]).await;

    assert!(connect_async(gw.ws("/proxy/vnc/ghost")).await.is_err());
    assert!(connect_async(gw.ws("/nowhere")).await.is_err());
    assert!(connect_async(gw.ws("/api/instances")).await.is_err());
}

#[tokio::test]
async fn test_signaling_between_peers() {
    let gw = spawn_gateway(vec![]).await;

    let (mut a, _) = connect_async(gw.ws("/signal")).await.unwrap();
    let (mut b, _) = connect_async(gw.ws("/signal")).await.unwrap();

    send_json(&mut a, json!({"type": "register", "id": "a"})).await;
    assert_eq!(next_json(&mut a).await, json!({"type": "registered", "id": "a"}));
    send_json(&mut b, json!({"type": "register", "id": "b"})).await;
    assert_eq!(next_json(&mut b).await, json!({"type": "registered", "id": "b"}));

    send_json(
        &mut a,
        json!({"type": "signal", "target": "b", "data": {"candidate": "x"}}),
    )
    .await;
    assert_eq!(
        next_json(&mut b).await,
        json!({"type": "signal", "from": "a", "data": {"candidate": "x"}})
    );

    // Unknown target: dropped, nobody hears anything
    send_json(&mut a, json!({"type": "signal", "target": "ghost", "data": 1})).await;
    let silent = tokio::time::timeout(Duration::from_millis(300), a.next()).await;
    assert!(silent.is_err());
    assert_eq!(gw.state.signaling.peer_count(), 2);
}

#[tokio::test]
async fn test_signaling_assigns_id() {
    let gw = spawn_gateway(vec![]).await;
    let (mut peer, _) = connect_async(gw.ws("/signal")).await.unwrap();

    send_json(&mut peer, json!({"type": "register"})).await;
    let reply = next_json(&mut peer).await;
    assert_eq!(reply["type"], "registered");
    assert!(!reply["id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_active_round_trip_over_http() {
    let gw = spawn_gateway(vec![]).await;
    let http = reqwest::Client::new();

    let resp = http
        .post(gw.http("/api/active"))
        .json(&json!({"id": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap(), json!({"active": ["x"]}));

    let current: Value = http
        .get(gw.http("/api/active"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(current, json!({"active": ["x"]}));

    // Release clears the list
    let resp = http
        .post(gw.http("/api/active"))
        .json(&json!({"id": null}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.json::<Value>().await.unwrap(), json!({"active": []}));

    let resp = http
        .post(gw.http("/api/active"))
        .json(&json!({"focus": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_active_writes_are_truncated_and_broadcast() {
    let gw = spawn_gateway(vec![]).await;
    let (mut sub, _) = connect_async(gw.ws("/active")).await.unwrap();
    assert_eq!(next_json(&mut sub).await, json!({"active": []}));

    let ids: Vec<String> = (0..10).map(|i| format!("instance-{i}")).collect();
    let resp: Value = reqwest::Client::new()
        .post(gw.http("/api/active"))
        .json(&json!({ "ids": ids }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["active"].as_array().unwrap().len(), 9);

    let pushed = next_json(&mut sub).await;
    assert_eq!(pushed, resp);
}

#[tokio::test]
async fn test_active_socket_writes() {
    let gw = spawn_gateway(vec![]).await;
    let (mut writer, _) = connect_async(gw.ws("/active")).await.unwrap();
    let (mut watcher, _) = connect_async(gw.ws("/active")).await.unwrap();
    next_json(&mut writer).await;
    next_json(&mut watcher).await;

    send_json(&mut writer, json!({"id": "instance-2"})).await;
    assert_eq!(next_json(&mut watcher).await, json!({"active": ["instance-2"]}));
    assert_eq!(next_json(&mut writer).await, json!({"active": ["instance-2"]}));

    // Malformed frames are ignored and the socket stays usable
    writer.send(Message::Text("not json".into())).await.unwrap();
    send_json(&mut writer, json!({"active": ["instance-1", "instance-3"]})).await;
    assert_eq!(
        next_json(&mut watcher).await,
        json!({"active": ["instance-1", "instance-3"]})
    );
}

#[tokio::test]
async fn test_health_and_not_found() {
    let gw = spawn_gateway(vec![]).await;
    let http = reqwest::Client::new();

    let health: Value = http
        .get(gw.http("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let resp = http.get(gw.http("/api/nope")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].is_string());

    let status: Value = http
        .get(gw.http("/api/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["discoveryMode"], "static");
    assert_eq!(status["monitoring"], false);
}

#[tokio::test]
async fn test_instance_endpoints() {
    let gw = spawn_gateway(vec![
        instance("instance-0", "10.0.0.10:5901", true),
        instance("spare", "10.0.0.11:5901", false),
    ])
    .await;
    let http = reqwest::Client::new();

    let all: Vec<Value> = http
        .get(gw.http("/api/instances"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0]["vncTarget"], "10.0.0.10:5901");

    let provisioned: Vec<Value> = http
        .get(gw.http("/api/instances/provisioned"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(provisioned.len(), 1);

    let live: Value = http
        .get(gw.http("/api/instances/live"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(live["mode"], "static");
    assert_eq!(live["stats"], json!({"total": 2, "ready": 2, "notReady": 0}));
    let zero = &live["instances"][0];
    assert_eq!(zero["id"], "instance-0");
    assert_eq!(zero["status"], "ready");
    assert_eq!(zero["addresses"]["podIP"], "10.0.0.10");
    assert_eq!(zero["ports"]["vnc"], 5901);
    assert_eq!(zero["health"]["ready"], true);
    assert_eq!(zero["health"]["status"], "unknown");

    let info: Value = http
        .get(gw.http("/api/instances/discovery-info"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["kubernetesConfigured"], false);
    assert_eq!(info["staticInstances"], 2);

    let refreshed: Value = http
        .post(gw.http("/api/instances/refresh"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(refreshed["success"], true);
    assert_eq!(refreshed["instances"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_quality_endpoints() {
    let echo = spawn_echo_server().await;
    let gw = spawn_gateway(vec![instance("instance-0", &echo.to_string(), true)]).await;
    let http = reqwest::Client::new();

    let resp = http.get(gw.http("/api/quality/metrics")).send().await.unwrap();
    assert_eq!(resp.status(), 503);

    let resp = http
        .post(gw.http("/api/quality/recover/instance-0"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    gw.state.monitor.run_cycle().await;

    let metrics: Value = http
        .get(gw.http("/api/quality/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["instance-0"]["status"], "healthy");
    assert_eq!(metrics["instance-0"]["availability"], json!({"vnc": true, "stream": true}));

    let resp = http
        .get(gw.http("/api/quality/metrics/ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = http
        .get(gw.http("/api/quality/deep-health/instance-0"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let summary: Value = http
        .get(gw.http("/api/quality/summary"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["healthy"], 1);

    // Healthy instance: recovery is not needed
    let outcome: Value = http
        .post(gw.http("/api/quality/recover/instance-0"))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(outcome["outcome"], "not-needed");

    let resp = http
        .post(gw.http("/api/quality/recover/ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let status: Value = http
        .get(gw.http("/api/quality/recovery-status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["maxAttempts"], 3);
}

#[tokio::test]
async fn test_monitor_control() {
    let gw = spawn_gateway(vec![]).await;
    let http = reqwest::Client::new();

    let started: Value = http
        .post(gw.http("/api/quality/monitor/start"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(started, json!({"action": "start", "running": true, "changed": true}));

    let again: Value = http
        .post(gw.http("/api/quality/monitor/start"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["changed"], false);

    let stopped: Value = http
        .post(gw.http("/api/quality/monitor/stop"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stopped["running"], false);

    let resp = http
        .post(gw.http("/api/quality/monitor/dance"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}
