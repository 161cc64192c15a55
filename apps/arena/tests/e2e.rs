//! Full session against a local stub of the provisioning API and both
//! runner channels.

use arena_lab::bootstrap::{BootstrapOptions, BootstrapPhase, LabSession};
use arena_lab::config::LabConfig;
use axum::Router;
use axum::Json;
use axum::extract::Path;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde_json::{Value, json};
use std::time::Duration;

async fn progress(Path(_lab_id): Path<String>) -> Json<Value> {
    Json(json!({
        "status": "active",
        "progressLogs": [{"ServiceName": "file_system", "Status": "active"}],
        "testResults": [{"checkpoint": 1, "status": "failed", "durationMs": 12.5}],
        "activeCheckpoint": 1
    }))
}

async fn test_results(Path(_lab_id): Path<String>) -> Json<Value> {
    Json(json!({}))
}

async fn file_system(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(serve_file_system)
}

async fn serve_file_system(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let request_id = frame.get("request_id").cloned().unwrap_or(Value::Null);
        let reply = match frame["type"].as_str() {
            Some("fs_fetch_quest_meta") => json!({
                "type": "quest_meta",
                "status": "success",
                "request_id": request_id,
                "data": {"files": [
                    {"path": "src", "isDir": true},
                    {"path": "src/App.jsx", "isDir": false},
                    {"path": "README.md", "isDir": false}
                ]}
            }),
            Some("fs_fetch_file_content") => json!({
                "type": "file_content",
                "status": "success",
                "request_id": request_id,
                "data": {"path": frame["payload"]["path"], "content": "export default function App() {}"}
            }),
            Some("fs_initialize_client") => json!({"type": "info", "status": "info", "message": "client ready"}),
            _ => continue,
        };
        if socket.send(Message::Text(reply.to_string())).await.is_err() {
            break;
        }
    }
}

async fn pty(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(serve_pty)
}

async fn serve_pty(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if frame["type"] != "test" {
            continue;
        }
        let request: Value = frame["data"]
            .as_str()
            .and_then(|data| serde_json::from_str(data).ok())
            .unwrap_or(Value::Null);
        let checkpoint: u32 = request["checkpointId"]
            .as_str()
            .and_then(|id| id.parse().ok())
            .unwrap_or(0);
        let frames = [
            json!({"type": "test_started", "data": {"checkpointId": checkpoint.to_string()}}),
            json!("$ npm test\r\n"),
            json!({"type": "test_completed", "data": {
                "results": [{"checkpoint": checkpoint, "status": "passed", "durationMs": 42}],
                "activeCheckpoint": checkpoint + 1
            }}),
        ];
        for frame in frames {
            let text = match frame {
                Value::String(raw) => raw,
                other => other.to_string(),
            };
            if socket.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
    }
}

#[tokio::test]
async fn session_bootstraps_and_runs_a_checkpoint_against_stub_runner() {
    let app = Router::new()
        .route("/api/project/progress/:lab_id", get(progress))
        .route("/api/project/start", post(|| async { Json(json!({"ok": true})) }))
        .route("/api/v1/test-results/:lab_id", get(test_results))
        .route("/fs/:lab_id", get(file_system))
        .route("/pty/:lab_id", get(pty));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = LabConfig {
        api_base: format!("http://{addr}"),
        control_url: format!("ws://{addr}/fs/{{lab_id}}"),
        exec_url: format!("ws://{addr}/pty/{{lab_id}}"),
        ..LabConfig::default()
    };
    let session = LabSession::from_config(&config, BootstrapOptions::new("lab-9", "react")).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(20), async {
        session.run().await.unwrap();
        let mut updates = session.subscribe();
        updates
            .wait_for(|snap| snap.phase == BootstrapPhase::FullReady)
            .await
            .unwrap()
            .clone()
    })
    .await
    .expect("session did not become ready");
    assert!(outcome.meta_loaded);
    assert_eq!(outcome.active_file.as_deref(), Some("src/App.jsx"));
    assert_eq!(
        session.files().content("src/App.jsx").as_deref(),
        Some("export default function App() {}")
    );

    let mut output = session.exec().subscribe_output();
    tokio::time::timeout(Duration::from_secs(10), session.run_checkpoint_test("1"))
        .await
        .expect("checkpoint test hung")
        .unwrap();
    let result = session.exec().latest_result("1").unwrap();
    assert!(result.passed);
    assert_eq!(result.duration_ms, Some(42));
    let snapshot = session.exec().snapshot();
    assert_eq!(snapshot.current_checkpoint, Some(2));
    assert_eq!(snapshot.results.len(), 2);
    assert!(!snapshot.results[0].passed);
    assert_eq!(snapshot.results[0].duration_ms, Some(13));
    assert_eq!(output.recv().await.unwrap(), "$ npm test\r\n");

    session.shutdown();
    assert!(!session.files().socket().is_connected());
}
