// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! HTTP round-trips against an ephemeral server wired to the mock
//! interpreter.

use ces_api_contract::{ExecutionResult, SessionSummary};
use ces_core::testing::MockSpawner;
use ces_rest_server::{Server, ServerConfig};
use serde_json::json;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

struct TestServer {
    base_url: String,
    handle: JoinHandle<()>,
    _workspace: TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn spawn_server(configure: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to ephemeral port");
    let addr = listener.local_addr().expect("port");
    drop(listener);

    let workspace = TempDir::new().expect("workspace root");
    let mut config = ServerConfig {
        bind_addr: addr,
        workspace_root: workspace.path().to_path_buf(),
        ..Default::default()
    };
    configure(&mut config);

    let server = Server::with_spawner(config, Arc::new(MockSpawner)).expect("server");
    let base_url = format!("http://{}", addr);
    let handle = tokio::spawn(async move {
        server.run().await.expect("server run");
    });

    wait_for_health(&base_url).await;
    TestServer {
        base_url,
        handle,
        _workspace: workspace,
    }
}

async fn wait_for_health(base_url: &str) {
    let client = reqwest::Client::new();
    let health = format!("{}/api/v1/health", base_url);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(response) = client.get(&health).send().await {
            if response.status().is_success() {
                return;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("server did not become healthy at {}", health);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn parse_sse(body: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut name = String::new();
    for line in body.lines() {
        if let Some(event_name) = line.strip_prefix("event: ") {
            name = event_name.to_string();
        } else if let Some(data) = line.strip_prefix("data: ") {
            events.push((name.clone(), data.to_string()));
        }
    }
    events
}

#[tokio::test]
async fn health_reports_version_and_session_count() {
    let server = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .get(format!("{}/api/v1/health", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_sessions"], 0);
    assert!(body["version"].as_str().is_some());
}

#[tokio::test]
async fn session_crud_round_trip() {
    let server = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/v1/sessions", server.base_url))
        .json(&json!({ "session_id": "s1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let created: SessionSummary = response.json().await.unwrap();
    assert_eq!(created.id, "s1");

    let duplicate = client
        .post(format!("{}/api/v1/sessions", server.base_url))
        .json(&json!({ "session_id": "s1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), 409);

    let list: serde_json::Value = client
        .get(format!("{}/api/v1/sessions", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["total"], 1);
    assert_eq!(list["items"][0]["id"], "s1");

    let details = client
        .get(format!("{}/api/v1/sessions/s1", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(details.status(), 200);

    let deleted = client
        .delete(format!("{}/api/v1/sessions/s1", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);

    let missing = client
        .get(format!("{}/api/v1/sessions/s1", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn execution_state_survives_across_requests() {
    let server = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/v1/sessions", server.base_url))
        .json(&json!({ "session_id": "s1" }))
        .send()
        .await
        .unwrap();

    let first: ExecutionResult = client
        .post(format!("{}/api/v1/sessions/s1/execute", server.base_url))
        .json(&json!({ "exec_id": "e1", "code": "set x 41" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(first.success);
    assert_eq!(first.surfaced_variables.len(), 1);
    assert_eq!(first.surfaced_variables[0].name, "x");
    assert_eq!(first.surfaced_variables[0].type_repr, "int");

    let second: ExecutionResult = client
        .post(format!("{}/api/v1/sessions/s1/execute", server.base_url))
        .json(&json!({ "exec_id": "e2", "code": "getvar x" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(second.success);
    assert_eq!(second.stdout(), "41\n");
}

#[tokio::test]
async fn duplicate_exec_id_returns_conflict() {
    let server = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/v1/sessions", server.base_url))
        .json(&json!({ "session_id": "s1" }))
        .send()
        .await
        .unwrap();

    let first = client
        .post(format!("{}/api/v1/sessions/s1/execute", server.base_url))
        .json(&json!({ "exec_id": "e1", "code": "print once" }))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let again = client
        .post(format!("{}/api/v1/sessions/s1/execute", server.base_url))
        .json(&json!({ "exec_id": "e1", "code": "print twice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 409);
}

#[tokio::test]
async fn streaming_execution_delivers_live_output() {
    let server = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/v1/sessions", server.base_url))
        .json(&json!({ "session_id": "s1" }))
        .send()
        .await
        .unwrap();

    let code = "print 0\nsleep 60\nprint 1\nsleep 60\nprint 2";
    let accepted = client
        .post(format!("{}/api/v1/sessions/s1/execute", server.base_url))
        .json(&json!({ "exec_id": "e1", "code": code, "stream": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), 202);
    let accepted: serde_json::Value = accepted.json().await.unwrap();
    assert_eq!(accepted["exec_id"], "e1");
    let stream_url = accepted["stream_url"].as_str().unwrap().to_string();

    let body = client
        .get(format!("{}{}", server.base_url, stream_url))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let events = parse_sse(&body);
    let outputs: Vec<String> = events
        .iter()
        .filter(|(name, _)| name == "output")
        .map(|(_, data)| {
            let value: serde_json::Value = serde_json::from_str(data).unwrap();
            value["payload"]["text"].as_str().unwrap_or_default().to_string()
        })
        .collect();
    assert_eq!(outputs, vec!["0\n", "1\n", "2\n"]);

    let result = events
        .iter()
        .find(|(name, _)| name == "result")
        .expect("result event");
    let value: serde_json::Value = serde_json::from_str(&result.1).unwrap();
    assert_eq!(value["payload"]["success"], true);
    assert!(value["terminal"].as_bool().unwrap());

    assert_eq!(events.last().unwrap().0, "done");
}

#[tokio::test]
async fn late_subscriber_observes_the_full_stream() {
    let server = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/v1/sessions", server.base_url))
        .json(&json!({ "session_id": "s1" }))
        .send()
        .await
        .unwrap();

    let code = "print 0\nsleep 80\nprint 1\nsleep 80\nprint 2";
    client
        .post(format!("{}/api/v1/sessions/s1/execute", server.base_url))
        .json(&json!({ "exec_id": "e1", "code": code, "stream": true }))
        .send()
        .await
        .unwrap();

    // Join well after the first chunks were published.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let body = client
        .get(format!(
            "{}/api/v1/sessions/s1/execute/e1/stream",
            server.base_url
        ))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let events = parse_sse(&body);
    let outputs: Vec<String> = events
        .iter()
        .filter(|(name, _)| name == "output")
        .map(|(_, data)| {
            let value: serde_json::Value = serde_json::from_str(data).unwrap();
            value["payload"]["text"].as_str().unwrap_or_default().to_string()
        })
        .collect();
    assert_eq!(outputs, vec!["0\n", "1\n", "2\n"]);
    assert_eq!(events.last().unwrap().0, "done");
}

#[tokio::test]
async fn unknown_execution_stream_is_not_found() {
    let server = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/v1/sessions", server.base_url))
        .json(&json!({ "session_id": "s1" }))
        .send()
        .await
        .unwrap();

    let response = client
        .get(format!(
            "{}/api/v1/sessions/s1/execute/nope/stream",
            server.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn failed_extension_load_is_a_bad_request_and_isolated() {
    let server = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/v1/sessions", server.base_url))
        .json(&json!({ "session_id": "s1" }))
        .send()
        .await
        .unwrap();

    let response = client
        .post(format!("{}/api/v1/sessions/s1/plugins", server.base_url))
        .json(&json!({
            "name": "broken",
            "source": "fail instantiation exploded",
            "config": {}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let problem: serde_json::Value = response.json().await.unwrap();
    assert!(problem["detail"]
        .as_str()
        .unwrap()
        .contains("instantiation exploded"));

    // The session still executes code afterwards.
    let result: ExecutionResult = client
        .post(format!("{}/api/v1/sessions/s1/execute", server.base_url))
        .json(&json!({ "exec_id": "e1", "code": "print fine" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(result.success);
}

#[tokio::test]
async fn successful_extension_load_binds_the_name() {
    let server = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/v1/sessions", server.base_url))
        .json(&json!({ "session_id": "s1" }))
        .send()
        .await
        .unwrap();

    let response = client
        .post(format!("{}/api/v1/sessions/s1/plugins", server.base_url))
        .json(&json!({ "name": "tools", "source": "ok", "config": {"k": "v"} }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let result: ExecutionResult = client
        .post(format!("{}/api/v1/sessions/s1/execute", server.base_url))
        .json(&json!({ "exec_id": "e1", "code": "getvar tools" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(result.success);
}

#[tokio::test]
async fn variables_endpoint_overwrites_bindings() {
    let server = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/v1/sessions", server.base_url))
        .json(&json!({ "session_id": "s1" }))
        .send()
        .await
        .unwrap();

    let response = client
        .post(format!("{}/api/v1/sessions/s1/variables", server.base_url))
        .json(&json!({ "bindings": { "k": "v" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let result: ExecutionResult = client
        .post(format!("{}/api/v1/sessions/s1/execute", server.base_url))
        .json(&json!({ "exec_id": "e1", "code": "getvar k" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(result.stdout(), "v\n");
}

#[tokio::test]
async fn file_upload_and_artifact_download_round_trip() {
    let server = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/v1/sessions", server.base_url))
        .json(&json!({ "session_id": "s1" }))
        .send()
        .await
        .unwrap();

    // "aGk=" is base64 for "hi".
    let upload = client
        .post(format!("{}/api/v1/sessions/s1/files", server.base_url))
        .json(&json!({ "filename": "data.txt", "content_base64": "aGk=" }))
        .send()
        .await
        .unwrap();
    assert_eq!(upload.status(), 201);

    let download = client
        .get(format!(
            "{}/api/v1/sessions/s1/artifacts/data.txt",
            server.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(download.status(), 200);
    assert_eq!(
        download.headers()["content-type"].to_str().unwrap(),
        "text/plain"
    );
    assert_eq!(download.text().await.unwrap(), "hi");

    let missing = client
        .get(format!(
            "{}/api/v1/sessions/s1/artifacts/missing.txt",
            server.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let hostile = client
        .get(format!(
            "{}/api/v1/sessions/s1/artifacts/evil..txt",
            server.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(hostile.status(), 400);

    let bad_upload = client
        .post(format!("{}/api/v1/sessions/s1/files", server.base_url))
        .json(&json!({ "filename": "a..b", "content_base64": "aGk=" }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_upload.status(), 400);
}

#[tokio::test]
async fn artifacts_written_by_code_are_downloadable() {
    let server = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/v1/sessions", server.base_url))
        .json(&json!({ "session_id": "s1" }))
        .send()
        .await
        .unwrap();

    let result: ExecutionResult = client
        .post(format!("{}/api/v1/sessions/s1/execute", server.base_url))
        .json(&json!({ "exec_id": "e1", "code": "write a.txt hi" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(result.artifacts.len(), 1);
    assert_eq!(result.artifacts[0].file_name, "a.txt");

    let download = client
        .get(format!(
            "{}/api/v1/sessions/s1/artifacts/a.txt",
            server.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(download.text().await.unwrap(), "hi");
}

#[tokio::test]
async fn interpreter_crash_reports_failure_and_stops_the_session() {
    let server = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/api/v1/sessions", server.base_url))
        .json(&json!({ "session_id": "s1" }))
        .send()
        .await
        .unwrap();

    let response = client
        .post(format!("{}/api/v1/sessions/s1/execute", server.base_url))
        .json(&json!({ "exec_id": "e1", "code": "exit" }))
        .send()
        .await
        .unwrap();
    // The service stays healthy; the code failed.
    assert_eq!(response.status(), 200);
    let result: ExecutionResult = response.json().await.unwrap();
    assert!(!result.success);
    assert!(result
        .error_message
        .as_deref()
        .unwrap()
        .contains("peer gone"));

    let details: serde_json::Value = client
        .get(format!("{}/api/v1/sessions/s1", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(details["status"], "stopped");

    let deleted = client
        .delete(format!("{}/api/v1/sessions/s1", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);
}

#[tokio::test]
async fn api_key_is_enforced_except_for_health() {
    let server = spawn_server(|config| {
        config.api_key = Some("secret".to_string());
        config.allow_loopback = false;
    })
    .await;
    let client = reqwest::Client::new();

    let unauthenticated = client
        .get(format!("{}/api/v1/sessions", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthenticated.status(), 401);

    let authenticated = client
        .get(format!("{}/api/v1/sessions", server.base_url))
        .header("X-API-Key", "secret")
        .send()
        .await
        .unwrap();
    assert_eq!(authenticated.status(), 200);

    let health = client
        .get(format!("{}/api/v1/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
}

#[tokio::test]
async fn loopback_peers_may_bypass_the_api_key() {
    let server = spawn_server(|config| {
        config.api_key = Some("secret".to_string());
        config.allow_loopback = true;
    })
    .await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/v1/sessions", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn rate_limit_rejects_excess_requests() {
    let server = spawn_server(|config| {
        config.rate_limit.requests_per_minute = 3;
    })
    .await;
    let client = reqwest::Client::new();

    // The health probe in spawn_server already consumed part of the budget;
    // hammer until the window is exhausted.
    let mut limited = false;
    for _ in 0..6 {
        let response = client
            .get(format!("{}/api/v1/health", server.base_url))
            .send()
            .await
            .unwrap();
        if response.status() == 429 {
            limited = true;
            break;
        }
    }
    assert!(limited, "expected a 429 after exceeding the window");
}

#[tokio::test]
async fn openapi_document_is_served() {
    let server = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();

    let spec: serde_json::Value = client
        .get(format!("{}/openapi.json", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(spec["paths"]["/api/v1/sessions"].is_object());
    assert!(spec["paths"]["/api/v1/sessions/{id}/execute"].is_object());
}
