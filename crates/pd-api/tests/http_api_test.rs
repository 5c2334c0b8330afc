//! End-to-end tests over a real TCP listener: JSON surfaces, error
//! envelopes, and the coordination scenarios clients depend on.

use std::future::IntoFuture;
use std::sync::Arc;

use pd_api::{api_router, ApiState, NoopCleanup, ReaperStats};
use pd_bus::EventBus;
use pd_core::clock::SystemClock;
use pd_core::config::Config;
use pd_core::store::Store;
use pd_probe::StaticProbe;

async fn spawn_api() -> (String, Arc<StaticProbe>, Arc<ApiState>) {
    let store = Store::open_in_memory().await.unwrap();
    let probe = StaticProbe::new();
    let mut config = Config::default();
    config.ports.range_start = 3100;
    config.ports.range_end = 3200;
    let state = ApiState::build(
        config,
        store,
        Arc::new(SystemClock),
        probe.clone(),
        EventBus::new(),
        Arc::new(NoopCleanup),
        Arc::new(ReaperStats::default()),
        "testhash".into(),
    );
    let router = api_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, router).into_future());
    (format!("http://{addr}"), probe, state)
}

#[tokio::test]
async fn port_assignment_happy_path() {
    let (base, probe, _state) = spawn_api().await;
    probe.set_alive(4242, true);
    let client = reqwest::Client::new();

    let first: serde_json::Value = client
        .post(format!("{base}/claim"))
        .header("X-PID", "4242")
        .json(&serde_json::json!({"id": "myapp:api:main", "range": [3100, 3200]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["port"], 3100);
    assert_eq!(first["existing"], false);

    let second: serde_json::Value = client
        .post(format!("{base}/claim"))
        .header("X-PID", "4242")
        .json(&serde_json::json!({"id": "myapp:api:main", "range": [3100, 3200]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["port"], 3100);
    assert_eq!(second["existing"], true);

    let released: serde_json::Value = client
        .delete(format!("{base}/release"))
        .json(&serde_json::json!({"id": "myapp:api:main"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(released["released"], 1);
    assert_eq!(released["releasedPorts"], serde_json::json!([3100]));
}

#[tokio::test]
async fn concurrent_claims_of_same_identity_share_one_port() {
    let (base, probe, _state) = spawn_api().await;
    probe.set_alive(7, true);
    let client = reqwest::Client::new();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let client = client.clone();
        let base = base.clone();
        handles.push(tokio::spawn(async move {
            client
                .post(format!("{base}/claim"))
                .header("X-PID", "7")
                .json(&serde_json::json!({"id": "shared:svc"}))
                .send()
                .await
                .unwrap()
                .json::<serde_json::Value>()
                .await
                .unwrap()
        }));
    }
    let mut ports = std::collections::HashSet::new();
    for handle in handles {
        let body = handle.await.unwrap();
        assert!(body["port"].is_u64(), "claim failed: {body}");
        ports.insert(body["port"].as_u64().unwrap());
    }
    assert_eq!(ports.len(), 1, "all claimers observed the same port");
}

#[tokio::test]
async fn lock_conflict_envelope_and_recovery() {
    let (base, _probe, _state) = spawn_api().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/locks/build"))
        .json(&serde_json::json!({"owner": "agent-1", "ttl": 60000}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .post(format!("{base}/locks/build"))
        .json(&serde_json::json!({"owner": "agent-2", "ttl": 60000}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "lock held");
    assert_eq!(body["owner"], "agent-1");
    assert!(body["expiresAt"].is_i64() || body["expiresAt"].is_u64());

    let response = client
        .delete(format!("{base}/locks/build"))
        .json(&serde_json::json!({"owner": "agent-1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .post(format!("{base}/locks/build"))
        .json(&serde_json::json!({"owner": "agent-2", "ttl": 60000}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn long_poll_wakes_on_publish() {
    let (base, _probe, _state) = spawn_api().await;
    let client = reqwest::Client::new();

    let poll_client = client.clone();
    let poll_base = base.clone();
    let poller = tokio::spawn(async move {
        poll_client
            .get(format!("{poll_base}/msg/jobs/poll?after=0&timeout=10000"))
            .send()
            .await
            .unwrap()
            .json::<serde_json::Value>()
            .await
            .unwrap()
    });

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let response = client
        .post(format!("{base}/msg/jobs"))
        .json(&serde_json::json!({"payload": {"n": 1}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body = tokio::time::timeout(std::time::Duration::from_secs(5), poller)
        .await
        .expect("poll should wake")
        .unwrap();
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["payload"]["n"], 1);
}

#[tokio::test]
async fn publish_then_cursor_reads_see_each_message_once() {
    let (base, _probe, _state) = spawn_api().await;
    let client = reqwest::Client::new();

    for i in 0..3 {
        client
            .post(format!("{base}/msg/ch"))
            .json(&serde_json::json!({"payload": {"i": i}}))
            .send()
            .await
            .unwrap();
    }
    let body: serde_json::Value = client
        .get(format!("{base}/msg/ch?after=0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    let last_id = messages.last().unwrap()["id"].as_i64().unwrap();

    let body: serde_json::Value = client
        .get(format!("{base}/msg/ch?after={last_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn webhook_ssrf_target_is_rejected() {
    let (base, _probe, _state) = spawn_api().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/webhooks"))
        .json(&serde_json::json!({"url": "http://10.0.0.5/hook"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("blocked"));
}

#[tokio::test]
async fn missing_resources_use_the_error_envelope() {
    let (base, _probe, _state) = spawn_api().await;
    let client = reqwest::Client::new();

    for path in [
        "/services/ghost:svc",
        "/agents/ghost",
        "/sessions/nope",
        "/webhooks/nope",
    ] {
        let response = client.get(format!("{base}{path}")).send().await.unwrap();
        assert_eq!(response.status(), 404, "{path}");
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["error"].is_string(), "{path}");
    }
}

#[tokio::test]
async fn oversized_bodies_are_413() {
    let (base, _probe, _state) = spawn_api().await;
    let client = reqwest::Client::new();

    let huge = "x".repeat(20 * 1024);
    let response = client
        .post(format!("{base}/claim"))
        .json(&serde_json::json!({"id": "a", "metadata": {"blob": huge}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);
}

#[tokio::test]
async fn health_version_and_metrics_respond() {
    let (base, _probe, _state) = spawn_api().await;
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let version: serde_json::Value = client
        .get(format!("{base}/version"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(version["codeHash"], "testhash");

    let metrics: serde_json::Value = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(metrics["tables"]["services"].is_i64() || metrics["tables"]["services"].is_u64());
}

#[tokio::test]
async fn session_flow_with_file_conflicts() {
    let (base, _probe, _state) = spawn_api().await;
    let client = reqwest::Client::new();

    let first: serde_json::Value = client
        .post(format!("{base}/sessions"))
        .json(&serde_json::json!({
            "purpose": "refactor auth",
            "agentId": "a1",
            "files": ["src/auth.rs"]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = first["session"]["id"].as_str().unwrap().to_string();

    // Overlapping claim from another agent conflicts.
    let response = client
        .post(format!("{base}/sessions"))
        .json(&serde_json::json!({
            "purpose": "also auth",
            "agentId": "a2",
            "files": ["src/auth.rs"]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["conflicts"][0]["filePath"], "src/auth.rs");

    // Completing the first session releases the claim.
    let response = client
        .put(format!("{base}/sessions/{session_id}"))
        .json(&serde_json::json!({"status": "completed"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .post(format!("{base}/sessions"))
        .json(&serde_json::json!({
            "purpose": "also auth",
            "agentId": "a2",
            "files": ["src/auth.rs"]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn quota_exceeded_is_429() {
    let (base, probe, _state) = spawn_api().await;
    probe.set_alive(9, true);
    let client = reqwest::Client::new();

    client
        .post(format!("{base}/agents"))
        .json(&serde_json::json!({"id": "a1", "maxServices": 1}))
        .send()
        .await
        .unwrap();

    let response = client
        .post(format!("{base}/claim"))
        .header("X-PID", "9")
        .header("X-Agent-Id", "a1")
        .json(&serde_json::json!({"id": "svc:one"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .post(format!("{base}/claim"))
        .header("X-PID", "9")
        .header("X-Agent-Id", "a1")
        .json(&serde_json::json!({"id": "svc:two"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
}
