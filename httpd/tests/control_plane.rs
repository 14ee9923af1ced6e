use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use core_engine::config::RunnerConfig;
use core_engine::history::HistoryStore;
use core_engine::path_policy::PathPolicy;
use core_engine::registry::RunRegistry;
use reqwest::StatusCode;

fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn spawn_server(dir: &std::path::Path) -> (String, reqwest::Client) {
    let registry = RunRegistry::open_in_memory().unwrap();
    let history = HistoryStore::open_in_memory().unwrap();
    let policy = PathPolicy::relaxed(dir);
    let state = runnerd::state::AppState::new(
        registry,
        history,
        policy,
        RunnerConfig::default(),
        dir.join("uploads"),
    );
    let app = runnerd::api::create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://{addr}"), reqwest::Client::new())
}

#[tokio::test]
async fn health_endpoint_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let (base, client) = spawn_server(dir.path()).await;
    let resp = client.get(format!("{base}/api/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn submitting_a_run_queues_and_eventually_completes() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "ok.sh", "#!/bin/sh\nexit 0\n");
    let (base, client) = spawn_server(dir.path()).await;

    let resp = client
        .post(format!("{base}/api/run"))
        .json(&serde_json::json!({ "script_path": script.to_str().unwrap() }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = resp.json().await.unwrap();
    let run_id = body["run_id"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let resp = client
        .get(format!("{base}/api/runs/{run_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let record: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(record["status"], "completed");
}

#[tokio::test]
async fn invalid_script_path_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (base, client) = spawn_server(dir.path()).await;

    let resp = client
        .post(format!("{base}/api/run"))
        .json(&serde_json::json!({ "script_path": "/nonexistent/script.sh" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancelling_an_already_finished_run_returns_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "ok.sh", "#!/bin/sh\nexit 0\n");
    let (base, client) = spawn_server(dir.path()).await;

    let resp = client
        .post(format!("{base}/api/run"))
        .json(&serde_json::json!({ "script_path": script.to_str().unwrap() }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    let run_id = body["run_id"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let resp = client
        .post(format!("{base}/api/runs/{run_id}/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn stats_endpoint_reports_counts() {
    let dir = tempfile::tempdir().unwrap();
    let (base, client) = spawn_server(dir.path()).await;
    let resp = client.get(format!("{base}/api/stats")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let stats: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(stats["total_runs"], 0);
}
