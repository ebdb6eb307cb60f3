//! End-to-end tests for the ferry binary

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::path::PathBuf;
use tempfile::TempDir;
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn write_json(dir: &TempDir, name: &str, value: &Value) -> PathBuf {
    let file = dir.path().join(name);
    std::fs::write(&file, serde_json::to_vec(value).unwrap()).unwrap();
    file
}

fn ferry() -> Command {
    let mut cmd = Command::cargo_bin("ferry").unwrap();
    cmd.env("LOG_OUTPUT", "console").env("LOG_LEVEL", "info");
    cmd
}

fn reindex_step(name: &str, worker: &str, asynchronous: bool) -> Value {
    json!({
        "name": name,
        "worker": worker,
        "asynchronous": asynchronous,
        "copy_index": { "from_index": format!("{name}-v1"), "to_index": format!("{name}-v2") }
    })
}

#[tokio::test]
async fn test_migrate_runs_every_step() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    for name in ["profiles", "events"] {
        Mock::given(method("POST"))
            .and(path("/_reindex"))
            .and(body_partial_json(json!({ "source": { "index": format!("{name}-v1") } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "total": 1, "created": 1 })))
            .expect(1)
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let plan = write_json(
        &dir,
        "plan.json",
        &json!([reindex_step("profiles", "reindex", true), reindex_step("events", "reindex", false)]),
    );

    ferry()
        .arg("migrate")
        .arg("--plan")
        .arg(&plan)
        .arg("--elastic-host")
        .arg(server.uri())
        .assert()
        .success();
}

#[tokio::test]
async fn test_migrate_fails_when_a_step_fails() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_reindex"))
        .respond_with(ResponseTemplate::new(404).set_body_string("index_not_found_exception"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let plan = write_json(&dir, "plan.json", &json!([reindex_step("profiles", "reindex", false)]));

    ferry()
        .arg("migrate")
        .arg("--plan")
        .arg(&plan)
        .arg("--elastic-host")
        .arg(server.uri())
        .assert()
        .failure()
        .stderr(predicate::str::contains("1 of 1 migration steps failed"));
}

#[tokio::test]
async fn test_step_with_unknown_worker_is_skipped() {
    let dir = TempDir::new().unwrap();
    let schema = write_json(&dir, "step.json", &reindex_step("profiles", "drop_everything", false));

    ferry()
        .arg("step")
        .arg("--worker")
        .arg("drop_everything")
        .arg("--schema")
        .arg(&schema)
        .arg("--elastic-host")
        .arg("http://127.0.0.1:9")
        .assert()
        .success();
}

#[test]
fn test_malformed_plan_is_rejected() {
    let dir = TempDir::new().unwrap();
    let plan = write_json(&dir, "plan.json", &json!({ "not": "a list" }));

    ferry()
        .arg("migrate")
        .arg("--plan")
        .arg(&plan)
        .arg("--elastic-host")
        .arg("http://127.0.0.1:9")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Migration plan must be a JSON array"));
}

#[test]
fn test_missing_config_file_is_reported() {
    ferry()
        .arg("import-search")
        .arg("--config")
        .arg("/nonexistent/config.json")
        .arg("--credentials")
        .arg("/nonexistent/credentials.json")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}
