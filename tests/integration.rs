use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn harvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("harvest");
    path
}

fn setup_test_env(endpoint: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/harvest.sqlite"

[http]
timeout_secs = 5
max_retries = 0
backoff_ms = 10

[logging]
level = "warn"

[targets.doidb]
url = "{}/oai"
metadata_prefix = "igsn"
granularity = "YYYY-MM-DD"
"#,
        root.display(),
        endpoint
    );

    let config_path = config_dir.join("harvest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_harvest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = harvest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harvest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn page(records: &[(&str, &str)], token: Option<&str>) -> String {
    let mut body = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2021-06-01T00:00:00Z</responseDate>
  <request verb="ListRecords">oai</request>
  <ListRecords>"#,
    );
    for (id, datestamp) in records {
        body.push_str(&format!(
            r#"
    <record>
      <header><identifier>{id}</identifier><datestamp>{datestamp}</datestamp><setSpec>IEDA</setSpec></header>
      <metadata><sample xmlns="http://igsn.org/schema"><sampleNumber>{id}</sampleNumber></sample></metadata>
    </record>"#
        ));
    }
    if let Some(token) = token {
        body.push_str(&format!("\n    <resumptionToken>{token}</resumptionToken>"));
    }
    body.push_str("\n  </ListRecords>\n</OAI-PMH>");
    body
}

/// Two pages joined by a resumption token. The token mock is mounted first
/// so it wins over the catch-all first page.
async fn mount_two_pages(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/oai"))
        .and(query_param("resumptionToken", "tok1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(page(&[("10273/C", "2021-01-07")], None)),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/oai"))
        .and(query_param("verb", "ListRecords"))
        .and(query_param("metadataPrefix", "igsn"))
        .respond_with(ResponseTemplate::new(200).set_body_string(page(
            &[("10273/A", "2021-01-05"), ("10273/B", "2021-01-09")],
            Some("tok1"),
        )))
        .mount(server)
        .await;
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (stdout, stderr, success) = run_harvest(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (_, _, success1) = run_harvest(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_harvest(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_targets_lists_configured_endpoint() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    run_harvest(&config_path, &["init"]);

    let (stdout, stderr, success) = run_harvest(&config_path, &["targets"]);
    assert!(success, "targets failed: {}", stderr);
    assert!(stdout.contains("doidb"));
    assert!(stdout.contains("igsn"));
    assert!(stdout.contains("never"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_follows_resumption_token() {
    let server = MockServer::start().await;
    mount_two_pages(&server).await;
    let (_tmp, config_path) = setup_test_env(&server.uri());

    run_harvest(&config_path, &["init"]);
    let (stdout, stderr, success) = run_harvest(&config_path, &["run", "doidb"]);
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("requests: 2"));
    assert!(stdout.contains("inserted: 3"));
    assert!(stdout.contains("checkpoint: 2021-01-09T00:00:00Z"));
    assert!(stdout.contains("state: done"));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let resumed = requests[1].url.query().unwrap_or_default();
    assert!(resumed.contains("resumptionToken=tok1"));
    assert!(!resumed.contains("metadataPrefix"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rerun_is_incremental_and_idempotent() {
    let server = MockServer::start().await;
    mount_two_pages(&server).await;
    let (_tmp, config_path) = setup_test_env(&server.uri());

    run_harvest(&config_path, &["init"]);
    let (_, stderr, success) = run_harvest(&config_path, &["run", "doidb"]);
    assert!(success, "first run failed: {}", stderr);

    let (stdout, stderr, success) = run_harvest(&config_path, &["run", "doidb"]);
    assert!(success, "second run failed: {}", stderr);
    assert!(stdout.contains("inserted: 0"));
    assert!(stdout.contains("existing: 3"));
    assert!(stdout.contains("from: 2021-01-09T00:00:00Z"));

    let requests = server.received_requests().await.unwrap();
    let seeded = requests[2].url.query().unwrap_or_default();
    assert!(seeded.contains("from=2021-01-09"));

    let (stdout, _, _) = run_harvest(&config_path, &["stats"]);
    assert!(stdout.contains("Identifiers: 3"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_prints_stored_identifier() {
    let server = MockServer::start().await;
    mount_two_pages(&server).await;
    let (_tmp, config_path) = setup_test_env(&server.uri());

    run_harvest(&config_path, &["init"]);
    run_harvest(&config_path, &["run", "doidb"]);

    let (stdout, stderr, success) = run_harvest(&config_path, &["get", "10273/B"]);
    assert!(success, "get failed: {}", stderr);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["id"], "10273/B");
    assert_eq!(value["service"], "doidb");
    assert_eq!(value["id_time"], "2021-01-09T00:00:00Z");
    assert_eq!(value["sets"], serde_json::json!(["IEDA"]));
    assert_eq!(value["metadata"]["sample"]["sampleNumber"], "10273/B");
}

#[test]
fn test_get_missing_identifier() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    run_harvest(&config_path, &["init"]);

    let (_, stderr, success) = run_harvest(&config_path, &["get", "nope"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_records_match_is_not_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/oai"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
                 <error code="noRecordsMatch">nothing in range</error>
               </OAI-PMH>"#,
        ))
        .mount(&server)
        .await;
    let (_tmp, config_path) = setup_test_env(&server.uri());

    run_harvest(&config_path, &["init"]);
    let (stdout, stderr, success) = run_harvest(&config_path, &["run", "doidb"]);
    assert!(success, "run failed: {}", stderr);
    assert!(stdout.contains("no new records"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_protocol_error_fails_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/oai"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<OAI-PMH><error code="cannotDisseminateFormat">igsn unsupported</error></OAI-PMH>"#,
        ))
        .mount(&server)
        .await;
    let (_tmp, config_path) = setup_test_env(&server.uri());

    run_harvest(&config_path, &["init"]);
    let (stdout, _, success) = run_harvest(&config_path, &["run", "doidb"]);
    assert!(!success);
    assert!(stdout.contains("cannotDisseminateFormat"));
}

#[test]
fn test_unknown_target() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    run_harvest(&config_path, &["init"]);

    let (_, stderr, success) = run_harvest(&config_path, &["run", "nope"]);
    assert!(!success);
    assert!(stderr.contains("Unknown target"));
}

#[test]
fn test_invalid_from_date() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    run_harvest(&config_path, &["init"]);

    let (_, stderr, success) = run_harvest(&config_path, &["run", "doidb", "--from", "last week"]);
    assert!(!success);
    assert!(stderr.contains("invalid date"));
}
