//! CLI test cases.
//!
//! These run the real binary against in-memory storage. Nothing here needs a
//! Computer Vision resource: the vision endpoint points at a closed local
//! port, so any test that gets as far as OCR fails loudly instead of
//! talking to a real service.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

/// A local port where nothing should be listening.
static UNREACHABLE_VISION_ENDPOINT: &str = "http://127.0.0.1:9/";

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("blob-text-extractor").unwrap()
}

/// Create a `process` command with a complete, offline configuration.
fn process_cmd() -> Command {
    let mut cmd = cmd();
    cmd.env("AzureWebJobsStorage", "memory://")
        .env("EXTRACTEDTEXT_CONTAINER_NAME", "extracted")
        .env("VISION_ENDPOINT", UNREACHABLE_VISION_ENDPOINT)
        .env("VISION_KEY", "test-key")
        .env_remove("OPENAI_ENDPOINT")
        .env_remove("OPENAI_KEY")
        .args(["process", "--ocr-request-timeout", "2", "--poll-initial-delay-ms", "0"]);
    cmd
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_schema() {
    for schema_type in ["TriggerEvent", "ExtractionReport"] {
        cmd()
            .args(["schema", schema_type])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"$schema\""));
    }
}

#[test]
fn test_schema_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.schema.json");
    cmd()
        .args(["schema", "ExtractionReport", "--out"])
        .arg(&path)
        .assert()
        .success();
    let schema = fs::read_to_string(&path).unwrap();
    assert!(schema.contains("translation"));
}

#[test]
fn test_process_without_url_fails_before_ocr() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("event.json");
    fs::write(&path, r#"{"eventType": "Microsoft.Storage.BlobCreated", "data": {}}"#).unwrap();
    process_cmd()
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("`url`"));
}

#[test]
fn test_process_bad_url_from_stdin() {
    process_cmd()
        .write_stdin(r#"{"url": "not a url"}"#)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid blob URL"));
}

#[test]
fn test_process_reports_unreachable_ocr_service() {
    process_cmd()
        .args(["--blob-url", "https://acct.blob.core.windows.net/images/photo.jpg"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to submit OCR job"));
}

#[test]
fn test_process_skips_unsupported_formats() {
    process_cmd()
        .args([
            "--supported-formats-only",
            "--blob-url",
            "https://acct.blob.core.windows.net/images/notes.txt",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"skipped\": true"));
}

#[test]
fn test_process_requires_configuration() {
    cmd()
        .env_remove("AzureWebJobsStorage")
        .env_remove("VISION_ENDPOINT")
        .env_remove("VISION_KEY")
        .env_remove("EXTRACTEDTEXT_CONTAINER_NAME")
        .args(["process", "--blob-url", "https://a/c/photo.jpg"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--vision-endpoint"));
}
