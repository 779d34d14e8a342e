//! JSON logging keeps stdout clean and writes one JSON object per stderr line

use assert_cmd::Command;
use serde_json::Value;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_json_logging_output_schema() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("notes.txt"), "hello").unwrap();

    let output = Command::cargo_bin("shellstudy")
        .unwrap()
        .env_remove("SHELLSTUDY_LOG")
        .env_remove("SHELLSTUDY_LOG_SPAN_EVENTS")
        .env_remove("RUST_LOG")
        .args(["--log-format", "json", "--log-level", "debug", "snapshot"])
        .arg(tmp.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let tree: Value = serde_json::from_slice(&output.stdout).expect("stdout must be pure JSON");
    assert_eq!(tree["children"][0]["name"], "notes.txt");

    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut lines = 0;
    for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
        let json: Value = serde_json::from_str(line)
            .unwrap_or_else(|e| panic!("Failed to parse JSON line: {}\nError: {}", line, e));
        assert!(json["timestamp"].is_string());
        assert!(json["level"].is_string());
        assert!(json["target"].is_string());
        assert!(json["fields"]["message"].is_string());
        lines += 1;
    }
    assert!(lines > 0, "debug logging should produce at least one line");
}
