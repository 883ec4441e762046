//! End-to-end tests of the `insteon` binary.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn insteon() -> Command {
    let mut cmd = Command::cargo_bin("insteon").unwrap();
    cmd.env_remove("RUST_LOG").env_remove("INSTEON_LOG_JSON");
    cmd
}

#[test]
fn test_validate_builtin_catalog() {
    insteon()
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("F00.00.11 2477S"))
        .stdout(predicate::str::contains("F00.00.02 2487S (7 features, 1 groups)"))
        .stdout(predicate::str::contains("OK"));
}

#[test]
fn test_validate_reports_bad_definitions() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "feature_templates": [
                {{ "name": "Relay", "default_message_handler": {{ "type": "NoOpMsgHandler" }} }},
                {{ "name": "Slow", "timeout": "eventually" }}
            ],
            "device_types": [
                {{ "product_key": "X.1", "features": [ {{ "name": "relay", "template": "Relay" }} ] }},
                {{ "product_key": "X.2", "features": [ {{ "name": "relay", "template": "Nope" }} ] }}
            ]
        }}"#
    )
    .unwrap();

    insteon()
        .args(["validate", "--no-builtin"])
        .arg(file.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("1 templates, 1 device types"))
        .stdout(predicate::str::contains("Invalid timeout 'eventually'"))
        .stdout(predicate::str::contains("Unknown feature template 'Nope'"))
        .stderr(predicate::str::contains("2 problem(s) found"));
}

#[test]
fn test_validate_missing_file() {
    insteon()
        .args(["validate", "/definitely/not/here.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load"));
}

#[test]
fn test_inspect_ack() {
    insteon()
        .args(["inspect", "02 50 11 22 33 44 55 66 2F 11 FF"])
        .assert()
        .success()
        .stdout(predicate::str::contains("From:      11.22.33"))
        .stdout(predicate::str::contains("Class:     ACK_OF_DIRECT"))
        .stdout(predicate::str::contains("Cmd2:      0xFF"));
}

#[test]
fn test_inspect_nack_reason() {
    insteon()
        .args(["inspect", "0250112233445566AF11FD"])
        .assert()
        .success()
        .stdout(predicate::str::contains("NACK_OF_DIRECT"))
        .stdout(predicate::str::contains("checksum mismatch"));
}

#[test]
fn test_inspect_json() {
    insteon()
        .args(["inspect", "--json", "02:50:11:22:33:00:00:01:CF:11:00"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""class": "all_link_broadcast""#))
        .stdout(predicate::str::contains(r#""group": 1"#));
}

#[test]
fn test_inspect_rejects_garbage() {
    insteon().args(["inspect", "zz"]).assert().failure();
    insteon()
        .args(["inspect", "0262112233"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to decode frame"));
}

#[test]
fn test_simulate_switch_on() {
    insteon()
        .args(["simulate", "--command", "ON", "--reply", "--wait-ms", "300"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Device 11.22.33 (F00.00.11, 2 features)"))
        .stdout(predicate::str::contains("cmd1=0x11 cmd2=0xFF"))
        .stdout(predicate::str::contains("State switch = ON"));
}

#[test]
fn test_simulate_unknown_product() {
    insteon()
        .args(["simulate", "--product-key", "F00.99.99"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown product key"));
}
