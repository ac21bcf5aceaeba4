//! CLI smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn totem() -> Command {
    Command::cargo_bin("totem").expect("binary")
}

#[test]
fn help_lists_subcommands() {
    totem()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("send"))
        .stdout(predicate::str::contains("log"));
}

#[test]
fn no_args_is_an_error() {
    totem().assert().failure();
}

#[test]
fn log_on_empty_store_prints_nothing() {
    let dir = TempDir::new().expect("tempdir");
    totem()
        .args(["log", "--node-id", "9", "--log-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn log_prints_persisted_records_in_order() {
    let dir = TempDir::new().expect("tempdir");
    let log_path = dir.path().join("node_4_messages.jsonl");
    std::fs::write(
        &log_path,
        concat!(
            "{\"seq_no\":1,\"term\":1,\"sender_id\":4,\"msg_id\":\"6a46d1f0-2b0e-4b8a-9a54-000000000001\",\"room_id\":\"general\",\"text\":\"first\",\"ts\":1}\n",
            "{\"seq_no\":2,\"term\":1,\"sender_id\":5,\"msg_id\":\"6a46d1f0-2b0e-4b8a-9a54-000000000002\",\"room_id\":\"general\",\"text\":\"second\",\"ts\":2}\n",
        ),
    )
    .expect("seed log");

    totem()
        .args(["log", "--node-id", "4", "--log-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("[seq=1] node_4: first"))
        .stdout(predicate::str::contains("[seq=2] node_5: second"));
}

#[test]
fn missing_config_file_is_a_startup_error() {
    totem()
        .args(["run", "--config", "/definitely/not/here.toml"])
        .assert()
        .failure();
}

#[test]
fn send_to_unreachable_node_fails() {
    totem()
        .args(["send", "--to", "127.0.0.1:1", "hello"])
        .assert()
        .failure();
}
