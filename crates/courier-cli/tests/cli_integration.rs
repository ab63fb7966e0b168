//! CLI integration tests
//!
//! Each test runs the courier binary against its own temporary data directory.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn courier(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("courier").expect("Failed to find courier binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

fn init(data_dir: &TempDir) {
    courier(data_dir)
        .args(["init", "me@example.org", "--server", "example.org"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration written"));
}

// ============================================================================
// Help and Version
// ============================================================================

#[test]
fn test_help() {
    let mut cmd = Command::cargo_bin("courier").expect("Failed to find courier binary");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("queue"))
        .stdout(predicate::str::contains("contact"));
}

#[test]
fn test_version() {
    let mut cmd = Command::cargo_bin("courier").expect("Failed to find courier binary");
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_info_without_init() {
    let data_dir = TempDir::new().unwrap();
    courier(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("not configured"));
}

#[test]
fn test_init_then_info() {
    let data_dir = TempDir::new().unwrap();
    init(&data_dir);

    assert!(data_dir.path().join("config.json").exists());
    courier(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Self: me@example.org"))
        .stdout(predicate::str::contains("Server: example.org"))
        .stdout(predicate::str::contains("Threads: 0"));
}

// ============================================================================
// Queue
// ============================================================================

#[test]
fn test_send_then_queue_list() {
    let data_dir = TempDir::new().unwrap();
    init(&data_dir);

    courier(&data_dir)
        .args(["send", "bob@example.org", "hello there"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Queued message 1 to bob@example.org"));

    courier(&data_dir)
        .args(["queue", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("bob@example.org"))
        .stdout(predicate::str::contains("hello there"));

    courier(&data_dir)
        .args(["thread", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("bob@example.org"));
}

#[test]
fn test_queue_list_empty() {
    let data_dir = TempDir::new().unwrap();
    courier(&data_dir)
        .args(["queue", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Queue is empty"));
}

#[test]
fn test_queue_scan_json() {
    let data_dir = TempDir::new().unwrap();
    init(&data_dir);
    courier(&data_dir)
        .args(["send", "bob@example.org", "x"])
        .assert()
        .success();

    courier(&data_dir)
        .args(["--json", "queue", "scan"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"dispatch\""))
        .stdout(predicate::str::contains("\"deleted\""));
}

#[test]
fn test_thread_show_unknown_peer_fails() {
    let data_dir = TempDir::new().unwrap();
    courier(&data_dir)
        .args(["thread", "show", "nobody@example.org"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No thread"));
}

// ============================================================================
// Groups
// ============================================================================

#[test]
fn test_group_create_requires_init() {
    let data_dir = TempDir::new().unwrap();
    courier(&data_dir)
        .args(["group", "create", "trip@example.org", "alice@example.org"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("courier init"));
}

#[test]
fn test_group_create_and_list() {
    let data_dir = TempDir::new().unwrap();
    init(&data_dir);

    courier(&data_dir)
        .args([
            "group",
            "create",
            "trip@example.org",
            "alice@example.org",
            "bob@example.org",
            "--subject",
            "Trip",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created group trip@example.org"));

    courier(&data_dir)
        .args(["group", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Trip"))
        .stdout(predicate::str::contains("members: 2"));
}

// ============================================================================
// Contacts
// ============================================================================

#[test]
fn test_contact_add_and_book() {
    let data_dir = TempDir::new().unwrap();

    courier(&data_dir)
        .args(["contact", "add", "+15550100", "--name", "Alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added +15550100"));

    courier(&data_dir)
        .args(["contact", "book"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Alice"));

    courier(&data_dir)
        .args(["contact", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No synced contacts"));
}
