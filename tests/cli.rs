use assert_cmd::Command;
use predicates::prelude::*;

fn flowshard(dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("flowshard").unwrap();
    cmd.current_dir(dir.path()).env_remove("RUST_LOG");
    cmd
}

#[test]
fn conflicting_shard_flags_fail_before_config_is_read() {
    let dir = tempfile::tempdir().unwrap();

    flowshard(&dir)
        .args(["test", "--shard-split", "2", "--shard-all", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("mutually exclusive"))
        .stderr(predicate::str::contains("Failed to load config").not());
}

#[test]
fn zero_shards_rejected() {
    let dir = tempfile::tempdir().unwrap();

    flowshard(&dir)
        .args(["test", "--shard-split", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Number of shards must be at least 1"));
}

#[test]
fn init_writes_valid_config_once() {
    let dir = tempfile::tempdir().unwrap();

    flowshard(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created flowshard.toml"));
    assert!(dir.path().join("flowshard.toml").exists());

    flowshard(&dir)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Port range: 7001-7128"));

    flowshard(&dir)
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn validate_rejects_inverted_port_range() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("flowshard.toml"),
        r#"
[flowshard]
port_range_start = 8000
port_range_end = 7000

[session]
run_command = "true"
"#,
    )
    .unwrap();

    flowshard(&dir)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid port range"));
}

#[test]
fn validate_rejects_missing_run_command() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("custom.toml"), "[report]\njunit = false\n").unwrap();

    flowshard(&dir)
        .args(["-c", "custom.toml", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("run_command must be set"));
}

#[test]
fn cloud_status_requires_api_key() {
    let dir = tempfile::tempdir().unwrap();

    flowshard(&dir)
        .env_remove("FLOWSHARD_API_KEY")
        .args(["cloud-status", "--upload-id", "up-1", "--project-id", "proj-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--api-key"));
}

#[test]
fn cloud_status_rejects_zero_poll_interval() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("flowshard.toml"), "[cloud]\nmin_poll_interval_ms = 0\n").unwrap();

    flowshard(&dir)
        .env("FLOWSHARD_API_KEY", "key")
        .args(["cloud-status", "--upload-id", "up-1", "--project-id", "proj-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cloud.min_poll_interval_ms must be greater than zero"));
}
