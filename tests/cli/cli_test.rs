//! Runs the `tollgate` binary against a throwaway data directory.

use std::path::Path;

use assert_cmd::Command;
use serde_json::Value;

fn tollgate(data_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("tollgate").expect("binary should build");
    cmd.current_dir(data_dir)
        .env("TOLLGATE_DATA_DIR", data_dir)
        .env("TOLLGATE_CONFIG_PATH", data_dir.join("absent.toml"))
        .env("TOLLGATE_LOG_LEVEL", "warn")
        .env_remove("TOLLGATE_DATABASE")
        .env_remove("RUST_LOG");
    cmd
}

fn stdout_json(output: &std::process::Output) -> Value {
    let text = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&text).unwrap_or_else(|e| panic!("stdout is not JSON ({e}): {text}"))
}

#[test]
fn tools_lists_the_catalogue() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let output = tollgate(tmp.path())
        .arg("tools")
        .output()
        .expect("run");
    assert!(output.status.success());

    let tools = stdout_json(&output);
    let names: Vec<&str> = tools
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert_eq!(names.len(), 19);
    assert!(names.contains(&"read_file"));
    assert!(names.contains(&"run_python"));
    // No database is needed just to list tools.
    assert!(!tmp.path().join("tollgate.db").exists());
}

#[test]
fn invoke_then_verify() {
    let tmp = tempfile::tempdir().expect("tempdir");

    let allowed = tollgate(tmp.path())
        .args(["invoke", "--session", "s1", "--tool", "read_file"])
        .args(["--args", r#"{"path": "notes.txt"}"#])
        .output()
        .expect("run");
    assert!(allowed.status.success());
    let allowed = stdout_json(&allowed);
    assert_eq!(allowed["session_id"], "s1");
    assert_eq!(allowed["dispatch"], "execute");
    assert_eq!(allowed["decision"]["outcome"], "allow");
    assert_eq!(allowed["ticket"]["ledger_idx"], 0);

    let denied = tollgate(tmp.path())
        .args(["invoke", "--session", "s1", "--tool", "write_file"])
        .args(["--args", r#"{"path": "x", "content": "y"}"#])
        .output()
        .expect("run");
    assert!(denied.status.success());
    let denied = stdout_json(&denied);
    assert_eq!(denied["dispatch"], "denied");
    assert_eq!(denied["decision"]["reason"], "not_granted");
    assert_eq!(denied["ledger_idx"], 1);

    let verify = tollgate(tmp.path())
        .args(["ledger", "verify", "--session", "s1"])
        .output()
        .expect("run");
    assert!(verify.status.success());
    let report = stdout_json(&verify);
    assert_eq!(report["ok"], true);
    assert_eq!(report["entries"], 2);

    let shown = tollgate(tmp.path())
        .args(["ledger", "show", "--session", "s1", "--from", "1"])
        .output()
        .expect("run");
    assert!(shown.status.success());
    let entries = stdout_json(&shown);
    assert_eq!(entries.as_array().map(Vec::len), Some(1));
    assert_eq!(entries[0]["decision"], "deny");

    assert!(tmp.path().join("tollgate.db").exists());
}

#[test]
fn replay_mode_is_persisted_between_runs() {
    let tmp = tempfile::tempdir().expect("tempdir");

    let set = tollgate(tmp.path())
        .args(["replay", "mode", "--session", "s1", "record"])
        .output()
        .expect("run");
    assert!(set.status.success());
    assert_eq!(stdout_json(&set)["mode"], "record");

    let recorded = tollgate(tmp.path())
        .args(["invoke", "--session", "s1", "--tool", "think"])
        .args(["--args", r#"{"thought": "hmm"}"#])
        .args(["--outcome", r#"{"ok": true, "summary": "thought"}"#])
        .output()
        .expect("run");
    assert!(recorded.status.success());
    assert_eq!(stdout_json(&recorded)["completed"], true);

    let data = tollgate(tmp.path())
        .args(["replay", "data", "--session", "s1"])
        .output()
        .expect("run");
    assert!(data.status.success());
    let data = stdout_json(&data);
    assert_eq!(data["record_count"], 1);
    assert_eq!(data["records"][0]["summary"], "thought");

    let get = tollgate(tmp.path())
        .args(["replay", "mode", "--session", "s1"])
        .output()
        .expect("run");
    assert_eq!(stdout_json(&get)["mode"], "record");
}

#[test]
fn bad_replay_mode_fails() {
    let tmp = tempfile::tempdir().expect("tempdir");
    tollgate(tmp.path())
        .args(["replay", "mode", "--session", "s1", "rewind"])
        .assert()
        .failure();
}

#[test]
fn invalid_args_json_fails() {
    let tmp = tempfile::tempdir().expect("tempdir");
    tollgate(tmp.path())
        .args(["invoke", "--tool", "think", "--args", "{not json"])
        .assert()
        .failure();
}

#[test]
fn budget_is_not_a_cli_command() {
    // Counters are process-local, a one-shot CLI could only show zeros.
    let tmp = tempfile::tempdir().expect("tempdir");
    tollgate(tmp.path())
        .args(["budget", "--session", "s1"])
        .assert()
        .failure();
}
