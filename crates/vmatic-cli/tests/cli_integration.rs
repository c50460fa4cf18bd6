use assert_cmd::Command;
use predicates::prelude::*;

fn write_script(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn help_exits_zero() {
    Command::cargo_bin("vmatic")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("vmatic"));
}

#[test]
fn check_valid_script_prints_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        &dir,
        "ok.vms",
        "# demo\nUSER=root\necho $USER\n<enter>\n<wait 1s>\n",
    );

    Command::cargo_bin("vmatic")
        .unwrap()
        .args(["check", script.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("total lines:     5"))
        .stdout(predicate::str::contains("variable lines:  1"))
        .stdout(predicate::str::contains("ok"));
}

#[test]
fn check_reports_parse_error_with_line() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "bad.vms", "echo fine\n<frobnicate>\n");

    Command::cargo_bin("vmatic")
        .unwrap()
        .args(["check", script.to_str().unwrap()])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("line 2"))
        .stderr(predicate::str::contains("frobnicate"));
}

#[test]
fn check_reads_stdin() {
    Command::cargo_bin("vmatic")
        .unwrap()
        .arg("check")
        .write_stdin("echo hello\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("text lines:      1"));
}

#[test]
fn dry_run_succeeds_without_a_vm() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        &dir,
        "flow.vms",
        "USER=${USER:-admin}\necho $USER\n<enter>\n<if-found \"login:\" 1s>\nroot\n<end>\n",
    );

    Command::cargo_bin("vmatic")
        .unwrap()
        .args(["run", script.to_str().unwrap(), "--dry-run"])
        .assert()
        .success();
}

#[test]
fn run_without_monitor_or_dry_run_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "plain.vms", "echo hi\n");

    Command::cargo_bin("vmatic")
        .unwrap()
        .args(["run", script.to_str().unwrap()])
        // A configured default monitor would defeat the test; force none.
        .env("HOME", dir.path())
        .env_remove("VMATIC_MONITOR")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--connect"));
}

#[test]
fn exit_directive_sets_process_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "exit3.vms", "<exit 3>\necho never\n");

    Command::cargo_bin("vmatic")
        .unwrap()
        .args(["run", script.to_str().unwrap(), "--dry-run"])
        .assert()
        .failure()
        .code(3);
}

#[test]
fn exit_zero_is_success() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "exit0.vms", "<exit 0>\n");

    Command::cargo_bin("vmatic")
        .unwrap()
        .args(["run", script.to_str().unwrap(), "--dry-run"])
        .assert()
        .success();
}

#[test]
fn parse_error_exits_one_before_any_execution() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "bad.vms", "<watch unquoted 5s>\n");

    Command::cargo_bin("vmatic")
        .unwrap()
        .args(["run", script.to_str().unwrap(), "--dry-run"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("parse error"));
}

#[test]
fn bad_var_override_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "plain.vms", "echo hi\n");

    Command::cargo_bin("vmatic")
        .unwrap()
        .args([
            "run",
            script.to_str().unwrap(),
            "--dry-run",
            "--var",
            "MISSING_EQUALS",
        ])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("MISSING_EQUALS"));
}

#[test]
fn bad_timeout_flag_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "plain.vms", "echo hi\n");

    Command::cargo_bin("vmatic")
        .unwrap()
        .args([
            "run",
            script.to_str().unwrap(),
            "--dry-run",
            "--timeout",
            "soonish",
        ])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--timeout"));
}

#[test]
fn debug_flags_are_mutually_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "plain.vms", "echo hi\n");

    Command::cargo_bin("vmatic")
        .unwrap()
        .args([
            "run",
            script.to_str().unwrap(),
            "--dry-run",
            "--debug",
            "--debug-interactive",
        ])
        .assert()
        .failure();
}

#[test]
fn json_flag_emits_result_object() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "vars.vms", "GREETING=hello\necho $GREETING\n");

    let assert = Command::cargo_bin("vmatic")
        .unwrap()
        .args(["run", script.to_str().unwrap(), "--dry-run", "--json"])
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed["success"], serde_json::Value::Bool(true));
    assert_eq!(parsed["exit_code"], serde_json::json!(0));
    assert_eq!(parsed["variables"]["GREETING"], serde_json::json!("hello"));
}

#[test]
fn include_is_resolved_relative_to_the_script() {
    let dir = tempfile::tempdir().unwrap();
    write_script(&dir, "lib.vms", "echo from lib\n");
    let script = write_script(&dir, "main.vms", "<include \"lib.vms\">\necho done\n");

    Command::cargo_bin("vmatic")
        .unwrap()
        .args(["check", script.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("text lines:      2"));
}

#[test]
fn missing_include_fails_check() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "main.vms", "<include \"ghost.vms\">\n");

    Command::cargo_bin("vmatic")
        .unwrap()
        .args(["check", script.to_str().unwrap()])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("ghost.vms"));
}

#[test]
fn undefined_function_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "main.vms", "<call ghost>\n");

    Command::cargo_bin("vmatic")
        .unwrap()
        .args(["check", script.to_str().unwrap()])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn unknown_subcommand_fails() {
    Command::cargo_bin("vmatic")
        .unwrap()
        .arg("frobnicate")
        .assert()
        .failure();
}
