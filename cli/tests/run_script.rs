use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::process::Command;

fn runner_bin() -> &'static str {
    env!("CARGO_BIN_EXE_runner")
}

fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
fn successful_script_exits_zero_and_writes_history() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "ok.py", "#!/usr/bin/env python3\nprint('hi')\n");
    let history_db = dir.path().join("history.db");

    let output = Command::new(runner_bin())
        .arg(script.to_str().unwrap())
        .env("ALLOWED_SCRIPT_ROOT", dir.path())
        .env("HISTORY_DB_PATH", &history_db)
        .output()
        .expect("failed to run the runner binary");

    assert!(
        output.status.success() || output.status.code() == Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(history_db.exists());
}

#[test]
fn failing_script_propagates_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "bad.py",
        "#!/usr/bin/env python3\nimport sys\nsys.exit(7)\n",
    );
    let history_db = dir.path().join("history.db");

    let output = Command::new(runner_bin())
        .arg(script.to_str().unwrap())
        .arg("--max-attempts")
        .arg("1")
        .env("ALLOWED_SCRIPT_ROOT", dir.path())
        .env("HISTORY_DB_PATH", &history_db)
        .output()
        .expect("failed to run the runner binary");

    assert_eq!(output.status.code(), Some(7));
}

#[test]
fn json_output_report_is_written() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "ok.py", "#!/usr/bin/env python3\nprint('hi')\n");
    let history_db = dir.path().join("history.db");
    let json_out = dir.path().join("report.json");

    Command::new(runner_bin())
        .arg(script.to_str().unwrap())
        .arg("--json-output")
        .arg(&json_out)
        .env("ALLOWED_SCRIPT_ROOT", dir.path())
        .env("HISTORY_DB_PATH", &history_db)
        .output()
        .expect("failed to run the runner binary");

    let contents = std::fs::read_to_string(&json_out).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
    assert_eq!(parsed["success"], true);
}

#[test]
fn gate_failure_exits_non_zero_when_requested() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "slow.py", "#!/usr/bin/env python3\nimport time\ntime.sleep(0.05)\n");
    let history_db = dir.path().join("history.db");

    let output = Command::new(runner_bin())
        .arg(script.to_str().unwrap())
        .arg("--add-gate")
        .arg("execution_time_seconds:0.0001")
        .arg("--fail-on-gate-failure")
        .env("ALLOWED_SCRIPT_ROOT", dir.path())
        .env("HISTORY_DB_PATH", &history_db)
        .output()
        .expect("failed to run the runner binary");

    assert_eq!(output.status.code(), Some(2));
}
