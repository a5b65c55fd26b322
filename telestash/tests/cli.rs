use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

// Nothing listens on the discard port, so deliveries fail fast and retryably
const CONFIG: &str = r#"
[server]
url = "http://127.0.0.1:9"
app_key = "cli-test"
timeout_secs = 2
"#;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_runtime = base.join("xdg-runtime");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state, &xdg_runtime] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_runtime,
        }
    }

    fn configured() -> Self {
        let env = Self::new();
        let dir = env.xdg_config.join("telestash");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), CONFIG).expect("failed to write config");
        env
    }

    fn store_path(&self) -> PathBuf {
        self.xdg_data.join("telestash/store.db")
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("telestash"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_RUNTIME_DIR", &env.xdg_runtime)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute telestash: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "telestash {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

/// Run a command that must succeed and return its stdout
fn run_ok(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run_bin(env, args);
    assert_success(args, &output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn status_without_config_reports_not_ready() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, &["status"]);

    assert!(stdout.contains("Server URL:      <not set>"), "{stdout}");
    assert!(stdout.contains("Queued:          0 / 1000"), "{stdout}");
    assert!(stdout.contains("Status: Not ready"), "{stdout}");
}

#[test]
fn record_without_config_fails() {
    let env = CliTestEnv::new();
    let output = run_bin(&env, &["record", "opened"]);
    assert!(!output.status.success());
}

#[test]
fn recorded_events_survive_until_drained() {
    let env = CliTestEnv::configured();

    let stdout = run_ok(&env, &["record", "opened", "--seg", "level=3"]);
    assert!(stdout.contains("Recorded 'opened' (1 buffered, 0 queued)"), "{stdout}");
    assert!(env.store_path().exists());

    // A second process sees the buffered event
    let stdout = run_ok(&env, &["status"]);
    assert!(stdout.contains("Buffered:        1"), "{stdout}");
    assert!(stdout.contains("Status: Ready to deliver"), "{stdout}");

    let stdout = run_ok(&env, &["flush"]);
    assert!(stdout.contains("Flushed events into 1 request"), "{stdout}");
    let stdout = run_ok(&env, &["flush"]);
    assert!(stdout.contains("No buffered events"), "{stdout}");

    let stdout = run_ok(&env, &["requests"]);
    assert!(stdout.contains("app_key=cli-test"), "{stdout}");
    assert!(stdout.contains("events="), "{stdout}");

    // Connection refused is retryable: the request stays at the head
    let stdout = run_ok(&env, &["drain"]);
    assert!(stdout.contains("Delivered:       0"), "{stdout}");
    assert!(stdout.contains("Remaining:       1"), "{stdout}");
    assert!(stdout.contains("delivery failed"), "{stdout}");

    let stdout = run_ok(&env, &["status"]);
    assert!(stdout.contains("Queued:          1 / 1000"), "{stdout}");
}

#[test]
fn merge_queues_flushed_events_then_merge_request() {
    let env = CliTestEnv::configured();
    run_ok(&env, &["record", "before"]);

    let stdout = run_ok(&env, &["change-id", "user-1", "--merge"]);
    assert!(stdout.contains("merge request queued"), "{stdout}");
    assert!(stdout.contains("Device ID:       user-1"), "{stdout}");

    let stdout = run_ok(&env, &["requests"]);
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines.len(), 2, "{stdout}");
    assert!(lines[0].contains("events="), "{stdout}");
    assert!(lines[1].contains("old_device_id="), "{stdout}");
    assert!(lines[1].contains("device_id=user-1"), "{stdout}");
}

#[test]
fn temporary_mode_blocks_delivery() {
    let env = CliTestEnv::configured();

    let stdout = run_ok(&env, &["temp-mode"]);
    assert!(stdout.contains("Entered temporary ID mode"), "{stdout}");

    run_ok(&env, &["record", "early"]);
    run_ok(&env, &["flush"]);

    let stdout = run_ok(&env, &["drain"]);
    assert!(stdout.contains("temporary device ID"), "{stdout}");
    assert!(stdout.contains("Remaining:       1"), "{stdout}");

    let stdout = run_ok(&env, &["change-id", "known"]);
    assert!(stdout.contains("1 queued requests rewritten"), "{stdout}");

    let stdout = run_ok(&env, &["requests"]);
    assert!(stdout.contains("device_id=known"), "{stdout}");
}

#[test]
fn clear_empties_the_store() {
    let env = CliTestEnv::configured();
    run_ok(&env, &["record", "a"]);
    run_ok(&env, &["flush"]);
    run_ok(&env, &["record", "b"]);

    let stdout = run_ok(&env, &["clear"]);
    assert!(stdout.contains("Cleared 1 requests and 1 events"), "{stdout}");

    let stdout = run_ok(&env, &["requests"]);
    assert!(stdout.contains("No queued requests"), "{stdout}");
}

#[test]
fn crash_is_queued_as_a_request() {
    let env = CliTestEnv::configured();

    let stdout = run_ok(&env, &["crash", "boom", "--nonfatal", "--log", "clicked"]);
    assert!(stdout.contains("Queued crash report (1 queued)"), "{stdout}");

    let stdout = run_ok(&env, &["requests"]);
    assert!(stdout.contains("crash="), "{stdout}");

    let output = run_bin(&env, &["crash", " "]);
    assert!(!output.status.success());
}
