//! Integration tests for the destguard binary.
//!
//! Tests touching nftables require root and are marked with #[ignore].
//! Run with: `sudo cargo test --release -- --ignored`

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;

/// Helper to get the path to the compiled binary
fn get_binary_path() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // Remove test binary name
    path.pop(); // Remove deps directory
    path.push("destguard");
    path
}

/// Check if running as root
fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Run destguard command and return output
fn run_destguard(args: &[&str]) -> std::process::Output {
    let binary = get_binary_path();
    Command::new(&binary)
        .args(args)
        .output()
        .expect("Failed to execute destguard")
}

/// Run destguard with `input` on stdin
fn run_destguard_with_input(args: &[&str], input: &str) -> std::process::Output {
    let mut child = Command::new(get_binary_path())
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn destguard");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    child.wait_with_output().expect("Failed to wait for destguard")
}

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_version_command() {
    let output = run_destguard(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("destguard "));
}

#[test]
fn test_help_command() {
    let output = run_destguard(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"));
    assert!(stdout.contains("check-config"));
}

#[test]
fn test_invalid_command() {
    let output = run_destguard(&["update"]);
    assert!(!output.status.success());
}

#[test]
fn test_check_config_valid() {
    let config = write_config("mode: both\nallowed_ips: [\"10.0.0.0/24\"]\n");
    let path = config.path().to_str().unwrap();

    let output = run_destguard(&["-c", path, "check-config"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Mode: both"));
    assert!(stdout.contains("10.0.0.0 - 10.0.1.0"));
}

#[test]
fn test_check_config_invalid_literal() {
    let config = write_config("mode: local\nallowed_ips: [\"292.168.0.0/24\"]\n");
    let path = config.path().to_str().unwrap();

    let output = run_destguard(&["-c", path, "check-config"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("292.168.0.0/24"), "stderr: {}", stderr);
}

#[test]
fn test_check_config_missing_mode() {
    let config = write_config("allowed_ips: []\n");
    let path = config.path().to_str().unwrap();

    let output = run_destguard(&["-c", path, "check-config"]);
    assert!(!output.status.success());
}

#[test]
fn test_run_dry_run_consumes_stdin() {
    let config = write_config("mode: local\n");
    let path = config.path().to_str().unwrap();

    let output = run_destguard_with_input(
        &["-v", "-c", path, "run", "--dry-run"],
        "300 192.168.1.1\n# comment\nbogus line\n60 2001:db8::1 1.1.1.1\n",
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "stderr: {}", stderr);
    assert!(stderr.contains("Firewall topology ready"));
    assert!(stderr.contains("Skipping input line 3"));
}

#[test]
fn test_run_requires_root_without_dry_run() {
    if is_root() {
        return;
    }
    let config = write_config("mode: local\n");
    let path = config.path().to_str().unwrap();

    let output = run_destguard_with_input(&["-c", path, "run"], "");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("root"));
}

#[test]
#[ignore] // Requires root and nft
fn test_run_programs_nftables() {
    if !is_root() {
        eprintln!("Skipping test_run_programs_nftables: requires root");
        return;
    }

    let config = write_config("mode: local\ntable: destguard_it\nallowed_ips: [\"0.0.0.0/0\", \"::/0\"]\n");
    let path = config.path().to_str().unwrap();

    let output = run_destguard_with_input(&["-c", path, "run"], "300 192.0.2.1\n");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let output = run_destguard(&["-c", path, "status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("192.0.2.1"), "stdout: {}", stdout);

    let output = run_destguard(&["-c", path, "remove"]);
    assert!(output.status.success());
}

#[test]
#[ignore] // Requires root
fn test_concurrent_execution_lock() {
    if !is_root() {
        eprintln!("Skipping test_concurrent_execution_lock: requires root");
        return;
    }

    let config = write_config("mode: local\ntable: destguard_lock\nallowed_ips: [\"0.0.0.0/0\", \"::/0\"]\n");
    let path = config.path().to_str().unwrap().to_string();

    // First instance keeps stdin open and so holds the lock
    let mut first = Command::new(get_binary_path())
        .args(["-c", &path, "run"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(500));

    let second = run_destguard_with_input(&["-c", &path, "run"], "");
    let stderr = String::from_utf8_lossy(&second.stderr);
    assert!(!second.status.success());
    assert!(stderr.contains("already running"), "stderr: {}", stderr);

    drop(first.stdin.take());
    first.wait().unwrap();
    run_destguard(&["-c", &path, "remove"]);
}
