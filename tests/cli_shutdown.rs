#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

/// A daemon stand-in that records its pid and never answers HTTP.
fn write_fake_daemon(dir: &Path) -> (PathBuf, PathBuf) {
    let pid_file = dir.join("daemon.pid");
    let script = dir.join("fake-ollama");
    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\necho $$ > '{}'\nwhile true; do sleep 1; done\n",
            pid_file.display()
        ),
    )
    .expect("write script");
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    (script, pid_file)
}

fn spawn_cli(dir: &TempDir, daemon: &Path, args: &[&str]) -> Child {
    Command::new(env!("CARGO_BIN_EXE_rustydoc"))
        .args(args)
        .env("OLLAMA_URL", closed_port_url())
        .env("OLLAMA_COMMAND", daemon)
        .env("STARTUP_WINDOW_SECS", "60")
        .env("STOP_GRACE_SECS", "1")
        .env("LIVENESS_TIMEOUT_MS", "200")
        .env("INDEX_ROOT", dir.path().join("indexes"))
        .env("RUSTYDOC_LOG_FILE", dir.path().join("rustydoc.log"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rustydoc")
}

fn wait_for_pid(path: &Path) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(pid) = std::fs::read_to_string(path).unwrap_or_default().trim().parse() {
            return pid;
        }
        assert!(Instant::now() < deadline, "daemon was never spawned");
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn process_alive(pid: u32) -> bool {
    let state = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap_or_default();
    !state.is_empty() && !state.contains(") Z")
}

fn send_sigterm(pid: u32) {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    assert_eq!(rc, 0, "failed to signal rustydoc");
}

fn assert_exits(cli: &mut Child) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while cli.try_wait().expect("try_wait").is_none() {
        assert!(Instant::now() < deadline, "rustydoc ignored SIGTERM");
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn assert_dies(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while process_alive(pid) {
        assert!(Instant::now() < deadline, "daemon {pid} outlived rustydoc");
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn sigterm_during_one_shot_command_stops_spawned_daemon() {
    let dir = TempDir::new().expect("tempdir");
    let (daemon, pid_file) = write_fake_daemon(dir.path());
    let mut cli = spawn_cli(&dir, &daemon, &["models"]);

    let daemon_pid = wait_for_pid(&pid_file);
    assert!(process_alive(daemon_pid));
    std::thread::sleep(Duration::from_millis(300));

    send_sigterm(cli.id());
    assert_exits(&mut cli);
    assert_dies(daemon_pid);
}

#[test]
fn sigterm_during_ingest_stops_spawned_daemon() {
    let dir = TempDir::new().expect("tempdir");
    let docs = dir.path().join("docs");
    std::fs::create_dir_all(&docs).expect("docs dir");
    std::fs::write(docs.join("notes.md"), "Rust keeps memory safe.").expect("write doc");
    let (daemon, pid_file) = write_fake_daemon(dir.path());
    let mut cli = spawn_cli(
        &dir,
        &daemon,
        &["ingest", docs.to_str().expect("utf-8 path")],
    );

    let daemon_pid = wait_for_pid(&pid_file);
    std::thread::sleep(Duration::from_millis(300));

    send_sigterm(cli.id());
    assert_exits(&mut cli);
    assert_dies(daemon_pid);
}
