mod common;

use assert_cmd::Command;
use predicates::str::contains;
use std::{
    fs,
    path::Path,
    process::{Child, Stdio},
    thread,
    time::{Duration, Instant},
};
use tempfile::tempdir;

fn pward(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("pward"));
    cmd.env("HOME", home).env_remove("RUST_LOG");
    cmd
}

fn spawn_foreground(home: &Path, config: &Path) -> Child {
    std::process::Command::new(assert_cmd::cargo::cargo_bin!("pward"))
        .env("HOME", home)
        .arg("start")
        .arg("--config")
        .arg(config)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn pward")
}

fn wait_for_socket(home: &Path) {
    let socket = home.join(".local/share/procward/control.sock");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !socket.exists() {
        if Instant::now() >= deadline {
            panic!("control socket never appeared at {socket:?}");
        }
        thread::sleep(Duration::from_millis(50));
    }
    thread::sleep(Duration::from_millis(100));
}

fn wait_for_exit(child: &mut Child) -> std::process::ExitStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("pward did not exit after shutdown");
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn missing_descriptor_fails_start() {
    let home = tempdir().unwrap();
    pward(home.path())
        .arg("start")
        .arg("--config")
        .arg(home.path().join("missing.yaml"))
        .assert()
        .failure()
        .stderr(contains("missing.yaml"));
}

#[test]
fn malformed_descriptor_fails_start() {
    let home = tempdir().unwrap();
    let config = home.path().join("procward.yaml");
    fs::write(&config, "apps:\n  - name: a\n    script: x\n  - name: a\n    script: y\n")
        .unwrap();

    pward(home.path())
        .arg("start")
        .arg("-c")
        .arg(&config)
        .assert()
        .failure()
        .stderr(contains("declared more than once"));
}

#[test]
fn unknown_entry_fails_start() {
    let home = tempdir().unwrap();
    let config = home.path().join("procward.yaml");
    fs::write(&config, "apps:\n  - name: web\n    script: /bin/true\n").unwrap();

    pward(home.path())
        .args(["start", "-n", "ghost", "-c"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(contains("ghost"));
}

#[test]
fn control_commands_fail_without_supervisor() {
    let home = tempdir().unwrap();
    for args in [
        vec!["status"],
        vec!["stop"],
        vec!["restart", "-n", "web"],
    ] {
        pward(home.path())
            .args(&args)
            .assert()
            .failure()
            .stderr(contains("no resident supervisor"));
    }
}

#[test]
fn start_status_stop_round_trip() {
    let home = tempdir().unwrap();
    let config = home.path().join("procward.yaml");
    fs::write(
        &config,
        r#"version: "1"
apps:
  - name: web
    script: /bin/sh
    args: ["-c", "sleep 30"]
  - name: worker
    script: sleep
    args: "30"
    restart_policy: on-failure
"#,
    )
    .unwrap();

    let mut supervisor = spawn_foreground(home.path(), &config);
    wait_for_socket(home.path());
    assert!(
        home.path()
            .join(".local/share/procward/pward.pid")
            .exists()
    );

    pward(home.path())
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(contains("\"name\": \"web\""))
        .stdout(contains("\"state\": \"running\""));

    pward(home.path())
        .args(["stop", "-n", "web"])
        .assert()
        .success()
        .stdout(contains("Entry 'web' stopped"));

    pward(home.path())
        .args(["status", "-n", "web", "--no-color"])
        .assert()
        .success()
        .stdout(contains("web - stopped"));

    pward(home.path())
        .args(["start", "-n", "web"])
        .assert()
        .success()
        .stdout(contains("Entry 'web' started"));

    pward(home.path())
        .args(["status", "-n", "web", "--no-color"])
        .assert()
        .success()
        .stdout(contains("web - running"));

    pward(home.path())
        .arg("start")
        .assert()
        .failure()
        .stderr(contains("already running"));

    pward(home.path())
        .args(["restart", "-n", "web"])
        .assert()
        .success();

    pward(home.path())
        .args(["status", "-n", "ghost"])
        .assert()
        .failure()
        .stderr(contains("ghost"));

    pward(home.path()).arg("stop").assert().success();

    let status = wait_for_exit(&mut supervisor);
    assert!(status.success());
    assert!(
        !home
            .path()
            .join(".local/share/procward/control.sock")
            .exists()
    );
}
