mod common;

use std::{fs, thread, time::Duration};

use common::{shell, supervisor, wait_until};
use procward::{RestartPolicy, State};
use tempfile::tempdir;

#[test]
fn source_change_restarts_watched_entry() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("app.py"), "print('v1')\n").unwrap();
    let spec = shell("dev", dir.path(), "sleep 30").watch(true);

    let sup = supervisor(vec![]);
    let first = sup.launch(spec).unwrap();
    thread::sleep(Duration::from_millis(800));

    fs::write(dir.path().join("app.py"), "print('v2')\n").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        sup.restart_count("dev").unwrap() >= 1
    }));
    assert!(sup.wait_for_state("dev", State::Running, Duration::from_secs(2)).unwrap());

    let report = sup.report("dev").unwrap();
    assert_ne!(report.pid, first.pid());
    assert!(sup.await_exit(&first).unwrap().signal().is_some());

    sup.stop_entry("dev").unwrap();
    assert_eq!(sup.state_of("dev").unwrap(), State::Stopped);
}

#[test]
fn file_change_restart_ignores_never_policy_and_ceiling() {
    let dir = tempdir().unwrap();
    let spec = shell("pinned", dir.path(), "sleep 30")
        .watch(true)
        .restart_policy(RestartPolicy::Never)
        .max_restarts(0);

    let sup = supervisor(vec![]);
    sup.launch(spec).unwrap();
    thread::sleep(Duration::from_millis(800));

    fs::write(dir.path().join("settings.toml"), "debug = true\n").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        sup.restart_count("pinned").unwrap() >= 1
    }));
    assert!(sup.wait_for_state("pinned", State::Running, Duration::from_secs(2)).unwrap());
    sup.stop_entry("pinned").unwrap();
}

#[test]
fn own_output_and_ignored_directories_do_not_trigger_restarts() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("node_modules")).unwrap();
    fs::create_dir_all(dir.path().join("cache")).unwrap();
    let out = dir.path().join("out.log");

    let mut spec = shell(
        "noisy",
        dir.path(),
        "while true; do echo tick; sleep 0.1; done",
    )
    .watch(true)
    .output_files(Some(out), None);
    spec.watch_ignore = vec!["cache".into()];

    let sup = supervisor(vec![]);
    sup.launch(spec).unwrap();
    thread::sleep(Duration::from_millis(800));

    fs::write(dir.path().join("node_modules/pkg.js"), "module.exports = 1;\n").unwrap();
    fs::write(dir.path().join("cache/blob"), "data").unwrap();
    thread::sleep(Duration::from_millis(1_000));

    assert_eq!(sup.restart_count("noisy").unwrap(), 0);
    assert_eq!(sup.state_of("noisy").unwrap(), State::Running);
    sup.stop_entry("noisy").unwrap();
}

#[test]
fn unwatched_entries_ignore_changes() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![]);
    sup.launch(shell("plain", dir.path(), "sleep 30")).unwrap();
    thread::sleep(Duration::from_millis(600));

    fs::write(dir.path().join("main.rs"), "fn main() {}\n").unwrap();
    thread::sleep(Duration::from_millis(800));

    assert_eq!(sup.restart_count("plain").unwrap(), 0);
    sup.stop_entry("plain").unwrap();
}
