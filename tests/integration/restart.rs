mod common;

use std::{fs, thread, time::Duration};

use common::{shell, supervisor, wait_for_lines, wait_until};
use procward::{RestartPolicy, State, SupervisorError, policy::BackoffPolicy};
use tempfile::tempdir;

#[test]
fn always_policy_restarts_short_lived_children_until_stopped() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![]);
    let handle = sup.launch(shell("blink", dir.path(), "exit 0")).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        sup.restart_count("blink").unwrap() >= 2
    }));

    sup.stop(&handle, Duration::from_secs(1)).unwrap();
    assert_eq!(sup.state_of("blink").unwrap(), State::Stopped);

    let settled = sup.restart_count("blink").unwrap();
    thread::sleep(Duration::from_millis(400));
    assert_eq!(sup.restart_count("blink").unwrap(), settled);
    assert_eq!(sup.state_of("blink").unwrap(), State::Stopped);
}

#[test]
fn on_failure_ignores_clean_exit() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![]);
    let spec = shell("job", dir.path(), "exit 0").restart_policy(RestartPolicy::OnFailure);

    sup.launch(spec).unwrap();
    assert!(sup.wait_for_state("job", State::Stopped, Duration::from_secs(2)).unwrap());
    thread::sleep(Duration::from_millis(200));
    assert_eq!(sup.restart_count("job").unwrap(), 0);
    assert!(sup.health("job").is_ok());
}

#[test]
fn on_failure_retries_until_ceiling() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![]);
    let spec = shell("broken", dir.path(), "exit 2")
        .restart_policy(RestartPolicy::OnFailure)
        .max_restarts(3);

    sup.launch(spec).unwrap();
    assert!(sup.wait_for_state("broken", State::Stopped, Duration::from_secs(5)).unwrap());
    assert_eq!(sup.restart_count("broken").unwrap(), 3);
    assert!(matches!(
        sup.health("broken"),
        Err(SupervisorError::RestartCeilingExceeded { restarts: 3, .. })
    ));

    let report = sup.report("broken").unwrap();
    assert_eq!(report.last_exit.unwrap().code, Some(2));
    assert!(report.failure.unwrap().contains("restart ceiling"));
}

#[test]
fn backoff_delays_grow_between_attempts() {
    let dir = tempdir().unwrap();
    let marks = dir.path().join("marks");
    let script = format!("date +%s%N >> {}; exit 1", marks.display());
    let spec = shell("grow", dir.path(), &script)
        .backoff(BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            reset_after: Duration::from_secs(30),
        })
        .max_restarts(3);

    let sup = supervisor(vec![]);
    sup.launch(spec).unwrap();

    let lines = wait_for_lines(&marks, 4);
    let stamps: Vec<u128> = lines.iter().map(|line| line.trim().parse().unwrap()).collect();
    let gaps_ms: Vec<u128> = stamps.windows(2).map(|w| (w[1] - w[0]) / 1_000_000).collect();

    assert!(gaps_ms[0] >= 100, "{gaps_ms:?}");
    assert!(gaps_ms[1] >= 200, "{gaps_ms:?}");
    assert!(gaps_ms[2] >= 400, "{gaps_ms:?}");
    assert!(sup.wait_for_state("grow", State::Stopped, Duration::from_secs(2)).unwrap());
}

#[test]
fn healthy_runs_restart_without_backoff() {
    let dir = tempdir().unwrap();
    let spec = shell("steady", dir.path(), "sleep 0.3; exit 1").backoff(BackoffPolicy {
        base: Duration::from_secs(10),
        max: Duration::from_secs(10),
        reset_after: Duration::from_millis(200),
    });

    let sup = supervisor(vec![]);
    let handle = sup.launch(spec).unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        sup.restart_count("steady").unwrap() >= 2
    }));
    sup.stop(&handle, Duration::from_secs(1)).unwrap();
}

#[test]
fn failed_relaunch_counts_against_ceiling() {
    let dir = tempdir().unwrap();
    let workdir = dir.path().join("work");
    fs::create_dir(&workdir).unwrap();

    let spec = shell("vanishing", &workdir, "rmdir \"$(pwd)\"; exit 1").max_restarts(2);
    let sup = supervisor(vec![]);
    sup.launch(spec).unwrap();

    assert!(sup.wait_for_state("vanishing", State::Stopped, Duration::from_secs(5)).unwrap());
    assert_eq!(sup.restart_count("vanishing").unwrap(), 2);
    let report = sup.report("vanishing").unwrap();
    assert!(report.last_exit.unwrap().error.is_some());
    assert!(report.failure.is_some());
}

#[test]
fn explicit_restart_replaces_the_process() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![shell("api", dir.path(), "sleep 30")]);

    let first = sup.start("api").unwrap();
    let second = sup.restart("api").unwrap();

    assert_ne!(first.pid(), second.pid());
    assert!(sup.status(&second).unwrap().is_live());
    assert!(sup.await_exit(&first).unwrap().signal().is_some());
    sup.stop(&second, Duration::from_secs(2)).unwrap();
}
