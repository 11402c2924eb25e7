mod common;

use std::{
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use common::{pid_alive, shell, supervisor, wait_until};
use procward::{
    LaunchError, RestartPolicy, State, SupervisorError, policy::BackoffPolicy, state::ExitKind,
};
use tempfile::tempdir;

#[test]
fn launched_entry_is_live_until_stopped() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![]);

    let handle = sup.launch(shell("web", dir.path(), "sleep 30")).unwrap();
    assert!(matches!(
        sup.status(&handle).unwrap(),
        State::Starting | State::Running
    ));
    let pid = handle.pid().expect("pid recorded");
    assert!(pid_alive(pid));

    sup.stop(&handle, Duration::from_secs(2)).unwrap();
    assert_eq!(sup.status(&handle).unwrap(), State::Stopped);
    assert!(!pid_alive(pid));

    let outcome = sup.await_exit(&handle).unwrap();
    assert_eq!(outcome.kind, ExitKind::Signal(libc::SIGTERM));
}

#[test]
fn never_policy_leaves_entry_stopped_after_clean_exit() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![]);
    let spec = shell("once", dir.path(), "exit 0").restart_policy(RestartPolicy::Never);

    let handle = sup.launch(spec).unwrap();
    let outcome = sup.await_exit(&handle).unwrap();
    assert_eq!(outcome.code(), Some(0));

    assert!(sup.wait_for_state("once", State::Stopped, Duration::from_secs(2)).unwrap());
    thread::sleep(Duration::from_millis(300));
    assert_eq!(sup.restart_count("once").unwrap(), 0);
    assert_eq!(sup.state_of("once").unwrap(), State::Stopped);
}

#[test]
fn stop_twice_matches_stop_once() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![shell("idle", dir.path(), "sleep 30")]);

    let handle = sup.start("idle").unwrap();
    sup.stop(&handle, Duration::from_secs(2)).unwrap();
    let first = sup.report("idle").unwrap();
    sup.stop(&handle, Duration::from_secs(2)).unwrap();
    let second = sup.report("idle").unwrap();

    assert_eq!(first.state, State::Stopped);
    assert_eq!(second.state, State::Stopped);
    assert_eq!(first.restarts, second.restarts);
    assert_eq!(first.last_exit, second.last_exit);
}

#[test]
fn stopping_a_pending_entry_is_a_no_op() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![shell("later", dir.path(), "sleep 30")]);
    assert_eq!(sup.state_of("later").unwrap(), State::Pending);

    sup.stop_entry("later").unwrap();
    assert_eq!(sup.state_of("later").unwrap(), State::Stopped);
    assert!(matches!(
        sup.stop_entry("missing"),
        Err(SupervisorError::UnknownEntry(_))
    ));
}

#[test]
fn stubborn_child_is_killed_after_grace() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![]);
    let spec = shell(
        "stubborn",
        dir.path(),
        "trap '' TERM; while true; do sleep 0.05; done",
    );

    let handle = sup.launch(spec).unwrap();
    thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    sup.stop(&handle, Duration::from_millis(400)).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(400));

    let outcome = sup.await_exit(&handle).unwrap();
    assert_eq!(outcome.kind, ExitKind::Signal(libc::SIGKILL));
    assert_eq!(sup.status(&handle).unwrap(), State::Stopped);
}

#[test]
fn stop_cancels_pending_backoff() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![]);
    let spec = shell("flaky", dir.path(), "exit 3").backoff(BackoffPolicy {
        base: Duration::from_secs(10),
        max: Duration::from_secs(10),
        reset_after: Duration::from_secs(30),
    });

    let handle = sup.launch(spec).unwrap();
    assert!(sup.wait_for_state("flaky", State::Restarting, Duration::from_secs(3)).unwrap());

    let started = Instant::now();
    sup.stop(&handle, Duration::from_secs(1)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(sup.status(&handle).unwrap(), State::Stopped);
    assert_eq!(sup.restart_count("flaky").unwrap(), 0);
}

#[test]
fn stop_during_immediate_restarts_does_not_relaunch() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![]);

    for round in 0..10 {
        let spec = shell("spinner", dir.path(), "exit 0").backoff(BackoffPolicy {
            base: Duration::from_secs(10),
            max: Duration::from_secs(10),
            reset_after: Duration::ZERO,
        });
        let handle = sup.launch(spec).unwrap();
        thread::sleep(Duration::from_millis(5 * round));

        sup.stop(&handle, Duration::from_secs(1)).unwrap();
        assert_eq!(sup.state_of("spinner").unwrap(), State::Stopped);

        let settled = sup.restart_count("spinner").unwrap();
        let report = sup.report("spinner").unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(sup.restart_count("spinner").unwrap(), settled);
        assert_eq!(sup.report("spinner").unwrap().pid, report.pid);
        assert_eq!(sup.state_of("spinner").unwrap(), State::Stopped);
    }
}

#[test]
fn missing_working_directory_fails_launch_and_parks_entry() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![]);
    let spec = shell("lost", &dir.path().join("does-not-exist"), "sleep 1");

    let err = sup.launch(spec).unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::Launch(LaunchError::WorkingDirectory { .. })
    ));
    assert_eq!(sup.state_of("lost").unwrap(), State::Crashed);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(sup.state_of("lost").unwrap(), State::Crashed);
    assert_eq!(sup.restart_count("lost").unwrap(), 0);
    let report = sup.report("lost").unwrap();
    assert!(report.last_exit.and_then(|exit| exit.error).is_some());
}

#[test]
fn missing_executable_is_a_launch_error() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![]);
    let spec = procward::ProcessSpec::new("ghost", "definitely-not-a-real-binary", dir.path());

    let err = sup.launch(spec).unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::Launch(LaunchError::ExecutableNotFound { .. })
    ));
}

#[test]
fn await_exit_does_not_block_other_entries() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![]);
    let slow = sup.launch(shell("slow", dir.path(), "sleep 30")).unwrap();
    let quick = sup
        .launch(shell("quick", dir.path(), "sleep 30").restart_policy(RestartPolicy::Never))
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let sup = sup.clone();
        let slow = slow.clone();
        thread::spawn(move || {
            let outcome = sup.await_exit(&slow);
            tx.send(()).unwrap();
            outcome
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    sup.stop(&quick, Duration::from_secs(2)).unwrap();
    assert_eq!(sup.status(&quick).unwrap(), State::Stopped);
    assert!(sup.status(&slow).unwrap().is_live());

    sup.stop(&slow, Duration::from_secs(2)).unwrap();
    let outcome = waiter.join().unwrap().unwrap();
    assert_eq!(outcome.signal(), Some(libc::SIGTERM));
}

#[test]
fn relaunch_after_stop_gets_a_new_instance() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![shell("api", dir.path(), "sleep 30")]);

    let first = sup.start("api").unwrap();
    assert!(matches!(
        sup.start("api"),
        Err(SupervisorError::AlreadyRunning(_))
    ));
    sup.stop(&first, Duration::from_secs(2)).unwrap();

    let second = sup.start("api").unwrap();
    assert_ne!(first.instance(), second.instance());
    assert!(sup.await_exit(&first).is_ok());
    sup.stop(&second, Duration::from_secs(2)).unwrap();
}

#[test]
fn shutdown_stops_every_entry() {
    let dir = tempdir().unwrap();
    let sup = supervisor(vec![
        shell("one", dir.path(), "sleep 30"),
        shell("two", dir.path(), "sleep 30"),
        shell("three", dir.path(), "exit 1"),
    ]);

    let handles = sup.start_all().unwrap();
    assert_eq!(handles.len(), 3);
    let pids: Vec<u32> = handles.iter().filter_map(|handle| handle.pid()).collect();

    sup.shutdown().unwrap();
    for report in sup.reports().unwrap() {
        assert_eq!(report.state, State::Stopped, "{}", report.name);
    }
    assert!(wait_until(Duration::from_secs(2), || {
        pids.iter().all(|pid| !pid_alive(*pid))
    }));
}
