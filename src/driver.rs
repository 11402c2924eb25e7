//! Per-entry lifecycle thread.
//!
//! A driver owns the entry's `Child` for its whole lifetime: it spawns,
//! polls for exit, terminates on stop or file change, runs every exit
//! through [`policy::decide`], and waits out backoff delays. Stop requests
//! and reload requests reach it through the registry and its condvar.
use std::{
    io,
    path::Path,
    process::{Child, ExitStatus},
    sync::{Arc, mpsc::Sender},
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    config::ProcessSpec,
    constants::{CHILD_POLL_INTERVAL, WATCH_DEBOUNCE},
    error::LaunchError,
    policy::{self, BackoffState, RestartDecision, StopReason},
    process,
    state::{ExitKind, ExitOutcome, ExitTrigger, State},
    supervisor::Shared,
    watch::{ChangeFilter, SourceWatcher},
};

/// Drives one entry until it is stopped. `ready` receives the result of
/// the first spawn attempt.
pub(crate) fn run(
    shared: Arc<Shared>,
    spec: Arc<ProcessSpec>,
    ready: Sender<Result<u32, LaunchError>>,
) {
    let name = spec.name.as_str();
    let mut ready = Some(ready);
    let mut backoff = BackoffState::default();
    let _watcher = spec.watch.then(|| start_watcher(&shared, &spec)).flatten();

    loop {
        let outcome = match process::spawn(&spec, &shared.inherited_env) {
            Ok(child) => {
                let pid = child.id();
                shared.update(name, |record| {
                    record.current.mark_spawned(pid);
                    record.reload_requested = false;
                    record.transition(State::Running);
                });
                info!("Entry '{name}' running with PID {pid}");
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(pid));
                }
                supervise(&shared, &spec, child)
            }
            Err(err) => {
                error!("Failed to launch '{name}': {err}");
                let outcome = ExitOutcome::launch_failed(err.to_string());
                if let Some(ready) = ready.take() {
                    shared.update(name, |record| {
                        record.current.exit = Some(outcome);
                        record.transition(State::Crashed);
                        record.driver_active = false;
                    });
                    let _ = ready.send(Err(err));
                    return;
                }
                outcome
            }
        };

        match &outcome.kind {
            ExitKind::Code(code) => info!("Entry '{name}' exited with code {code}"),
            ExitKind::Signal(signal) => warn!("Entry '{name}' terminated by signal {signal}"),
            ExitKind::LaunchFailed(_) => {}
        }
        backoff.record_run(&spec.backoff, outcome.uptime);

        let decision = {
            let mut registry = shared.lock_lenient();
            let Some(record) = registry.entries.get_mut(name) else {
                return;
            };
            record.current.exit = Some(outcome.clone());
            record.transition(outcome.terminal_state());

            let decision = if record.stop_request.is_some() {
                RestartDecision::NoRestart(StopReason::Requested)
            } else {
                policy::decide(
                    spec.restart_policy,
                    &outcome,
                    record.restart_count,
                    spec.max_restarts,
                    spec.backoff.reset_after,
                )
            };

            match decision {
                RestartDecision::NoRestart(reason) => {
                    match reason {
                        StopReason::CeilingReached { restarts, ceiling } => {
                            warn!(
                                "Entry '{name}' reached its restart ceiling ({restarts}/{ceiling}); giving up"
                            );
                            record.ceiling_reached = true;
                        }
                        reason => debug!("Entry '{name}' will not restart: {reason:?}"),
                    }
                    record.transition(State::Stopped);
                    record.stop_request = None;
                    record.driver_active = false;
                }
                RestartDecision::RestartAfterBackoff => record.transition(State::Restarting),
                RestartDecision::RestartNow => {}
            }
            shared.changed.notify_all();
            decision
        };

        match decision {
            RestartDecision::NoRestart(_) => return,
            RestartDecision::RestartAfterBackoff => {
                let delay = backoff.next_delay(&spec.backoff);
                info!("Restarting '{name}' in {delay:?}");
                if !wait_for_backoff(&shared, name, delay) {
                    info!("Restart of '{name}' cancelled");
                    shared.update(name, |record| {
                        record.transition(State::Stopped);
                        record.stop_request = None;
                        record.driver_active = false;
                    });
                    return;
                }
            }
            RestartDecision::RestartNow => {
                debug!("Restarting '{name}' immediately");
            }
        }

        let mut registry = shared.lock_lenient();
        let instance = registry.next_instance_id();
        if let Some(record) = registry.entries.get_mut(name) {
            if record.stop_request.is_some() {
                info!("Restart of '{name}' cancelled");
                record.transition(State::Stopped);
                record.stop_request = None;
                record.driver_active = false;
                shared.changed.notify_all();
                return;
            }
            record.restart_count = record.restart_count.saturating_add(1);
            record.rotate_instance(instance);
            record.transition(State::Starting);
        }
        shared.changed.notify_all();
    }
}

/// Polls `child` until it exits, terminating it early on a stop or reload
/// request.
fn supervise(shared: &Shared, spec: &ProcessSpec, mut child: Child) -> ExitOutcome {
    let name = spec.name.as_str();
    let started = Instant::now();
    let mut registry = shared.lock_lenient();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return ExitOutcome::from_status(status, started.elapsed(), ExitTrigger::Child);
            }
            Ok(None) => {}
            Err(err) => warn!("Failed to poll '{name}': {err}"),
        }

        let (stop_request, reload) = registry
            .entries
            .get_mut(name)
            .map(|record| {
                let reload = std::mem::take(&mut record.reload_requested);
                (record.stop_request, reload)
            })
            .unwrap_or((None, false));

        if let Some(grace) = stop_request {
            drop(registry);
            let result = process::terminate(&mut child, name, grace);
            return exit_from(name, result, started.elapsed(), ExitTrigger::StopRequest);
        }
        if reload {
            drop(registry);
            info!("Source change detected; restarting '{name}'");
            let result = process::terminate(&mut child, name, spec.grace_period);
            return exit_from(name, result, started.elapsed(), ExitTrigger::FileChange);
        }

        registry = match shared.changed.wait_timeout(registry, CHILD_POLL_INTERVAL) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
}

fn exit_from(
    name: &str,
    result: io::Result<ExitStatus>,
    uptime: Duration,
    trigger: ExitTrigger,
) -> ExitOutcome {
    match result {
        Ok(status) => ExitOutcome::from_status(status, uptime, trigger),
        Err(err) => {
            error!("Failed to reap '{name}': {err}");
            ExitOutcome {
                kind: ExitKind::Signal(libc::SIGKILL),
                uptime,
                trigger,
            }
        }
    }
}

/// Sleeps for `delay` unless a stop request arrives first. Returns `true`
/// when the full delay elapsed.
fn wait_for_backoff(shared: &Shared, name: &str, delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    let mut registry = shared.lock_lenient();
    loop {
        let stop_requested = registry
            .entries
            .get(name)
            .is_none_or(|record| record.stop_request.is_some());
        if stop_requested {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        registry = match shared.changed.wait_timeout(registry, deadline - now) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
}

fn start_watcher(shared: &Arc<Shared>, spec: &ProcessSpec) -> Option<SourceWatcher> {
    let ignored_files = spec
        .stdout_file
        .iter()
        .chain(spec.stderr_file.iter())
        .cloned()
        .collect();
    let filter = ChangeFilter::new(&spec.cwd, &spec.watch_ignore, ignored_files);
    let shared = Arc::clone(shared);
    let name = spec.name.clone();

    let on_change = move |path: &Path| {
        let mut registry = shared.lock_lenient();
        let Some(record) = registry.entries.get_mut(&name) else {
            return;
        };
        let settled = record
            .current
            .started
            .is_some_and(|started| started.elapsed() >= WATCH_DEBOUNCE);
        if record.state == State::Running && settled && !record.reload_requested {
            debug!("Scheduling reload of '{name}' after change to {}", path.display());
            record.reload_requested = true;
            shared.changed.notify_all();
        }
    };

    match SourceWatcher::start(&spec.name, filter, on_change) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!("Failed to watch {} for '{}': {err}", spec.cwd.display(), spec.name);
            None
        }
    }
}
