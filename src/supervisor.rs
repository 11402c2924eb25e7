//! The supervisor: a registry of managed entries, each driven by its own
//! lifecycle thread.
//!
//! All mutable state lives in one [`Registry`] behind a single mutex, paired
//! with a condvar that is notified on every state change. Driver threads own
//! the OS process handles; callers only ever see snapshots.
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    io,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    config::{Descriptor, ProcessSpec},
    constants::{INSTANCE_HISTORY, STOP_SLACK},
    driver, env,
    error::SupervisorError,
    state::{ExitOutcome, ExitSummary, ProcessInstance, State, StatusReport},
};

/// Reference to one launched instance of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    name: String,
    instance: u64,
    pid: Option<u32>,
}

impl InstanceHandle {
    /// Entry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instance id, unique within the supervisor.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// OS process id of the instance.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Book-keeping for one named entry.
pub(crate) struct EntryRecord {
    pub(crate) spec: Arc<ProcessSpec>,
    pub(crate) state: State,
    pub(crate) current: ProcessInstance,
    pub(crate) history: VecDeque<ProcessInstance>,
    pub(crate) restart_count: u32,
    pub(crate) driver_active: bool,
    pub(crate) stop_request: Option<Duration>,
    pub(crate) reload_requested: bool,
    pub(crate) ceiling_reached: bool,
    pub(crate) driver: Option<JoinHandle<()>>,
}

impl EntryRecord {
    fn pending(spec: Arc<ProcessSpec>, instance: u64) -> Self {
        Self {
            spec,
            state: State::Pending,
            current: ProcessInstance::new(instance, 0),
            history: VecDeque::new(),
            restart_count: 0,
            driver_active: false,
            stop_request: None,
            reload_requested: false,
            ceiling_reached: false,
            driver: None,
        }
    }

    pub(crate) fn transition(&mut self, state: State) {
        if self.state != state {
            debug!("Entry '{}': {} -> {}", self.spec.name, self.state, state);
            self.state = state;
        }
    }

    /// Moves the finished current instance into history and starts a new one.
    pub(crate) fn rotate_instance(&mut self, instance: u64) {
        let next = ProcessInstance::new(instance, self.restart_count);
        let previous = std::mem::replace(&mut self.current, next);
        if previous.exit.is_some() {
            self.history.push_back(previous);
            while self.history.len() > INSTANCE_HISTORY {
                self.history.pop_front();
            }
        }
    }

    fn find_instance(&self, instance: u64) -> Option<&ProcessInstance> {
        if self.current.id == instance {
            return Some(&self.current);
        }
        self.history.iter().find(|candidate| candidate.id == instance)
    }

    fn report(&self) -> StatusReport {
        let last_exit = if self.current.exit.is_some() {
            self.current.exit.as_ref()
        } else {
            self.history.back().and_then(|instance| instance.exit.as_ref())
        };
        let failure = self.ceiling_reached.then(|| {
            SupervisorError::RestartCeilingExceeded {
                entry: self.spec.name.clone(),
                restarts: self.restart_count,
            }
            .to_string()
        });

        StatusReport {
            name: self.spec.name.clone(),
            state: self.state,
            pid: self.state.is_live().then_some(self.current.pid).flatten(),
            restarts: self.restart_count,
            started_at: self.current.started_at,
            uptime_ms: self
                .current
                .uptime()
                .map(|uptime| uptime.as_millis().min(u64::MAX as u128) as u64),
            last_exit: last_exit.map(ExitSummary::from),
            failure,
        }
    }
}

/// Name → entry mapping guarded by the supervisor's single lock.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) entries: HashMap<String, EntryRecord>,
    next_instance: u64,
}

impl Registry {
    pub(crate) fn next_instance_id(&mut self) -> u64 {
        self.next_instance += 1;
        self.next_instance
    }
}

/// State shared between the supervisor handle and its driver threads.
pub(crate) struct Shared {
    pub(crate) registry: Mutex<Registry>,
    pub(crate) changed: Condvar,
    pub(crate) inherited_env: BTreeMap<String, String>,
}

impl Shared {
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Registry>, SupervisorError> {
        Ok(self.registry.lock()?)
    }

    /// Lock for driver threads, which must keep going even after a panic elsewhere.
    pub(crate) fn lock_lenient(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `update` to the named entry and wakes every waiter.
    pub(crate) fn update<F>(&self, name: &str, update: F)
    where
        F: FnOnce(&mut EntryRecord),
    {
        let mut registry = self.lock_lenient();
        if let Some(record) = registry.entries.get_mut(name) {
            update(record);
        }
        self.changed.notify_all();
    }
}

/// Launches, observes, restarts, and stops the entries of a descriptor.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
    descriptor: Arc<Descriptor>,
}

impl Supervisor {
    /// Creates a supervisor whose children inherit the current environment.
    pub fn new(descriptor: Descriptor) -> Self {
        Self::with_environment(descriptor, env::inherited())
    }

    /// Creates a supervisor with an explicit inherited environment. Every
    /// descriptor entry is registered as `Pending`.
    pub fn with_environment(
        descriptor: Descriptor,
        inherited_env: BTreeMap<String, String>,
    ) -> Self {
        let mut registry = Registry::default();
        for spec in descriptor.entries() {
            let id = registry.next_instance_id();
            registry.entries.insert(
                spec.name.clone(),
                EntryRecord::pending(Arc::new(spec.clone()), id),
            );
        }

        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(registry),
                changed: Condvar::new(),
                inherited_env,
            }),
            descriptor: Arc::new(descriptor),
        }
    }

    /// The descriptor this supervisor was built from.
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Starts `spec` and returns once the child exists (or failed to).
    ///
    /// A failed first launch leaves the entry `Crashed` without scheduling a
    /// retry; failures of later automatic restarts go through backoff.
    pub fn launch(&self, spec: ProcessSpec) -> Result<InstanceHandle, SupervisorError> {
        spec.validate()?;
        let name = spec.name.clone();
        let spec = Arc::new(spec);

        let (instance, previous_driver) = {
            let mut registry = self.shared.lock()?;
            if registry
                .entries
                .get(&name)
                .is_some_and(|record| record.driver_active)
            {
                return Err(SupervisorError::AlreadyRunning(name));
            }

            let instance = registry.next_instance_id();
            let mut record = match registry.entries.remove(&name) {
                Some(mut previous) => {
                    previous.spec = Arc::clone(&spec);
                    previous.restart_count = 0;
                    previous.ceiling_reached = false;
                    previous.stop_request = None;
                    previous.reload_requested = false;
                    previous.rotate_instance(instance);
                    previous
                }
                None => EntryRecord::pending(Arc::clone(&spec), instance),
            };
            let previous_driver = record.driver.take();
            record.driver_active = true;
            record.transition(State::Starting);
            registry.entries.insert(name.clone(), record);
            self.shared.changed.notify_all();
            (instance, previous_driver)
        };

        if let Some(driver) = previous_driver {
            let _ = driver.join();
        }

        info!("Starting entry: {name}");
        let (ready_tx, ready_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let driver_spec = Arc::clone(&spec);
        let spawned = thread::Builder::new()
            .name(format!("pward-{name}"))
            .spawn(move || driver::run(shared, driver_spec, ready_tx));

        match spawned {
            Ok(driver) => {
                let mut registry = self.shared.lock()?;
                if let Some(record) = registry.entries.get_mut(&name) {
                    record.driver = Some(driver);
                }
            }
            Err(err) => {
                error!("Failed to spawn driver thread for '{name}': {err}");
                self.shared.update(&name, |record| {
                    record.current.exit = Some(ExitOutcome::launch_failed(err.to_string()));
                    record.transition(State::Crashed);
                    record.driver_active = false;
                });
                return Err(SupervisorError::Io(err));
            }
        }

        match ready_rx.recv() {
            Ok(Ok(pid)) => Ok(InstanceHandle {
                name,
                instance,
                pid: Some(pid),
            }),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(SupervisorError::Io(io::Error::other(format!(
                "driver for '{name}' exited before reporting launch result"
            )))),
        }
    }

    /// Launches a descriptor entry by name.
    pub fn start(&self, name: &str) -> Result<InstanceHandle, SupervisorError> {
        let spec = self
            .descriptor
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownEntry(name.to_string()))?;
        self.launch(spec)
    }

    /// Launches every descriptor entry. Launch failures are logged and do
    /// not prevent the remaining entries from starting.
    pub fn start_all(&self) -> Result<Vec<InstanceHandle>, SupervisorError> {
        let mut handles = Vec::new();
        for spec in self.descriptor.entries() {
            match self.launch(spec.clone()) {
                Ok(handle) => handles.push(handle),
                Err(SupervisorError::Launch(err)) => {
                    error!("Failed to start '{}': {err}", spec.name);
                }
                Err(SupervisorError::AlreadyRunning(name)) => {
                    debug!("Entry '{name}' already running; skipping");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(handles)
    }

    /// Blocks the calling thread until the handle's instance has exited.
    /// Other entries, status queries, and stop requests are unaffected.
    pub fn await_exit(&self, handle: &InstanceHandle) -> Result<ExitOutcome, SupervisorError> {
        let mut registry = self.shared.lock()?;
        loop {
            let record = registry
                .entries
                .get(&handle.name)
                .ok_or_else(|| SupervisorError::UnknownEntry(handle.name.clone()))?;

            let expired = || SupervisorError::InstanceExpired {
                entry: handle.name.clone(),
                instance: handle.instance,
            };
            match record.find_instance(handle.instance) {
                Some(instance) => {
                    if let Some(exit) = &instance.exit {
                        return Ok(exit.clone());
                    }
                    if !record.driver_active {
                        return Err(expired());
                    }
                }
                None => return Err(expired()),
            }

            registry = self.shared.changed.wait(registry)?;
        }
    }

    /// Stops the entry behind `handle`: SIGTERM, then SIGKILL once `grace`
    /// elapses. Interrupts a pending backoff. Stopping an entry that is not
    /// running is a no-op.
    pub fn stop(&self, handle: &InstanceHandle, grace: Duration) -> Result<(), SupervisorError> {
        self.stop_named(&handle.name, grace)
    }

    /// Stops an entry by name using its configured grace period.
    pub fn stop_entry(&self, name: &str) -> Result<(), SupervisorError> {
        let grace = {
            let registry = self.shared.lock()?;
            registry
                .entries
                .get(name)
                .map(|record| record.spec.grace_period)
                .ok_or_else(|| SupervisorError::UnknownEntry(name.to_string()))?
        };
        self.stop_named(name, grace)
    }

    fn stop_named(&self, name: &str, grace: Duration) -> Result<(), SupervisorError> {
        let waited = grace + STOP_SLACK;
        let deadline = Instant::now() + waited;
        let mut registry = self.shared.lock()?;

        {
            let record = registry
                .entries
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownEntry(name.to_string()))?;

            if !record.driver_active {
                record.transition(State::Stopped);
                self.shared.changed.notify_all();
                return Ok(());
            }

            if record.stop_request.is_none() {
                info!("Stopping entry: {name}");
                record.stop_request = Some(grace);
                self.shared.changed.notify_all();
            }
        }

        loop {
            let active = registry
                .entries
                .get(name)
                .is_some_and(|record| record.driver_active);
            if !active {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SupervisorError::StopTimedOut {
                    entry: name.to_string(),
                    waited,
                });
            }
            registry = self.shared.changed.wait_timeout(registry, deadline - now)?.0;
        }

        let driver = registry
            .entries
            .get_mut(name)
            .and_then(|record| record.driver.take());
        drop(registry);
        if let Some(driver) = driver {
            let _ = driver.join();
        }

        debug!("Entry '{name}' stopped");
        Ok(())
    }

    /// Stops an entry (if running) and launches it again from its last spec.
    pub fn restart(&self, name: &str) -> Result<InstanceHandle, SupervisorError> {
        let spec = {
            let registry = self.shared.lock()?;
            registry
                .entries
                .get(name)
                .map(|record| ProcessSpec::clone(&record.spec))
                .ok_or_else(|| SupervisorError::UnknownEntry(name.to_string()))?
        };
        info!("Restarting entry: {name}");
        self.stop_named(name, spec.grace_period)?;
        self.launch(spec)
    }

    /// Stops every running entry concurrently, each with its own grace period.
    pub fn shutdown(&self) -> Result<(), SupervisorError> {
        let mut registry = self.shared.lock()?;
        let mut longest_grace = Duration::ZERO;
        for record in registry.entries.values_mut() {
            if record.driver_active {
                if record.stop_request.is_none() {
                    record.stop_request = Some(record.spec.grace_period);
                }
                longest_grace = longest_grace.max(record.spec.grace_period);
            }
        }
        info!("Shutting down all entries");
        self.shared.changed.notify_all();

        let waited = longest_grace + STOP_SLACK;
        let deadline = Instant::now() + waited;
        loop {
            let still_active: Vec<String> = registry
                .entries
                .iter()
                .filter(|(_, record)| record.driver_active)
                .map(|(name, _)| name.clone())
                .collect();
            if still_active.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("Entries still running after shutdown wait: {still_active:?}");
                return Err(SupervisorError::StopTimedOut {
                    entry: still_active.join(", "),
                    waited,
                });
            }
            registry = self.shared.changed.wait_timeout(registry, deadline - now)?.0;
        }

        let drivers: Vec<JoinHandle<()>> = registry
            .entries
            .values_mut()
            .filter_map(|record| {
                if record.state == State::Pending {
                    record.transition(State::Stopped);
                }
                record.driver.take()
            })
            .collect();
        drop(registry);
        for driver in drivers {
            let _ = driver.join();
        }
        Ok(())
    }

    /// Current state of the entry behind `handle`. Never blocks on a child.
    pub fn status(&self, handle: &InstanceHandle) -> Result<State, SupervisorError> {
        self.state_of(&handle.name)
    }

    /// Current state of an entry by name.
    pub fn state_of(&self, name: &str) -> Result<State, SupervisorError> {
        let registry = self.shared.lock()?;
        registry
            .entries
            .get(name)
            .map(|record| record.state)
            .ok_or_else(|| SupervisorError::UnknownEntry(name.to_string()))
    }

    /// Like [`Supervisor::state_of`], but reports an entry that gave up after
    /// its restart ceiling as an error.
    pub fn health(&self, name: &str) -> Result<State, SupervisorError> {
        let registry = self.shared.lock()?;
        let record = registry
            .entries
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownEntry(name.to_string()))?;
        if record.ceiling_reached {
            return Err(SupervisorError::RestartCeilingExceeded {
                entry: name.to_string(),
                restarts: record.restart_count,
            });
        }
        Ok(record.state)
    }

    /// Status snapshot of one entry.
    pub fn report(&self, name: &str) -> Result<StatusReport, SupervisorError> {
        let registry = self.shared.lock()?;
        registry
            .entries
            .get(name)
            .map(EntryRecord::report)
            .ok_or_else(|| SupervisorError::UnknownEntry(name.to_string()))
    }

    /// Status snapshots of every entry, sorted by name.
    pub fn reports(&self) -> Result<Vec<StatusReport>, SupervisorError> {
        let registry = self.shared.lock()?;
        let mut reports: Vec<_> = registry.entries.values().map(EntryRecord::report).collect();
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(reports)
    }

    /// Restart count of an entry.
    pub fn restart_count(&self, name: &str) -> Result<u32, SupervisorError> {
        let registry = self.shared.lock()?;
        registry
            .entries
            .get(name)
            .map(|record| record.restart_count)
            .ok_or_else(|| SupervisorError::UnknownEntry(name.to_string()))
    }

    /// Blocks until `name` reaches `state` or `timeout` elapses. Returns
    /// whether the state was observed.
    pub fn wait_for_state(
        &self,
        name: &str,
        state: State,
        timeout: Duration,
    ) -> Result<bool, SupervisorError> {
        let deadline = Instant::now() + timeout;
        let mut registry = self.shared.lock()?;
        loop {
            let current = registry
                .entries
                .get(name)
                .map(|record| record.state)
                .ok_or_else(|| SupervisorError::UnknownEntry(name.to_string()))?;
            if current == state {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            registry = self.shared.changed.wait_timeout(registry, deadline - now)?.0;
        }
    }
}
