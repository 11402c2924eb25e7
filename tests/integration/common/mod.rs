#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    env, fs,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use procward::{
    Descriptor, ProcessSpec, Supervisor, policy::BackoffPolicy, test_utils::env_lock,
};

pub struct HomeEnvGuard {
    previous: Option<String>,
    _lock: std::sync::MutexGuard<'static, ()>,
}

impl HomeEnvGuard {
    pub fn set(home: &Path) -> Self {
        let lock = env_lock();
        let previous = env::var("HOME").ok();
        unsafe {
            env::set_var("HOME", home);
        }
        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for HomeEnvGuard {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => unsafe {
                env::set_var("HOME", value);
            },
            None => unsafe {
                env::remove_var("HOME");
            },
        }
    }
}

/// Minimal inherited environment so child behaviour does not depend on the
/// test runner's shell.
pub fn base_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string()),
        ("INHERITED_MARKER".to_string(), "from-parent".to_string()),
    ])
}

pub fn supervisor(specs: Vec<ProcessSpec>) -> Supervisor {
    let descriptor = Descriptor::from_specs(specs).expect("valid descriptor");
    Supervisor::with_environment(descriptor, base_env())
}

/// A `/bin/sh -c` entry with a fast backoff schedule.
pub fn shell(name: &str, dir: &Path, script: &str) -> ProcessSpec {
    ProcessSpec::new(name, "/bin/sh", dir)
        .args(["-c", script])
        .backoff(BackoffPolicy {
            base: Duration::from_millis(50),
            max: Duration::from_millis(200),
            reset_after: Duration::from_secs(30),
        })
}

pub fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(25));
    }
}

pub fn wait_for_lines(path: &Path, expected: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path) {
            let lines: Vec<_> = content.lines().map(|line| line.to_string()).collect();
            if lines.len() >= expected {
                return lines;
            }
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for {expected} lines in {:?}", path);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

pub fn pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}
