//! Descriptor loading and the immutable [`ProcessSpec`] it produces.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::OnceLock,
    time::Duration,
};

use crate::{
    constants::{DEFAULT_DESCRIPTOR, DEFAULT_GRACE_PERIOD, FALLBACK_DESCRIPTOR},
    env,
    error::ConfigError,
    policy::{BackoffPolicy, RestartPolicy},
};

/// How to launch one managed entry. Constructed once and never mutated.
#[derive(Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Unique name within a supervisor.
    pub name: String,
    /// Program to execute, as written in the descriptor.
    pub executable: String,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// Working directory of the child.
    pub cwd: PathBuf,
    /// Variables overlaid on the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Restart rule applied to unexpected exits.
    pub restart_policy: RestartPolicy,
    /// Restart ceiling; `None` is unbounded.
    pub max_restarts: Option<u32>,
    /// Delay schedule between failed runs.
    pub backoff: BackoffPolicy,
    /// Time between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    /// Restart when files under `cwd` change.
    pub watch: bool,
    /// Extra path components ignored by the watcher.
    pub watch_ignore: Vec<String>,
    /// Append the child's stdout to this file instead of inheriting it.
    pub stdout_file: Option<PathBuf>,
    /// Append the child's stderr to this file instead of inheriting it.
    pub stderr_file: Option<PathBuf>,
}

impl ProcessSpec {
    /// Creates a spec with default policy, backoff, and grace period.
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<String>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
            restart_policy: RestartPolicy::default(),
            max_restarts: None,
            backoff: BackoffPolicy::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
            watch: false,
            watch_ignore: Vec::new(),
            stdout_file: None,
            stderr_file: None,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets one environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the restart policy.
    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    /// Sets the restart ceiling.
    pub fn max_restarts(mut self, ceiling: u32) -> Self {
        self.max_restarts = Some(ceiling);
        self
    }

    /// Sets the backoff schedule.
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the grace period used by restarts and shutdown.
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Enables restart-on-change for the working directory.
    pub fn watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    /// Forwards stdout and stderr to files.
    pub fn output_files(mut self, stdout: Option<PathBuf>, stderr: Option<PathBuf>) -> Self {
        self.stdout_file = stdout;
        self.stderr_file = stderr;
        self
    }

    /// Checks the invariants the supervisor relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            entry: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".into()));
        }
        if self.executable.trim().is_empty() {
            return Err(invalid("executable must not be empty".into()));
        }
        if self.cwd.as_os_str().is_empty() {
            return Err(invalid("working directory must not be empty".into()));
        }
        for (key, value) in &self.env {
            env::validate_key(key).map_err(&invalid)?;
            env::validate_value(key, value).map_err(&invalid)?;
        }
        if self.backoff.base > self.backoff.max {
            return Err(invalid(format!(
                "backoff base {:?} exceeds backoff max {:?}",
                self.backoff.base, self.backoff.max
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSpec")
            .field("name", &self.name)
            .field("executable", &self.executable)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("env_keys", &env::keys(&self.env))
            .field("restart_policy", &self.restart_policy)
            .field("max_restarts", &self.max_restarts)
            .field("backoff", &self.backoff)
            .field("grace_period", &self.grace_period)
            .field("watch", &self.watch)
            .finish_non_exhaustive()
    }
}

/// The full set of entries declared by a descriptor.
#[derive(Debug, Clone, Default)]
pub struct Descriptor {
    /// File the descriptor was read from, when loaded from disk.
    pub path: Option<PathBuf>,
    entries: Vec<ProcessSpec>,
}

impl Descriptor {
    /// Builds a descriptor from already constructed specs.
    pub fn from_specs(specs: Vec<ProcessSpec>) -> Result<Self, ConfigError> {
        let mut seen = std::collections::BTreeSet::new();
        for spec in &specs {
            spec.validate()?;
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateEntry(spec.name.clone()));
            }
        }
        Ok(Self {
            path: None,
            entries: specs,
        })
    }

    /// Entries in declaration order.
    pub fn entries(&self) -> &[ProcessSpec] {
        &self.entries
    }

    /// Looks up an entry by name.
    pub fn get(&self, name: &str) -> Option<&ProcessSpec> {
        self.entries.iter().find(|spec| spec.name == name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDescriptor {
    #[allow(dead_code)]
    version: Option<String>,
    apps: RawApps,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawApps {
    List(Vec<RawApp>),
    Map(BTreeMap<String, RawApp>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawArgs {
    Line(String),
    List(Vec<String>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBackoff {
    base: Option<serde_yaml::Value>,
    max: Option<serde_yaml::Value>,
    reset_after: Option<serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawApp {
    name: Option<String>,
    interpreter: Option<String>,
    script: String,
    args: Option<RawArgs>,
    cwd: Option<String>,
    env: Option<BTreeMap<String, serde_yaml::Value>>,
    env_file: Option<String>,
    restart_policy: Option<String>,
    autorestart: Option<bool>,
    #[serde(default)]
    watch: bool,
    #[serde(alias = "ignore_watch")]
    watch_ignore: Option<Vec<String>>,
    max_restarts: Option<u32>,
    backoff: Option<RawBackoff>,
    grace_period: Option<serde_yaml::Value>,
    out_file: Option<String>,
    error_file: Option<String>,
}

/// Parses a duration such as `250ms`, `10s`, `5m`, `2h`, or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let trimmed = raw.trim();
    let invalid = || ConfigError::InvalidDuration(raw.to_string());
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let (digits, unit) = match trimmed.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, "s"),
    };
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs).ok_or_else(invalid),
        "h" => value.checked_mul(3600).map(Duration::from_secs).ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

/// Splits an argument line on whitespace, honouring single and double quotes.
pub fn split_args(line: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => return Err("trailing backslash in arguments".into()),
            },
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_token = true;
            }
            (None, '\\') => match chars.next() {
                Some(escaped) => {
                    current.push(escaped);
                    in_token = true;
                }
                None => return Err("trailing backslash in arguments".into()),
            },
            (None, c) if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if let Some(q) = quote {
        return Err(format!("unterminated {q} quote in arguments"));
    }
    if in_token {
        args.push(current);
    }
    Ok(args)
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("variable pattern is valid")
    })
}

/// Expands `${VAR}` and `$VAR` references from `vars`.
pub fn expand_env_vars(
    input: &str,
    vars: &BTreeMap<String, String>,
) -> Result<String, ConfigError> {
    let pattern = variable_pattern();

    for caps in pattern.captures_iter(input) {
        let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        if !vars.contains_key(name) {
            return Err(ConfigError::MissingVariable(name.to_string()));
        }
    }

    let expanded = pattern.replace_all(input, |caps: &regex::Captures| {
        let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        vars.get(name).cloned().unwrap_or_default()
    });
    Ok(expanded.into_owned())
}

/// Expands variable references inside the string scalars of a parsed
/// document. Substituted values are never re-read as YAML.
fn expand_scalars(
    value: &mut serde_yaml::Value,
    vars: &BTreeMap<String, String>,
) -> Result<(), ConfigError> {
    match value {
        serde_yaml::Value::String(text) => *text = expand_env_vars(text, vars)?,
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                expand_scalars(item, vars)?;
            }
        }
        serde_yaml::Value::Mapping(mapping) => {
            for (_, item) in mapping.iter_mut() {
                expand_scalars(item, vars)?;
            }
        }
        serde_yaml::Value::Tagged(tagged) => expand_scalars(&mut tagged.value, vars)?,
        _ => {}
    }
    Ok(())
}

fn scalar_to_string(
    entry: &str,
    field: &str,
    value: &serde_yaml::Value,
) -> Result<String, ConfigError> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        _ => Err(ConfigError::Invalid {
            entry: entry.to_string(),
            reason: format!("'{field}' must be a string, number, or boolean"),
        }),
    }
}

fn duration_field(
    entry: &str,
    field: &str,
    value: Option<&serde_yaml::Value>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(value) => parse_duration(&scalar_to_string(entry, field, value)?),
        None => Ok(default),
    }
}

fn resolve_against(base: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl RawApp {
    fn into_spec(self, name: String, base_dir: &Path) -> Result<ProcessSpec, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            entry: name.clone(),
            reason,
        };

        let mut tail = match self.args {
            None => Vec::new(),
            Some(RawArgs::List(list)) => list,
            Some(RawArgs::Line(line)) => split_args(&line).map_err(&invalid)?,
        };

        let (executable, args) = match self.interpreter {
            Some(interpreter) => {
                let mut args = vec![self.script];
                args.append(&mut tail);
                (interpreter, args)
            }
            None => (self.script, tail),
        };

        let cwd = self
            .cwd
            .as_deref()
            .map_or_else(|| base_dir.to_path_buf(), |cwd| resolve_against(base_dir, cwd));

        let mut vars = BTreeMap::new();
        if let Some(file) = &self.env_file {
            let path = resolve_against(&cwd, file);
            let content = fs::read_to_string(&path).map_err(|source| ConfigError::EnvFile {
                entry: name.clone(),
                path: path.clone(),
                source,
            })?;
            vars = env::parse_env_file(&content, &name);
        }
        for (key, value) in self.env.unwrap_or_default() {
            let value = scalar_to_string(&name, &key, &value)?;
            vars.insert(key, value);
        }

        let restart_policy = match (self.restart_policy.as_deref(), self.autorestart) {
            (Some(raw), _) => RestartPolicy::from_str(raw.trim())
                .map_err(|_| invalid(format!("unknown restart policy '{raw}'")))?,
            (None, Some(false)) => RestartPolicy::Never,
            (None, _) => RestartPolicy::default(),
        };

        let defaults = BackoffPolicy::default();
        let raw_backoff = self.backoff.unwrap_or_default();
        let backoff = BackoffPolicy {
            base: duration_field(&name, "backoff.base", raw_backoff.base.as_ref(), defaults.base)?,
            max: duration_field(&name, "backoff.max", raw_backoff.max.as_ref(), defaults.max)?,
            reset_after: duration_field(
                &name,
                "backoff.reset_after",
                raw_backoff.reset_after.as_ref(),
                defaults.reset_after,
            )?,
        };

        let spec = ProcessSpec {
            executable,
            args,
            env: vars,
            restart_policy,
            max_restarts: self.max_restarts,
            backoff,
            grace_period: duration_field(
                &name,
                "grace_period",
                self.grace_period.as_ref(),
                DEFAULT_GRACE_PERIOD,
            )?,
            watch: self.watch,
            watch_ignore: self.watch_ignore.unwrap_or_default(),
            stdout_file: self.out_file.as_deref().map(|f| resolve_against(&cwd, f)),
            stderr_file: self.error_file.as_deref().map(|f| resolve_against(&cwd, f)),
            cwd,
            name,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Parses descriptor text. Relative paths resolve against `base_dir` and
/// variable references expand from `vars`.
pub fn parse_descriptor(
    content: &str,
    base_dir: &Path,
    vars: &BTreeMap<String, String>,
) -> Result<Descriptor, ConfigError> {
    let mut document: serde_yaml::Value = serde_yaml::from_str(content)?;
    expand_scalars(&mut document, vars)?;
    let raw: RawDescriptor = serde_yaml::from_value(document)?;

    let named: Vec<(String, RawApp)> = match raw.apps {
        RawApps::List(apps) => apps
            .into_iter()
            .enumerate()
            .map(|(idx, mut app)| match app.name.take() {
                Some(name) => Ok((name, app)),
                None => Err(ConfigError::Invalid {
                    entry: format!("apps[{idx}]"),
                    reason: "missing 'name'".into(),
                }),
            })
            .collect::<Result<_, _>>()?,
        RawApps::Map(apps) => apps
            .into_iter()
            .map(|(key, mut app)| match app.name.take() {
                Some(name) if name != key => Err(ConfigError::Invalid {
                    entry: key,
                    reason: format!("'name' field '{name}' disagrees with mapping key"),
                }),
                _ => Ok((key, app)),
            })
            .collect::<Result<_, _>>()?,
    };

    let specs = named
        .into_iter()
        .map(|(name, app)| app.into_spec(name, base_dir))
        .collect::<Result<Vec<_>, _>>()?;

    Descriptor::from_specs(specs)
}

/// Resolves the descriptor path, falling back to the default names.
pub fn descriptor_path(path: Option<&str>) -> PathBuf {
    match path {
        Some(path) => PathBuf::from(path),
        None if Path::new(DEFAULT_DESCRIPTOR).exists() => PathBuf::from(DEFAULT_DESCRIPTOR),
        None => PathBuf::from(FALLBACK_DESCRIPTOR),
    }
}

/// Loads and validates a descriptor from disk, expanding variables from the
/// supervisor's environment.
pub fn load_descriptor(path: Option<&str>) -> Result<Descriptor, ConfigError> {
    let path = descriptor_path(path);
    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?
            .join(path)
    };

    let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;

    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));

    let mut descriptor = parse_descriptor(&content, &base_dir, &env::inherited())?;
    descriptor.path = Some(path);
    Ok(descriptor)
}
