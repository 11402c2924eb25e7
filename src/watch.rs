//! Restart-on-change support for entries with `watch` enabled.
use std::path::{Path, PathBuf};

use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher, event::ModifyKind,
};
use tracing::{debug, info, warn};

use crate::constants::WATCH_ALWAYS_IGNORED;

/// Filters raw filesystem events down to source changes under a root.
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    root: PathBuf,
    ignored_components: Vec<String>,
    ignored_files: Vec<PathBuf>,
}

impl ChangeFilter {
    /// Creates a filter for `root`. `ignored_files` are exact paths such as
    /// the entry's own output files.
    pub fn new(root: &Path, extra_ignored: &[String], ignored_files: Vec<PathBuf>) -> Self {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let ignored_components = WATCH_ALWAYS_IGNORED
            .iter()
            .map(|s| s.to_string())
            .chain(extra_ignored.iter().cloned())
            .collect();
        let ignored_files = ignored_files
            .into_iter()
            .map(|path| canonical_parent(&path))
            .collect();
        Self {
            root,
            ignored_components,
            ignored_files,
        }
    }

    /// Whether `path` counts as a source change.
    pub fn matches_path(&self, path: &Path) -> bool {
        let canonical = canonical_parent(path);
        if self.ignored_files.iter().any(|ignored| ignored == &canonical) {
            return false;
        }

        let relative = canonical.strip_prefix(&self.root).unwrap_or(&canonical);
        !relative.components().any(|component| {
            let name = component.as_os_str().to_string_lossy();
            self.ignored_components.iter().any(|ignored| *ignored == name)
        })
    }

    /// First path of `event` that counts as a source change.
    pub fn relevant_path<'a>(&self, event: &'a Event) -> Option<&'a Path> {
        let interesting = match event.kind {
            EventKind::Modify(ModifyKind::Metadata(_)) => false,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => true,
            _ => false,
        };
        if !interesting {
            return None;
        }
        event
            .paths
            .iter()
            .map(PathBuf::as_path)
            .find(|path| self.matches_path(path))
    }
}

/// Canonicalizes the parent directory and re-attaches the file name, so
/// paths of deleted files still compare equal to their live form.
fn canonical_parent(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// Recursive watcher over an entry's working directory. Dropping it stops
/// the watch.
pub struct SourceWatcher {
    _watcher: RecommendedWatcher,
}

impl SourceWatcher {
    /// Starts watching `filter`'s root and calls `on_change` for each
    /// relevant event.
    pub fn start<F>(entry: &str, filter: ChangeFilter, on_change: F) -> notify::Result<Self>
    where
        F: Fn(&Path) + Send + 'static,
    {
        let root = filter.root.clone();
        let entry_name = entry.to_string();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(path) = filter.relevant_path(&event) {
                        debug!("Change detected for '{entry_name}': {}", path.display());
                        on_change(path);
                    }
                }
                Err(err) => warn!("File watcher error for '{entry_name}': {err}"),
            },
            Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        info!("Watching {} for changes to '{entry}'", root.display());
        Ok(Self { _watcher: watcher })
    }
}
