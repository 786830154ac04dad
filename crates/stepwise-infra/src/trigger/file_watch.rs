//! Filesystem trigger using the `notify` crate (through `notify-debouncer-mini`).
//!
//! Provides:
//! - `FileWatcherManager` -- registers debounced watchers that start workflow
//!   executions when matching files arrive
//! - `PathFilter` -- regex include/ignore matching for changed paths
//!
//! Each watcher runs one task that drains its debouncer's channel and, on a
//! timer, checks that the watched root still exists. A file launches once it
//! settles; later events for the same path inside the dedup window extend the
//! window instead of launching again. A watcher whose root
//! disappears or whose backend reports an error is deactivated and reported to
//! `on_watcher_error` subscribers; other watchers are unaffected.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
// Use notify types re-exported through notify-debouncer-mini so the watcher
// matches the version the debouncer was compiled against.
use notify_debouncer_mini::notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, DebouncedEventKind, Debouncer, new_debouncer};
use regex::Regex;
use serde::{Deserialize, Serialize};
use stepwise_core::event::{HookRegistry, Subscription};
use stepwise_core::trigger::WorkflowLauncher;
use stepwise_types::execution::TriggerSource;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur when registering a file watcher.
#[derive(Debug, thiserror::Error)]
pub enum FileWatchError {
    /// A file or ignore pattern is not a valid regex.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The path does not exist or could not be watched.
    #[error("failed to watch path '{path}': {reason}")]
    WatchPath { path: String, reason: String },

    /// Failed to create the filesystem watcher.
    #[error("watcher creation failed: {0}")]
    WatcherCreation(String),
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Options for [`FileWatcherManager::add_file_watcher`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    pub recursive: bool,
    /// Regex a changed path must match.
    pub file_pattern: Option<String>,
    /// Regex that excludes a changed path.
    pub ignore_pattern: Option<String>,
}

/// A registered watcher, as returned by `list_file_watchers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWatcherInfo {
    pub id: String,
    pub workflow_id: String,
    pub path: PathBuf,
    pub recursive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_pattern: Option<String>,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Reported to `on_watcher_error` subscribers when a watcher is deactivated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherError {
    pub watcher_id: String,
    pub workflow_id: String,
    pub path: PathBuf,
    pub error: String,
}

// ---------------------------------------------------------------------------
// Path filtering
// ---------------------------------------------------------------------------

/// Include/ignore regexes applied to the full path of a changed file.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Option<Regex>,
    ignore: Option<Regex>,
}

impl PathFilter {
    pub fn new(include: Option<&str>, ignore: Option<&str>) -> Result<Self, FileWatchError> {
        Ok(Self {
            include: include.map(compile).transpose()?,
            ignore: ignore.map(compile).transpose()?,
        })
    }

    /// Whether a path passes the include pattern and escapes the ignore pattern.
    pub fn matches(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        let included = self.include.as_ref().is_none_or(|re| re.is_match(&text));
        let ignored = self.ignore.as_ref().is_some_and(|re| re.is_match(&text));
        included && !ignored
    }

    /// A matching path that currently is a regular file. Directories and paths
    /// that no longer exist (removals) never qualify.
    pub async fn qualifies(&self, path: &Path) -> bool {
        if !self.matches(path) {
            return false;
        }
        tokio::fs::metadata(path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }
}

fn compile(pattern: &str) -> Result<Regex, FileWatchError> {
    Regex::new(pattern).map_err(|e| FileWatchError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct WatcherEntry {
    info: FileWatcherInfo,
    /// Dropped to stop the OS watch. `None` once deactivated.
    debouncer: Mutex<Option<Debouncer<RecommendedWatcher>>>,
    cancel: CancellationToken,
}

/// Shared state a watcher task needs to report back.
#[derive(Clone)]
struct Registry {
    watchers: Arc<DashMap<String, WatcherEntry>>,
    errors: HookRegistry<WatcherError>,
}

impl Registry {
    /// Mark a watcher inactive, stop its OS watch, and notify subscribers.
    fn deactivate(&self, watcher_id: &str, error: String) {
        let report = {
            let Some(mut entry) = self.watchers.get_mut(watcher_id) else {
                return;
            };
            if !entry.info.active {
                return;
            }
            entry.info.active = false;
            entry.info.last_error = Some(error.clone());
            entry
                .debouncer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            WatcherError {
                watcher_id: watcher_id.to_string(),
                workflow_id: entry.info.workflow_id.clone(),
                path: entry.info.path.clone(),
                error,
            }
        };

        tracing::warn!(
            watcher_id = %report.watcher_id,
            workflow_id = %report.workflow_id,
            path = %report.path.display(),
            error = %report.error,
            "file watcher deactivated"
        );
        self.errors.emit(&report);
    }
}

/// Owns every file watcher and the tasks that turn file events into executions.
pub struct FileWatcherManager {
    launcher: Arc<dyn WorkflowLauncher>,
    registry: Registry,
    debounce: Duration,
    dedup_window: Duration,
    health_check_interval: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl FileWatcherManager {
    pub fn new(
        launcher: Arc<dyn WorkflowLauncher>,
        debounce: Duration,
        health_check_interval: Duration,
    ) -> Self {
        Self {
            launcher,
            registry: Registry {
                watchers: Arc::new(DashMap::new()),
                errors: HookRegistry::new("watcher_error"),
            },
            debounce,
            dedup_window: debounce.saturating_mul(10),
            health_check_interval,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// How long after its last event a launched file stays suppressed.
    /// Never shorter than twice the debounce period.
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window.max(self.debounce.saturating_mul(2));
        self
    }

    /// Watch `path` and start `workflow_id` with `{"files": [path]}` for every
    /// qualifying file. Returns the watcher id.
    ///
    /// Invalid patterns and missing paths are rejected here.
    pub fn add_file_watcher(
        &self,
        workflow_id: &str,
        path: impl AsRef<Path>,
        options: WatchOptions,
    ) -> Result<String, FileWatchError> {
        let path = path.as_ref().to_path_buf();
        let filter = PathFilter::new(
            options.file_pattern.as_deref(),
            options.ignore_pattern.as_deref(),
        )?;
        if let Err(e) = std::fs::metadata(&path) {
            return Err(FileWatchError::WatchPath {
                path: path.display().to_string(),
                reason: e.to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel::<DebounceEventResult>();
        let mut debouncer = new_debouncer(self.debounce, move |result: DebounceEventResult| {
            // Receiver gone means the watcher was removed.
            let _ = tx.send(result);
        })
        .map_err(|e| FileWatchError::WatcherCreation(e.to_string()))?;

        let mode = if options.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        debouncer
            .watcher()
            .watch(&path, mode)
            .map_err(|e| FileWatchError::WatchPath {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let id = Uuid::now_v7().to_string();
        let cancel = self.shutdown.child_token();
        let info = FileWatcherInfo {
            id: id.clone(),
            workflow_id: workflow_id.to_string(),
            path: path.clone(),
            recursive: options.recursive,
            file_pattern: options.file_pattern,
            ignore_pattern: options.ignore_pattern,
            active: true,
            last_error: None,
        };
        self.registry.watchers.insert(
            id.clone(),
            WatcherEntry {
                info,
                debouncer: Mutex::new(Some(debouncer)),
                cancel: cancel.clone(),
            },
        );

        self.tracker.spawn(run_watcher(WatchTask {
            watcher_id: id.clone(),
            workflow_id: workflow_id.to_string(),
            root: path.clone(),
            filter,
            events: rx,
            launcher: Arc::clone(&self.launcher),
            registry: self.registry.clone(),
            dedup_window: self.dedup_window,
            health_check_interval: self.health_check_interval,
            cancel,
        }));

        tracing::info!(
            %workflow_id,
            watcher_id = %id,
            path = %path.display(),
            recursive = options.recursive,
            "file watcher added"
        );
        Ok(id)
    }

    /// Stop and forget a watcher. Returns whether it existed.
    pub fn remove_file_watcher(&self, watcher_id: &str) -> bool {
        match self.registry.watchers.remove(watcher_id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                tracing::info!(
                    %watcher_id,
                    workflow_id = %entry.info.workflow_id,
                    "file watcher removed"
                );
                true
            }
            None => false,
        }
    }

    /// Remove every watcher of a workflow. Returns how many were removed.
    pub fn remove_workflow_watchers(&self, workflow_id: &str) -> usize {
        let ids: Vec<String> = self
            .registry
            .watchers
            .iter()
            .filter(|e| e.info.workflow_id == workflow_id)
            .map(|e| e.key().clone())
            .collect();
        ids.iter().filter(|id| self.remove_file_watcher(id)).count()
    }

    /// Every watcher, sorted by workflow id then watcher id.
    pub fn list_file_watchers(&self) -> Vec<FileWatcherInfo> {
        let mut list: Vec<FileWatcherInfo> = self
            .registry
            .watchers
            .iter()
            .map(|e| e.info.clone())
            .collect();
        list.sort_by(|a, b| {
            a.workflow_id
                .cmp(&b.workflow_id)
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    /// Called whenever a watcher is deactivated.
    pub fn on_watcher_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&WatcherError) + Send + Sync + 'static,
    {
        self.registry.errors.subscribe(callback)
    }

    /// Stop every watcher and wait for their tasks to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.registry.watchers.clear();
        tracing::info!("file watchers stopped");
    }
}

impl Drop for FileWatcherManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Watcher task
// ---------------------------------------------------------------------------

struct WatchTask {
    watcher_id: String,
    workflow_id: String,
    root: PathBuf,
    filter: PathFilter,
    events: mpsc::UnboundedReceiver<DebounceEventResult>,
    launcher: Arc<dyn WorkflowLauncher>,
    registry: Registry,
    dedup_window: Duration,
    health_check_interval: Duration,
    cancel: CancellationToken,
}

async fn run_watcher(mut task: WatchTask) {
    let mut health =
        tokio::time::interval(task.health_check_interval.max(Duration::from_millis(10)));
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Launched files and when they last saw an event.
    let mut recent: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        tokio::select! {
            _ = task.cancel.cancelled() => break,
            _ = health.tick() => {
                if let Err(e) = check_root(&task.root).await {
                    task.registry.deactivate(
                        &task.watcher_id,
                        format!("watch root unavailable: {e}"),
                    );
                    break;
                }
            }
            batch = task.events.recv() => match batch {
                None => break,
                Some(Err(e)) => {
                    task.registry.deactivate(&task.watcher_id, format!("watch error: {e}"));
                    break;
                }
                Some(Ok(events)) => {
                    let now = Instant::now();
                    recent.retain(|_, at| now.duration_since(*at) < task.dedup_window);

                    // Path -> settled. Continuous events mean writes are still going on.
                    let mut paths: BTreeMap<PathBuf, bool> = BTreeMap::new();
                    for event in events {
                        let settled = matches!(event.kind, DebouncedEventKind::Any);
                        *paths.entry(event.path).or_insert(false) |= settled;
                    }

                    for (path, settled) in paths {
                        if let Some(at) = recent.get_mut(&path) {
                            *at = now;
                            continue;
                        }
                        if !settled || !task.filter.qualifies(&path).await {
                            continue;
                        }
                        recent.insert(path.clone(), now);
                        launch(&task, &path).await;
                    }
                }
            },
        }
    }
}

async fn check_root(root: &Path) -> std::io::Result<()> {
    let meta = tokio::fs::metadata(root).await?;
    if meta.is_dir() {
        tokio::fs::read_dir(root).await?;
    }
    Ok(())
}

async fn launch(task: &WatchTask, path: &Path) {
    let input = serde_json::json!({ "files": [path.display().to_string()] });
    match task
        .launcher
        .launch(&task.workflow_id, input, TriggerSource::FileWatch)
        .await
    {
        Ok(execution_id) => tracing::info!(
            workflow_id = %task.workflow_id,
            %execution_id,
            path = %path.display(),
            "file arrival started execution"
        ),
        Err(e) => tracing::warn!(
            workflow_id = %task.workflow_id,
            path = %path.display(),
            error = %e,
            "file watch launch failed"
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
