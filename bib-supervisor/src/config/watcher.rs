//! Configuration hot-add watcher.
//!
//! Watches a directory for `bib_*.xml` files. Raw filesystem events are
//! debounced per path; after a path has been quiet for the debounce window
//! the file's final state decides what happened: present and unknown is an
//! add, present and known is a change, absent is a removal. The watcher
//! never trusts the event stream to be complete — an optional initial scan
//! emits synthetic events for files that existed before the watch began.
//!
//! One task owns the watcher state; filesystem callbacks only enqueue paths
//! onto its input channel, and everything downstream (load, registry
//! update, event fan-out, workflow triggers) is dispatched serially by that
//! task.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::registry::BibRegistry;
use crate::config::{xml, ConfigError};

/// Startup parameters of the watcher (see the environment variables in the
/// supervisor settings).
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    /// Directory scanned for `bib_*.xml` files.
    pub watch_directory: PathBuf,
    /// Quiet window before a changed path is processed.
    pub debounce_delay: Duration,
    /// Trigger a workflow for every (UUT, port) of a loaded BIB.
    pub auto_execute_on_discovery: bool,
    /// Emit synthetic add events for files present at startup.
    pub perform_initial_discovery: bool,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            watch_directory: PathBuf::from("configuration"),
            debounce_delay: Duration::from_millis(500),
            auto_execute_on_discovery: false,
            perform_initial_discovery: true,
        }
    }
}

/// What happened to a configuration file, after debouncing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    /// A new BIB was discovered and registered.
    Loaded {
        /// Id of the registered BIB.
        bib_id: String,
        /// File it came from.
        path: PathBuf,
    },
    /// A known BIB file changed and was re-registered.
    Reloaded {
        /// Id of the re-registered BIB.
        bib_id: String,
        /// File it came from.
        path: PathBuf,
    },
    /// A known BIB file disappeared and the BIB was evicted.
    Removed {
        /// Id of the evicted BIB.
        bib_id: String,
        /// File that disappeared.
        path: PathBuf,
    },
    /// A file failed to load; discovery of other files continues.
    Invalid {
        /// File that failed.
        path: PathBuf,
        /// Load error rendered for logs.
        reason: String,
    },
}

/// Request to run one (BIB, UUT, port) workflow, emitted on auto-execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowTrigger {
    /// BIB to run against.
    pub bib_id: String,
    /// UUT within the BIB.
    pub uut_id: String,
    /// Port number within the UUT.
    pub port_number: u32,
}

/// Handle to a running watcher.
pub struct ConfigWatcher {
    events: broadcast::Sender<ConfigEvent>,
    task: tokio::task::JoinHandle<()>,
    _fs_watcher: Option<RecommendedWatcher>,
}

impl ConfigWatcher {
    /// Starts watching the configured directory.
    pub fn spawn(
        settings: WatcherSettings,
        registry: Arc<BibRegistry>,
        triggers: Option<mpsc::UnboundedSender<WorkflowTrigger>>,
        shutdown: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let mut fs_watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                match result {
                    Ok(event) => {
                        for path in event.paths {
                            let _ = raw_tx.send(path);
                        }
                    }
                    Err(e) => tracing::warn!("filesystem watch error: {e}"),
                }
            })?;
        fs_watcher.watch(&settings.watch_directory, RecursiveMode::NonRecursive)?;
        tracing::info!(directory = %settings.watch_directory.display(), "watching for BIB files");

        let mut watcher = Self::spawn_with_source(settings, registry, raw_rx, triggers, shutdown);
        watcher._fs_watcher = Some(fs_watcher);
        Ok(watcher)
    }

    /// Starts the owner task over an externally fed path source.
    ///
    /// Used by tests and by hosts that bring their own change feed; the
    /// debounce and classification behavior is identical to [`Self::spawn`].
    pub fn spawn_with_source(
        settings: WatcherSettings,
        registry: Arc<BibRegistry>,
        raw_rx: mpsc::UnboundedReceiver<PathBuf>,
        triggers: Option<mpsc::UnboundedSender<WorkflowTrigger>>,
        shutdown: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let task = tokio::spawn(run_loop(
            settings,
            registry,
            raw_rx,
            events.clone(),
            triggers,
            shutdown,
        ));
        Self {
            events,
            task,
            _fs_watcher: None,
        }
    }

    /// Subscribes to configuration events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }

    /// Waits for the owner task to finish (after shutdown is cancelled or
    /// the path source closes).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

fn is_bib_file(path: &Path) -> bool {
    let starts = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("bib_"));
    starts && path.extension().is_some_and(|e| e == "xml")
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

async fn run_loop(
    settings: WatcherSettings,
    registry: Arc<BibRegistry>,
    mut raw_rx: mpsc::UnboundedReceiver<PathBuf>,
    events: broadcast::Sender<ConfigEvent>,
    triggers: Option<mpsc::UnboundedSender<WorkflowTrigger>>,
    shutdown: CancellationToken,
) {
    // path → debounce deadline
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
    // path → bib id registered from it
    let mut known: HashMap<PathBuf, String> = HashMap::new();
    let mut source_closed = false;

    if settings.perform_initial_discovery {
        match std::fs::read_dir(&settings.watch_directory) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if is_bib_file(&path) {
                        tracing::debug!(path = %path.display(), "initial discovery");
                        pending.insert(path, Instant::now());
                    }
                }
            }
            Err(e) => tracing::warn!(
                directory = %settings.watch_directory.display(),
                "initial scan failed: {e}"
            ),
        }
    }

    loop {
        if source_closed && pending.is_empty() {
            break;
        }
        let next_deadline = pending.values().min().copied();

        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = raw_rx.recv(), if !source_closed => {
                match received {
                    Some(path) => {
                        if is_bib_file(&path) {
                            pending.insert(path, Instant::now() + settings.debounce_delay);
                        }
                    }
                    None => source_closed = true,
                }
            }
            _ = sleep_until_opt(next_deadline) => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    pending.remove(&path);
                    settle(
                        &path,
                        &registry,
                        &mut known,
                        &events,
                        triggers.as_ref(),
                        settings.auto_execute_on_discovery,
                    );
                }
            }
        }
    }
    tracing::debug!("config watcher stopped");
}

/// Processes one path after its debounce window closed.
fn settle(
    path: &Path,
    registry: &BibRegistry,
    known: &mut HashMap<PathBuf, String>,
    events: &broadcast::Sender<ConfigEvent>,
    triggers: Option<&mpsc::UnboundedSender<WorkflowTrigger>>,
    auto_execute: bool,
) {
    if path.exists() {
        let bib = match xml::load_file(path) {
            Ok(bib) => bib,
            Err(e) => {
                tracing::warn!(path = %path.display(), "configuration rejected: {e}");
                let _ = events.send(ConfigEvent::Invalid {
                    path: path.to_owned(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        let bib_id = bib.id.clone();
        let uut_ports: Vec<(String, u32)> = bib
            .uuts
            .iter()
            .flat_map(|uut| uut.ports.iter().map(|port| (uut.id.clone(), port.number)))
            .collect();

        let was_known = known.contains_key(path);
        if let Some(previous) = known.insert(path.to_owned(), bib_id.clone()) {
            // The file now declares a different BIB; the old id is gone.
            if previous != bib_id {
                registry.evict(&previous);
            }
        }
        registry.insert(bib);

        let event = if was_known {
            ConfigEvent::Reloaded {
                bib_id: bib_id.clone(),
                path: path.to_owned(),
            }
        } else {
            ConfigEvent::Loaded {
                bib_id: bib_id.clone(),
                path: path.to_owned(),
            }
        };
        let _ = events.send(event);

        if auto_execute {
            if let Some(triggers) = triggers {
                for (uut_id, port_number) in uut_ports {
                    let _ = triggers.send(WorkflowTrigger {
                        bib_id: bib_id.clone(),
                        uut_id,
                        port_number,
                    });
                }
            }
        }
    } else if let Some(bib_id) = known.remove(path) {
        registry.evict(&bib_id);
        let _ = events.send(ConfigEvent::Removed {
            bib_id,
            path: path.to_owned(),
        });
    }
}
