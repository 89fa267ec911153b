//! File-Watch Engine: a dynamic multiplexed subscription over a single OS
//! notification source, with atomic-save debouncing, periodic resubscribe
//! recovery, and section-level diffs for configuration-format files.

use crate::diff::{self, SectionDiff};
use crate::error::{Result, WatchError};
use dashmap::DashMap;
use ini::Ini;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const REFRESHER_INTERVAL: Duration = Duration::from_secs(60);

fn is_config_format(path: &Path) -> bool {
    path.extension().map(|e| e.eq_ignore_ascii_case("ini")).unwrap_or(false)
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// A configuration-format file changed; diffs of the changed sections.
    ConfigChanged { old_path: PathBuf, new_path: PathBuf, diffs: Vec<SectionDiff> },
    /// Any other raw filesystem event, passed through unprocessed.
    Raw { path: PathBuf, kind: RawKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Create,
    Write,
    Remove,
    Rename,
    Other,
}

struct WatchedFile {
    subscribed: bool,
    /// Cached parsed contents, kept only for configuration-format files so
    /// the next diff has an "old" side without re-reading from disk.
    cached: Option<Ini>,
}

/// Per-path rename/write collapsing state, shared by the event-loop thread.
struct PendingRename {
    old_name: Option<PathBuf>,
    is_rename: bool,
}

pub struct FileWatchEngine {
    files: Arc<DashMap<PathBuf, WatchedFile>>,
    watcher: std::sync::Mutex<RecommendedWatcher>,
    stop_tx: broadcast::Sender<()>,
    events_tx: mpsc::UnboundedSender<WatchEvent>,
}

impl FileWatchEngine {
    /// Establish the OS watcher, record every path in the subscription set,
    /// and spawn the event loop and periodic refresher. Returns the engine
    /// handle plus a receiver of [`WatchEvent`]s.
    pub fn start(initial_paths: HashSet<PathBuf>) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<WatchEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<notify::Result<Event>>();

        let watcher = notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        })
        .map_err(|e| WatchError::Init(e.to_string()))?;

        let (stop_tx, _) = broadcast::channel(1);

        let engine = Arc::new(Self {
            files: Arc::new(DashMap::new()),
            watcher: std::sync::Mutex::new(watcher),
            stop_tx,
            events_tx,
        });

        for path in initial_paths {
            engine.subscribe(&path);
        }

        engine.spawn_event_loop(raw_rx);
        engine.clone().spawn_refresher();

        Ok((engine, events_rx))
    }

    fn subscribe(&self, path: &Path) {
        let exists = path.exists();
        let subscribed = if exists {
            let mut guard = self.watcher.lock().expect("watcher mutex poisoned");
            match guard.watch(path, RecursiveMode::NonRecursive) {
                Ok(()) => true,
                Err(source) => {
                    let err = WatchError::Subscribe { path: path.to_path_buf(), source };
                    warn!(path = %path.display(), error = %err, "failed to subscribe");
                    false
                },
            }
        } else {
            false
        };

        let cached = if exists && is_config_format(path) {
            Ini::load_from_file(path).ok()
        } else {
            None
        };

        self.files.insert(path.to_path_buf(), WatchedFile { subscribed, cached });
    }

    fn unsubscribe(&self, path: &Path) {
        if let Some((_, record)) = self.files.remove(path) {
            if record.subscribed {
                let mut guard = self.watcher.lock().expect("watcher mutex poisoned");
                let _ = guard.unwatch(path);
            }
        }
    }

    /// `add = new_paths \ S`, `remove = S \ new_paths`.
    pub fn update(&self, new_paths: HashSet<PathBuf>) {
        let current: HashSet<PathBuf> = self.files.iter().map(|e| e.key().clone()).collect();

        for removed in current.difference(&new_paths) {
            self.unsubscribe(removed);
        }
        for added in new_paths.difference(&current) {
            self.subscribe(added);
        }
    }

    pub fn is_subscribed(&self, path: &Path) -> bool {
        self.files.get(path).map(|r| r.subscribed).unwrap_or(false)
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    fn spawn_event_loop(self: &Arc<Self>, raw_rx: std::sync::mpsc::Receiver<notify::Result<Event>>) {
        let engine = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        // notify's callback runs synchronously off a std channel; bridge it
        // onto a blocking thread rather than forcing the caller's watcher
        // implementation to be async-aware.
        let (bridge_tx, mut bridge_rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            while let Ok(res) = raw_rx.recv() {
                if bridge_tx.send(res).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut pending = PendingRename { old_name: None, is_rename: false };
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        info!("file watch engine event loop stopping");
                        break;
                    }
                    maybe_res = bridge_rx.recv() => {
                        let Some(res) = maybe_res else { break };
                        match res {
                            Ok(event) => engine.handle_event(event, &mut pending),
                            Err(_) => {
                                // Raw watcher errors are discarded (the
                                // underlying implementation can emit
                                // spurious ones around renames).
                            }
                        }
                    }
                }
            }
        });
    }

    fn handle_event(&self, event: Event, pending: &mut PendingRename) {
        let Some(path) = event.paths.first().cloned() else { return };

        match event.kind {
            EventKind::Create(_) => {
                self.emit(WatchEvent::Raw { path, kind: RawKind::Create });
            },
            EventKind::Remove(_) => {
                if let Some(mut rec) = self.files.get_mut(&path) {
                    rec.subscribed = false;
                }
                self.emit(WatchEvent::Raw { path, kind: RawKind::Remove });
            },
            EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
                pending.old_name = Some(path);
                pending.is_rename = true;
            },
            EventKind::Modify(notify::event::ModifyKind::Data(_)) | EventKind::Modify(notify::event::ModifyKind::Any) => {
                let old_name = if pending.is_rename {
                    pending.is_rename = false;
                    pending.old_name.clone().unwrap_or_else(|| path.clone())
                } else {
                    path.clone()
                };

                if is_config_format(&old_name) && is_config_format(&path) {
                    self.handle_config_write(old_name, path);
                } else {
                    self.emit(WatchEvent::Raw { path, kind: RawKind::Write });
                }
            },
            _ => {
                self.emit(WatchEvent::Raw { path, kind: RawKind::Other });
            },
        }
    }

    fn handle_config_write(&self, old_path: PathBuf, new_path: PathBuf) {
        let old_doc = self
            .files
            .get(&old_path)
            .and_then(|r| r.cached.clone())
            .unwrap_or_default();

        let new_doc = match Ini::load_from_file(&new_path) {
            Ok(doc) => doc,
            Err(_) => {
                // The file may be mid-write; treat as a no-op and keep the
                // previously cached contents.
                debug!(path = %new_path.display(), "config file unreadable during write event, skipping");
                return;
            },
        };

        let diffs = diff::diff(&old_doc, &new_doc);

        self.files.remove(&old_path);
        self.files.insert(new_path.clone(), WatchedFile { subscribed: true, cached: Some(new_doc) });

        self.emit(WatchEvent::ConfigChanged { old_path, new_path, diffs });
    }

    fn emit(&self, event: WatchEvent) {
        let _ = self.events_tx.send(event);
    }

    fn spawn_refresher(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESHER_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => self.run_refresh_tick(),
                }
            }
        });
    }

    fn run_refresh_tick(&self) {
        let paths: Vec<PathBuf> = self.files.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            let exists = path.exists();
            let was_subscribed = self.files.get(&path).map(|r| r.subscribed).unwrap_or(false);

            if exists && !was_subscribed {
                self.subscribe(&path);
            } else if !exists && was_subscribed {
                if let Some(mut rec) = self.files.get_mut(&path) {
                    rec.subscribed = false;
                }
                let mut guard = self.watcher.lock().expect("watcher mutex poisoned");
                let _ = guard.unwatch(&path);
            }
        }
    }
}
