//! Hot-Reload Coordinator: watches the process's own configuration file,
//! debounces bursts of change events, classifies which configuration
//! region changed, and drives re-initialization of the other engines.

use crate::config::Store;
use crate::diff::SectionDiff;
use crate::notifier::Notifier;
use crate::supervise::SuperviseEngine;
use crate::watch::{FileWatchEngine, WatchEvent};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};
use tracing::info;

const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

const SERVICE_PREFIX: &str = "MonitorService";
const FILE_PREFIX: &str = "MonitorFile";
const COMMON_PREFIX: &str = "Common";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReloadEvent {
    ServiceCfgChange,
    FileCfgChange,
    CommonCfgChange,
}

fn classify(diffs: &[SectionDiff]) -> HashSet<ReloadEvent> {
    let mut kinds = HashSet::new();
    for d in diffs {
        if d.section.starts_with(SERVICE_PREFIX) {
            kinds.insert(ReloadEvent::ServiceCfgChange);
        } else if d.section.starts_with(FILE_PREFIX) {
            kinds.insert(ReloadEvent::FileCfgChange);
        } else if d.section.starts_with(COMMON_PREFIX) {
            kinds.insert(ReloadEvent::CommonCfgChange);
        }
    }
    kinds
}

pub struct HotReloadCoordinator;

impl HotReloadCoordinator {
    /// Spawn the debounce task and the coordinator task. Both observe
    /// `stop_tx` for cooperative shutdown.
    pub fn spawn(
        store: Arc<Store>,
        supervise: Arc<SuperviseEngine>,
        watch: Arc<FileWatchEngine>,
        notifier: Arc<Notifier>,
        stop_tx: broadcast::Sender<()>,
    ) -> crate::error::Result<()> {
        let mut initial = HashSet::new();
        initial.insert(store.path().to_path_buf());
        let (cfg_watch, cfg_events) = FileWatchEngine::start(initial)?;

        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        spawn_debouncer(cfg_watch.clone(), cfg_events, reload_tx, stop_tx.subscribe());
        spawn_coordinator(store, supervise, watch, notifier, cfg_watch, reload_rx, stop_tx);

        Ok(())
    }
}

fn spawn_debouncer(
    cfg_watch: Arc<FileWatchEngine>,
    mut events: mpsc::UnboundedReceiver<WatchEvent>,
    reload_tx: mpsc::UnboundedSender<HashSet<ReloadEvent>>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut pending: Option<Vec<SectionDiff>> = None;
        let deadline = Instant::now() + Duration::from_secs(3600);
        let timer = tokio::time::sleep_until(deadline);
        tokio::pin!(timer);
        let mut armed = false;

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    cfg_watch.stop();
                    break;
                }
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(WatchEvent::ConfigChanged { diffs, .. }) => {
                            pending = Some(diffs);
                            timer.as_mut().reset(Instant::now() + DEBOUNCE_WINDOW);
                            armed = true;
                        }
                        Some(WatchEvent::Raw { .. }) => {}
                        None => break,
                    }
                }
                () = &mut timer, if armed => {
                    armed = false;
                    if let Some(diffs) = pending.take() {
                        if !diffs.is_empty() {
                            let kinds = classify(&diffs);
                            if !kinds.is_empty() && reload_tx.send(kinds).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    });
}

#[allow(clippy::too_many_arguments)]
fn spawn_coordinator(
    store: Arc<Store>,
    supervise: Arc<SuperviseEngine>,
    watch: Arc<FileWatchEngine>,
    notifier: Arc<Notifier>,
    cfg_watch: Arc<FileWatchEngine>,
    mut reload_rx: mpsc::UnboundedReceiver<HashSet<ReloadEvent>>,
    stop_tx: broadcast::Sender<()>,
) {
    tokio::spawn(async move {
        let mut stop_rx = stop_tx.subscribe();
        let mut ticker = tokio::time::interval(store.current().refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    info!("hot-reload coordinator stopping");
                    watch.stop();
                    cfg_watch.stop();
                    break;
                }
                kinds = reload_rx.recv() => {
                    let Some(kinds) = kinds else { break };
                    handle_events(&store, &supervise, &watch, &notifier, &kinds).await;
                    // The refresh interval itself may have just changed.
                    ticker = tokio::time::interval(store.current().refresh_interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                }
                _ = ticker.tick() => {
                    let snap = store.current();
                    supervise.update(snap.specific_services.clone(), snap.partial_patterns.clone()).await;
                }
            }
        }
    });
}

async fn handle_events(
    store: &Arc<Store>,
    supervise: &Arc<SuperviseEngine>,
    watch: &Arc<FileWatchEngine>,
    notifier: &Arc<Notifier>,
    kinds: &HashSet<ReloadEvent>,
) {
    let snap = match store.reload() {
        Ok(snap) => snap,
        Err(_) => return,
    };

    if kinds.contains(&ReloadEvent::ServiceCfgChange) {
        info!("ServiceCfgChange");
        supervise.update(snap.specific_services.clone(), snap.partial_patterns.clone()).await;
        supervise.set_machine_name(snap.machine_name.clone());
    }

    if kinds.contains(&ReloadEvent::FileCfgChange) {
        info!("FileCfgChange");
        let files = crate::config::materialize_file_list(&snap);
        watch.update(files);
    }

    if kinds.contains(&ReloadEvent::CommonCfgChange) {
        info!("CommonCfgChange");
        notifier.update(snap.notifier.clone());
        supervise.set_machine_name(snap.machine_name.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::Operation;

    #[test]
    fn classify_maps_service_sections() {
        let diffs = vec![SectionDiff {
            operation: Operation::Modify,
            section: "MonitorServiceSpec".to_string(),
            old_text: String::new(),
            new_text: String::new(),
        }];
        assert_eq!(classify(&diffs), HashSet::from([ReloadEvent::ServiceCfgChange]));
    }

    #[test]
    fn classify_maps_file_and_common_sections() {
        let diffs = vec![
            SectionDiff { operation: Operation::Modify, section: "MonitorFileDir".to_string(), old_text: String::new(), new_text: String::new() },
            SectionDiff { operation: Operation::Modify, section: "CommonEmail".to_string(), old_text: String::new(), new_text: String::new() },
        ];
        assert_eq!(
            classify(&diffs),
            HashSet::from([ReloadEvent::FileCfgChange, ReloadEvent::CommonCfgChange])
        );
    }
}
