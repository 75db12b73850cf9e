//! Backend reaction to committed config changes.
//!
//! The engine watches the store, turns each commit into change records and
//! acts on them in commit order: enable flips become forced loads/unloads
//! in every attached window, settings changes reach hook-style backend
//! units, and every decision is mirrored to the connected peers.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::broadcast::{ContextMessage, CrossContextBroadcaster};
use crate::catalog::PluginCatalog;
use crate::config::{ConfigStore, Snapshot, WatchId};
use crate::detector::{ChangeDetector, ChangeRecord, ChangedField};
use crate::lifecycle::{LifecycleController, PendingTransition};
use crate::plugin_api::ContextKind;
use crate::restart::{AdviceOutcome, RestartAdvisor};

pub struct SyncEngine {
    store: Arc<ConfigStore>,
    catalog: Arc<PluginCatalog>,
    detector: ChangeDetector,
    backend: Arc<LifecycleController>,
    broadcaster: Arc<CrossContextBroadcaster>,
    advisor: Arc<RestartAdvisor>,
    runtime: Handle,
    watch_id: Mutex<Option<WatchId>>,
    transitions: Mutex<Vec<JoinHandle<()>>>,
    advice: Mutex<Vec<JoinHandle<AdviceOutcome>>>,
}

impl SyncEngine {
    /// Create the engine and start watching `store`.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(
        store: Arc<ConfigStore>,
        catalog: Arc<PluginCatalog>,
        backend: Arc<LifecycleController>,
        broadcaster: Arc<CrossContextBroadcaster>,
        advisor: Arc<RestartAdvisor>,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            detector: ChangeDetector::new(catalog.clone()),
            store: store.clone(),
            catalog,
            backend,
            broadcaster,
            advisor,
            runtime: Handle::current(),
            watch_id: Mutex::new(None),
            transitions: Mutex::new(Vec::new()),
            advice: Mutex::new(Vec::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&engine);
        let id = store.watch(move |new, old| {
            if let Some(engine) = weak.upgrade() {
                engine.on_commit(new, old);
            }
        });
        *engine.watch_id.lock() = Some(id);
        engine
    }

    pub fn detach(&self) {
        if let Some(id) = self.watch_id.lock().take() {
            self.store.unwatch(id);
        }
    }

    fn on_commit(&self, new: &Snapshot, old: &Snapshot) {
        let records = self.detector.diff_snapshots(old, new);
        if !records.is_empty() {
            log::debug!("{} plugin config change(s) committed", records.len());
        }
        for record in records {
            self.apply(&record);
        }
    }

    /// Act on one change record. Transitions are queued here, in commit
    /// order, and awaited in the background.
    pub fn apply(&self, record: &ChangeRecord) {
        let id = record.plugin_id.as_str();
        let Some(definition) = self.catalog.get(id) else {
            return;
        };
        let mut pending = Vec::new();

        match record.field {
            ChangedField::Enabled => {
                if definition.restart_required() && self.advisor.is_shutting_down() {
                    log::info!(
                        "Shutting down, '{}' will be {} on next launch",
                        id,
                        if record.is_enabled() { "enabled" } else { "disabled" }
                    );
                } else {
                    pending.extend(self.toggle(id, record.is_enabled()));
                    if definition.restart_required() {
                        let advisor = self.advisor.clone();
                        let id = id.to_string();
                        let handle = self.runtime.spawn(async move { advisor.advise(&id).await });
                        self.advice.lock().push(handle);
                    }
                }
            }
            ChangedField::Settings => {
                let hooks = definition
                    .unit(ContextKind::Backend)
                    .is_some_and(|unit| unit.is_hooks());
                if record.is_enabled() && hooks {
                    for window in self.backend.windows() {
                        pending.push(self.backend.enqueue_reconfigure(
                            id,
                            window,
                            record.new_value.clone(),
                        ));
                    }
                }
            }
        }

        self.broadcaster.broadcast(ContextMessage::ConfigChanged {
            id: id.to_string(),
            config: record.new_value.clone(),
        });

        if !pending.is_empty() {
            let handle = self.runtime.spawn(report(pending));
            self.transitions.lock().push(handle);
        }
    }

    fn toggle(&self, id: &str, enabled: bool) -> Vec<PendingTransition> {
        let message = if enabled {
            ContextMessage::PluginEnable { id: id.to_string() }
        } else {
            ContextMessage::PluginUnload { id: id.to_string() }
        };
        self.broadcaster.broadcast(message);

        self.backend
            .windows()
            .into_iter()
            .map(|window| {
                if enabled {
                    self.backend.enqueue_force_load(id, window)
                } else {
                    self.backend.enqueue_force_unload(id, window)
                }
            })
            .collect()
    }

    /// Wait for every transition queued so far.
    pub async fn settle(&self) {
        loop {
            let handles: Vec<_> = std::mem::take(&mut *self.transitions.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    /// Wait for every restart prompt raised so far to be answered.
    pub async fn settle_advice(&self) -> Vec<AdviceOutcome> {
        let handles: Vec<_> = std::mem::take(&mut *self.advice.lock());
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(outcome) = handle.await {
                outcomes.push(outcome);
            }
        }
        outcomes
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Failures of one plugin never hold up the others.
async fn report(pending: Vec<PendingTransition>) {
    let labels: Vec<String> = pending
        .iter()
        .map(|p| format!("'{}' in {}", p.plugin_id(), p.window()))
        .collect();
    let results = futures::future::join_all(pending.into_iter().map(PendingTransition::wait)).await;
    for (label, result) in labels.iter().zip(results) {
        match result {
            Ok(transition) => log::debug!("Transition of {} finished: {:?}", label, transition),
            Err(e) => log::error!("Transition of {} failed: {}", label, e),
        }
    }
}
