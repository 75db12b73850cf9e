//! Persisted configuration tree with change notification.
//!
//! The store keeps the whole document as one immutable snapshot. A commit
//! builds the next snapshot, validates it, persists it and only then swaps
//! it in, so readers never see a half-written object and a rejected write
//! leaves both memory and disk untouched.

pub mod defaults;
pub mod path;
pub mod persist;
mod schema;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::merge::{deep_equal, deep_merge, merge_into};

pub use defaults::{ShellDefaults, WindowPosition, WindowSize};
pub use path::ConfigPath;
pub use persist::{MemoryBackend, PersistBackend, TomlFileBackend, WriteQueue, DEBOUNCE_WINDOW};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("invalid value for '{path}': {reason}")]
    Validation { path: String, reason: String },

    #[error("failed to persist configuration: {0}")]
    Persist(String),

    #[error("configuration I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to parse configuration: {0}")]
    Deserialize(#[from] toml::de::Error),
}

impl ConfigError {
    /// Rejected before anything was written.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidPath { .. } | Self::Validation { .. })
    }
}

/// An immutable view of the whole persisted document.
pub type Snapshot = Arc<Value>;

type Watcher = Arc<dyn Fn(&Snapshot, &Snapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// Keys written through the debounce queue by default.
pub const DEBOUNCED_KEYS: [&str; 2] = ["window-size", "window-position"];

pub struct ConfigStore {
    backend: Box<dyn PersistBackend>,
    defaults: Value,
    tree: RwLock<Snapshot>,
    commit_lock: Mutex<()>,
    watchers: RwLock<Vec<(WatchId, Watcher)>>,
    next_watch_id: AtomicU64,
    notifications: Mutex<VecDeque<(Snapshot, Snapshot)>>,
    delivering: AtomicBool,
    write_queue: Mutex<WriteQueue>,
    debounced: HashSet<String>,
}

impl ConfigStore {
    /// Open the store over `backend`, falling back to an empty document
    /// when nothing is stored or the stored document cannot be read.
    pub fn open(backend: impl PersistBackend + 'static, defaults: Value) -> Self {
        let stored = match backend.load() {
            Ok(Some(tree)) if tree.is_object() => tree,
            Ok(Some(_)) => {
                log::warn!("Stored configuration is not a table, starting from defaults");
                empty_tree()
            }
            Ok(None) => {
                log::info!("No stored configuration, starting from defaults");
                empty_tree()
            }
            Err(e) => {
                log::error!("Failed to load configuration, starting from defaults: {}", e);
                empty_tree()
            }
        };

        Self {
            backend: Box::new(backend),
            defaults,
            tree: RwLock::new(Arc::new(stored)),
            commit_lock: Mutex::new(()),
            watchers: RwLock::new(Vec::new()),
            next_watch_id: AtomicU64::new(1),
            notifications: Mutex::new(VecDeque::new()),
            delivering: AtomicBool::new(false),
            write_queue: Mutex::new(WriteQueue::default()),
            debounced: DEBOUNCED_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }

    /// Current value at `path`: the stored value merged over the default,
    /// or `None` when neither exists.
    pub fn get(&self, path: &str) -> Result<Option<Value>, ConfigError> {
        let path = ConfigPath::parse(path)?;
        let tree = self.snapshot();
        Ok(self.resolve(&path, &tree))
    }

    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ConfigError> {
        let Some(value) = self.get(path)? else {
            return Ok(None);
        };
        serde_json::from_value(value).map(Some).map_err(|e| ConfigError::Validation {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    /// The stored document, without defaults.
    pub fn snapshot(&self) -> Snapshot {
        self.tree.read().clone()
    }

    pub fn defaults(&self) -> &Value {
        &self.defaults
    }

    /// Replace the value at `path`.
    pub fn set(&self, path: &str, value: Value) -> Result<(), ConfigError> {
        let path = ConfigPath::parse(path)?;
        self.commit(&path, |tree| path.assign(tree, value))?;
        self.discard_staged(&path);
        Ok(())
    }

    /// Merge `partial` into the table at `path`, keeping keys it does not
    /// mention.
    pub fn set_partial(&self, path: &str, partial: Value) -> Result<(), ConfigError> {
        let path = ConfigPath::parse(path)?;
        if !partial.is_object() {
            return Err(ConfigError::Validation {
                path: path.to_string(),
                reason: "partial update must be a table".to_string(),
            });
        }
        self.commit(&path, |tree| {
            let slot = path.slot_mut(tree)?;
            if !slot.is_object() {
                *slot = empty_tree();
            }
            merge_into(slot, &partial);
            Ok(())
        })?;
        self.discard_staged(&path);
        Ok(())
    }

    /// A direct write supersedes anything still staged for the same keys.
    fn discard_staged(&self, path: &ConfigPath) {
        let dropped = self.write_queue.lock().discard_overlapping(path);
        if dropped > 0 {
            log::debug!("Write to '{}' superseded {} staged write(s)", path, dropped);
        }
    }

    /// Stage a write for a debounced key, or write through immediately for
    /// any other key.
    ///
    /// Staged writes are validated up front so a bad value fails here, not
    /// at flush time.
    pub fn set_debounced(&self, path: &str, value: Value) -> Result<(), ConfigError> {
        let parsed = ConfigPath::parse(path)?;
        if !self.debounced.contains(parsed.first()) {
            return self.set(path, value);
        }

        let mut probe = (*self.snapshot()).clone();
        parsed.assign(&mut probe, value.clone())?;
        schema::validate_write(&parsed, &probe)?;

        self.write_queue.lock().stage(parsed, value, Instant::now());
        Ok(())
    }

    /// Commit staged writes whose debounce window has elapsed.
    pub fn flush_due(&self) -> Result<usize, ConfigError> {
        self.flush_due_at(Instant::now())
    }

    pub fn flush_due_at(&self, now: Instant) -> Result<usize, ConfigError> {
        let due = self.write_queue.lock().take_due(now);
        self.commit_staged(due)
    }

    /// Commit every staged write regardless of its deadline. Must run
    /// before the process goes away.
    pub fn flush(&self) -> Result<usize, ConfigError> {
        let all = self.write_queue.lock().take_all();
        self.commit_staged(all)
    }

    pub fn pending_writes(&self) -> usize {
        self.write_queue.lock().len()
    }

    fn commit_staged(&self, writes: Vec<(ConfigPath, Value)>) -> Result<usize, ConfigError> {
        let count = writes.len();
        let mut first_error = None;
        for (path, value) in writes {
            if let Err(e) = self.commit(&path, |tree| path.assign(tree, value)) {
                log::error!("Failed to flush staged write to '{}': {}", path, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Register `callback(new, old)`, run once per committed change, after
    /// persistence, in registration order.
    pub fn watch<F>(&self, callback: F) -> WatchId
    where
        F: Fn(&Snapshot, &Snapshot) + Send + Sync + 'static,
    {
        let id = WatchId(self.next_watch_id.fetch_add(1, Ordering::Relaxed));
        self.watchers.write().push((id, Arc::new(callback)));
        id
    }

    pub fn unwatch(&self, id: WatchId) -> bool {
        let mut watchers = self.watchers.write();
        let before = watchers.len();
        watchers.retain(|(watch_id, _)| *watch_id != id);
        watchers.len() != before
    }

    fn resolve(&self, path: &ConfigPath, tree: &Value) -> Option<Value> {
        match (path.lookup(tree), path.lookup(&self.defaults)) {
            (Some(stored), Some(default)) => Some(deep_merge(default, stored)),
            (Some(stored), None) => Some(stored.clone()),
            (None, default) => default.cloned(),
        }
    }

    fn commit<F>(&self, path: &ConfigPath, mutate: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Value) -> Result<(), ConfigError>,
    {
        {
            let _commit = self.commit_lock.lock();
            let old = self.snapshot();
            let mut next = (*old).clone();
            mutate(&mut next)?;
            schema::validate_write(path, &next)?;

            if deep_equal(&next, &old) {
                log::debug!("Write to '{}' left the configuration unchanged", path);
                return Ok(());
            }

            self.backend.save(&next)?;
            let next = Arc::new(next);
            *self.tree.write() = next.clone();
            self.notifications.lock().push_back((next, old));
        }

        self.deliver();
        Ok(())
    }

    /// Drain queued notifications in commit order.
    ///
    /// A watcher that commits again only queues its notification; the
    /// outermost drain delivers it after the current one.
    fn deliver(&self) {
        loop {
            if self.delivering.swap(true, Ordering::AcqRel) {
                return;
            }

            loop {
                let next = self.notifications.lock().pop_front();
                let Some((new, old)) = next else {
                    break;
                };
                let watchers: Vec<Watcher> =
                    self.watchers.read().iter().map(|(_, w)| w.clone()).collect();
                for watcher in watchers {
                    watcher(&new, &old);
                }
            }

            self.delivering.store(false, Ordering::Release);
            if self.notifications.lock().is_empty() {
                return;
            }
        }
    }
}

fn empty_tree() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn store() -> (ConfigStore, MemoryBackend) {
        let backend = MemoryBackend::new();
        let store = ConfigStore::open(backend.clone(), ShellDefaults::default().to_tree());
        (store, backend)
    }

    #[test]
    fn get_falls_back_to_defaults_then_absent() {
        let (store, _) = store();
        assert_eq!(store.get("window-size.width").unwrap(), Some(json!(1100)));
        assert_eq!(store.get("options.nothing-here").unwrap(), None);
        assert!(store.get("bad..path").is_err());
    }

    #[test]
    fn get_merges_stored_table_over_default() {
        let (store, _) = store();
        store.set("options.tray", json!(true)).unwrap();

        let options = store.get("options").unwrap().unwrap();
        assert_eq!(options["tray"], true);
        assert_eq!(options["appVisible"], true);
    }

    #[test]
    fn set_partial_keeps_unmentioned_keys() {
        let (store, backend) = store();
        store
            .set("plugins.shortcuts", json!({ "enabled": false, "overrideMediaKeys": true }))
            .unwrap();
        store.set_partial("plugins.shortcuts", json!({ "enabled": true })).unwrap();

        assert_eq!(
            store.get("plugins.shortcuts").unwrap(),
            Some(json!({ "enabled": true, "overrideMediaKeys": true }))
        );
        assert_eq!(backend.stored(), Some((*store.snapshot()).clone()));
    }

    #[test]
    fn rejected_write_changes_nothing() {
        let (store, backend) = store();
        store.set("plugins.x.enabled", json!(true)).unwrap();
        let before = store.snapshot();

        let err = store.set("plugins.x.enabled", json!("nope")).unwrap_err();
        assert!(err.is_validation());
        assert!(store.set_partial("plugins.x", json!([1])).unwrap_err().is_validation());
        assert!(store.set("plugins.x.enabled.deeper", json!(1)).unwrap_err().is_validation());

        assert_eq!(store.snapshot(), before);
        assert_eq!(backend.stored().as_ref(), Some(&*before));
    }

    #[test]
    fn failed_persistence_keeps_old_tree_and_skips_watchers() {
        let (store, backend) = store();
        let calls = Arc::new(Mutex::new(0));
        let seen = calls.clone();
        store.watch(move |_, _| *seen.lock() += 1);

        backend.set_fail_saves(true);
        assert!(matches!(
            store.set("options.tray", json!(true)),
            Err(ConfigError::Persist(_))
        ));
        assert_eq!(store.get("options.tray").unwrap(), Some(json!(false)));
        assert_eq!(*calls.lock(), 0);
    }

    #[test]
    fn watchers_run_in_registration_order_with_new_and_old() {
        let (store, _) = store();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = log.clone();
        store.watch(move |new, old| {
            first.lock().push(format!(
                "first:{}->{}",
                old.pointer("/options/tray").cloned().unwrap_or(Value::Bool(false)),
                new["options"]["tray"]
            ))
        });
        let second = log.clone();
        store.watch(move |_, _| second.lock().push("second".to_string()));

        store.set("options.tray", json!(true)).unwrap();
        assert_eq!(*log.lock(), vec!["first:false->true", "second"]);
    }

    #[test]
    fn no_op_write_does_not_notify() {
        let (store, _) = store();
        store.set("options.tray", json!(true)).unwrap();

        let calls = Arc::new(Mutex::new(0));
        let seen = calls.clone();
        store.watch(move |_, _| *seen.lock() += 1);
        store.set("options.tray", json!(true)).unwrap();
        store.set_partial("options", json!({})).unwrap();
        assert_eq!(*calls.lock(), 0);
    }

    #[test]
    fn reentrant_write_from_watcher_is_delivered_after_current() {
        let (store, _) = store();
        let store = Arc::new(store);
        let order = Arc::new(Mutex::new(Vec::new()));

        let inner_store = Arc::downgrade(&store);
        let seen = order.clone();
        store.watch(move |new, _| {
            let tray = new["options"]["tray"].as_bool().unwrap_or(false);
            seen.lock().push(tray);
            if tray {
                if let Some(store) = inner_store.upgrade() {
                    store.set("options.tray", json!(false)).unwrap();
                }
            }
        });

        store.set("options.tray", json!(true)).unwrap();
        assert_eq!(*order.lock(), vec![true, false]);
        assert_eq!(store.get("options.tray").unwrap(), Some(json!(false)));
    }

    #[test]
    fn unwatch_stops_delivery() {
        let (store, _) = store();
        let calls = Arc::new(Mutex::new(0));
        let seen = calls.clone();
        let id = store.watch(move |_, _| *seen.lock() += 1);

        store.set("options.tray", json!(true)).unwrap();
        assert!(store.unwatch(id));
        assert!(!store.unwatch(id));
        store.set("options.tray", json!(false)).unwrap();
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn debounced_geometry_coalesces_until_flushed() {
        let (store, backend) = store();
        let calls = Arc::new(Mutex::new(0));
        let seen = calls.clone();
        store.watch(move |_, _| *seen.lock() += 1);

        store.set_debounced("window-size", json!({ "width": 800, "height": 600 })).unwrap();
        store.set_debounced("window-size", json!({ "width": 1024, "height": 768 })).unwrap();
        assert_eq!(store.pending_writes(), 1);
        assert_eq!(store.flush_due_at(Instant::now()).unwrap(), 0);
        assert!(backend.stored().is_none());

        let later = Instant::now() + DEBOUNCE_WINDOW + Duration::from_millis(50);
        assert_eq!(store.flush_due_at(later).unwrap(), 1);
        assert_eq!(
            store.get("window-size").unwrap(),
            Some(json!({ "width": 1024, "height": 768 }))
        );
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn direct_write_supersedes_staged_write() {
        let (store, _) = store();
        store.set_debounced("window-size", json!({ "width": 800, "height": 600 })).unwrap();
        store.set("window-size", json!({ "width": 1200, "height": 900 })).unwrap();
        assert_eq!(store.pending_writes(), 0);

        let later = Instant::now() + DEBOUNCE_WINDOW + Duration::from_millis(50);
        assert_eq!(store.flush_due_at(later).unwrap(), 0);
        assert_eq!(
            store.get("window-size").unwrap(),
            Some(json!({ "width": 1200, "height": 900 }))
        );
    }

    #[test]
    fn flush_commits_pending_writes_immediately() {
        let (store, _) = store();
        store.set_debounced("window-position", json!({ "x": 10, "y": 20 })).unwrap();
        assert_eq!(store.flush().unwrap(), 1);
        assert_eq!(store.pending_writes(), 0);
        assert_eq!(
            store.get_as::<WindowPosition>("window-position").unwrap(),
            Some(WindowPosition { x: 10, y: 20 })
        );
    }

    #[test]
    fn debounced_write_is_validated_when_staged() {
        let (store, _) = store();
        assert!(store.set_debounced("window-size", json!({ "width": 1 })).is_err());
        assert_eq!(store.pending_writes(), 0);

        // Keys outside the debounce set write through.
        store.set_debounced("window-maximized", json!(true)).unwrap();
        assert_eq!(store.get("window-maximized").unwrap(), Some(json!(true)));
    }

    #[test]
    fn unreadable_document_falls_back_to_defaults() {
        let backend = MemoryBackend::with_document(json!("not a table"));
        let store = ConfigStore::open(backend, ShellDefaults::default().to_tree());
        assert_eq!(*store.snapshot(), json!({}));
        assert_eq!(store.get("window-maximized").unwrap(), Some(json!(false)));
    }
}
