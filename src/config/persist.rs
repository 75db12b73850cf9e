use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::path::ConfigPath;
use super::ConfigError;

/// Debounce window for high-frequency keys such as window geometry.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(600);

/// Where the configuration document lives between runs.
pub trait PersistBackend: Send + Sync {
    /// Read the stored document. `Ok(None)` means nothing was stored yet.
    fn load(&self) -> Result<Option<Value>, ConfigError>;

    fn save(&self, tree: &Value) -> Result<(), ConfigError>;
}

/// TOML document on disk.
pub struct TomlFileBackend {
    path: PathBuf,
}

impl TomlFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/<app_name>/config.toml`
    pub fn in_config_dir(app_name: &str) -> Result<Self, ConfigError> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ConfigError::Persist("failed to get config directory".to_string()))?
            .join(app_name);
        Ok(Self::new(config_dir.join("config.toml")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistBackend for TomlFileBackend {
    fn load(&self) -> Result<Option<Value>, ConfigError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let tree: Value = toml::from_str(&content)?;
        Ok(Some(tree))
    }

    fn save(&self, tree: &Value) -> Result<(), ConfigError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(tree)?;

        // Write-then-rename so a crash never leaves a truncated document.
        let staging = self.path.with_extension("toml.tmp");
        fs::write(&staging, content)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

/// Keeps the document in memory. Used by tests and by hosts that do not
/// want anything written to disk.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    stored: Arc<Mutex<Option<Value>>>,
    fail_saves: Arc<Mutex<bool>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(tree: Value) -> Self {
        let backend = Self::default();
        *backend.stored.lock() = Some(tree);
        backend
    }

    pub fn stored(&self) -> Option<Value> {
        self.stored.lock().clone()
    }

    /// Make subsequent saves fail, to exercise persistence errors.
    pub fn set_fail_saves(&self, fail: bool) {
        *self.fail_saves.lock() = fail;
    }
}

impl PersistBackend for MemoryBackend {
    fn load(&self) -> Result<Option<Value>, ConfigError> {
        Ok(self.stored.lock().clone())
    }

    fn save(&self, tree: &Value) -> Result<(), ConfigError> {
        if *self.fail_saves.lock() {
            return Err(ConfigError::Persist("memory backend rejected save".to_string()));
        }
        *self.stored.lock() = Some(tree.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct PendingWrite {
    path: ConfigPath,
    value: Value,
    due: Instant,
}

/// Write-coalescing queue keyed by path.
///
/// Staging the same path again replaces the pending value and restarts its
/// deadline. Entries come out in the order their path was first staged.
#[derive(Debug)]
pub struct WriteQueue {
    delay: Duration,
    pending: VecDeque<PendingWrite>,
}

impl WriteQueue {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: VecDeque::new(),
        }
    }

    pub fn stage(&mut self, path: ConfigPath, value: Value, now: Instant) {
        let due = now + self.delay;
        if let Some(existing) = self.pending.iter_mut().find(|w| w.path == path) {
            existing.value = value;
            existing.due = due;
        } else {
            self.pending.push_back(PendingWrite { path, value, due });
        }
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Vec<(ConfigPath, Value)> {
        let mut due = Vec::new();
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for write in self.pending.drain(..) {
            if write.due <= now {
                due.push((write.path, write.value));
            } else {
                kept.push_back(write);
            }
        }
        self.pending = kept;
        due
    }

    pub fn take_all(&mut self) -> Vec<(ConfigPath, Value)> {
        self.pending.drain(..).map(|w| (w.path, w.value)).collect()
    }

    /// Drop staged writes at `path`, above it, or below it. Returns how
    /// many were dropped.
    pub fn discard_overlapping(&mut self, path: &ConfigPath) -> usize {
        let before = self.pending.len();
        self.pending.retain(|w| !w.path.overlaps(path));
        before - self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new(DEBOUNCE_WINDOW)
    }
}
