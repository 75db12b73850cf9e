use chrono::{DateTime, Local};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::plugin_api::{ContextKind, WindowId};

#[derive(Clone, Debug, PartialEq)]
pub enum LogEntry {
    Info(String),
    Error(String),
    PluginLoaded {
        plugin_id: String,
        context: ContextKind,
        window: WindowId,
    },
    PluginUnloaded {
        plugin_id: String,
        context: ContextKind,
        window: WindowId,
    },
    Broadcast {
        summary: String,
        peers: usize,
    },
    RestartAdvised {
        plugin_id: String,
    },
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEntry::Info(msg) => write!(f, "ℹ {}", msg),
            LogEntry::Error(msg) => write!(f, "✗ {}", msg),
            LogEntry::PluginLoaded { plugin_id, context, window } => {
                write!(f, "▲ {} loaded ({}, {})", plugin_id, context, window)
            }
            LogEntry::PluginUnloaded { plugin_id, context, window } => {
                write!(f, "▼ {} unloaded ({}, {})", plugin_id, context, window)
            }
            LogEntry::Broadcast { summary, peers } => {
                write!(f, "→ {} to {} peer(s)", summary, peers)
            }
            LogEntry::RestartAdvised { plugin_id } => {
                write!(f, "↻ {} needs a restart", plugin_id)
            }
        }
    }
}

/// Journal handle shared by every component that reports lifecycle events.
pub type SharedConsole = Arc<RwLock<ConsoleLog>>;

#[derive(Clone, Debug)]
pub struct JournalEntry {
    pub at: DateTime<Local>,
    pub seq: u64,
    pub entry: LogEntry,
}

/// Lifecycle history shown to settings surfaces.
///
/// Every entry is also forwarded to the `log` facade, whether or not the
/// journal itself is enabled.
pub struct ConsoleLog {
    enabled: bool,
    entries: VecDeque<JournalEntry>,
    max_entries: usize,
    next_seq: u64,
    last_displayed_seq: u64, // Entries below this were already handed out
}

impl ConsoleLog {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            enabled: true,
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
            next_seq: 0,
            last_displayed_seq: 0,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn log_info(&mut self, message: &str) {
        log::info!("{}", message);
        self.push(LogEntry::Info(message.to_string()));
    }

    pub fn log_error(&mut self, message: &str) {
        log::error!("{}", message);
        self.push(LogEntry::Error(message.to_string()));
    }

    pub fn log_plugin_loaded(&mut self, plugin_id: &str, context: ContextKind, window: WindowId) {
        log::info!("Loaded plugin '{}' ({}, {})", plugin_id, context, window);
        self.push(LogEntry::PluginLoaded {
            plugin_id: plugin_id.to_string(),
            context,
            window,
        });
    }

    pub fn log_plugin_unloaded(&mut self, plugin_id: &str, context: ContextKind, window: WindowId) {
        log::info!("Unloaded plugin '{}' ({}, {})", plugin_id, context, window);
        self.push(LogEntry::PluginUnloaded {
            plugin_id: plugin_id.to_string(),
            context,
            window,
        });
    }

    pub fn log_broadcast(&mut self, summary: &str, peers: usize) {
        log::debug!("Broadcast {} to {} peer(s)", summary, peers);
        self.push(LogEntry::Broadcast {
            summary: summary.to_string(),
            peers,
        });
    }

    pub fn log_restart_advised(&mut self, plugin_id: &str) {
        log::info!("Plugin '{}' requires a restart to take effect", plugin_id);
        self.push(LogEntry::RestartAdvised {
            plugin_id: plugin_id.to_string(),
        });
    }

    fn push(&mut self, entry: LogEntry) {
        if !self.enabled {
            return;
        }

        self.entries.push_back(JournalEntry {
            at: Local::now(),
            seq: self.next_seq,
            entry,
        });
        self.next_seq += 1;
        if self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    pub fn get_entries(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter()
    }

    /// Entries not yet returned by a previous call.
    pub fn get_new_entries(&mut self) -> Vec<JournalEntry> {
        let since = self.last_displayed_seq;
        self.last_displayed_seq = self.next_seq;
        self.entries
            .iter()
            .filter(|e| e.seq >= since)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// One line per entry, oldest first.
    pub fn render(&self) -> String {
        let mut text = String::new();
        for entry in &self.entries {
            text.push_str(&format!("[{}] {}\n", entry.at.format("%H:%M:%S"), entry.entry));
        }
        text
    }
}

impl Default for ConsoleLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_past_capacity() {
        let mut console = ConsoleLog::with_capacity(2);
        console.log_info("one");
        console.log_info("two");
        console.log_error("three");

        let entries: Vec<_> = console.get_entries().map(|e| e.entry.clone()).collect();
        assert_eq!(
            entries,
            vec![LogEntry::Info("two".into()), LogEntry::Error("three".into())]
        );
    }

    #[test]
    fn new_entries_are_handed_out_once() {
        let mut console = ConsoleLog::new();
        console.log_plugin_loaded("shortcuts", ContextKind::Backend, WindowId(1));
        assert_eq!(console.get_new_entries().len(), 1);
        assert!(console.get_new_entries().is_empty());

        console.log_restart_advised("in-app-menu");
        let fresh = console.get_new_entries();
        assert_eq!(fresh.len(), 1);
        assert_eq!(
            fresh[0].entry,
            LogEntry::RestartAdvised { plugin_id: "in-app-menu".into() }
        );
    }

    #[test]
    fn disabled_journal_records_nothing() {
        let mut console = ConsoleLog::new();
        console.set_enabled(false);
        console.log_info("hidden");
        assert!(console.is_empty());
    }

    #[test]
    fn render_formats_each_entry() {
        let mut console = ConsoleLog::new();
        console.log_plugin_unloaded("navigation", ContextKind::Frontend, WindowId(2));
        console.log_broadcast("plugin:unload(navigation)", 3);

        let text = console.render();
        assert!(text.contains("▼ navigation unloaded (frontend, window#2)"));
        assert!(text.contains("→ plugin:unload(navigation) to 3 peer(s)"));
    }
}
