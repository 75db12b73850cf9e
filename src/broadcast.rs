//! Mirrors lifecycle decisions and merged configs to every connected peer.
//!
//! Peers are other contexts (one frontend per window). Each peer has its own
//! ordered queue. Messages from one origin reach every peer in the order
//! they were sent. A peer that connects late gets the current merged state
//! in its [`StateSnapshot`], never a replay of what it missed.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;

use crate::channel::ChannelError;
use crate::console::SharedConsole;

/// Notification sent between contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContextMessage {
    #[serde(rename = "plugin:enable")]
    PluginEnable { id: String },

    #[serde(rename = "plugin:unload")]
    PluginUnload { id: String },

    #[serde(rename = "config-changed")]
    ConfigChanged { id: String, config: Value },
}

impl ContextMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PluginEnable { .. } => "plugin:enable",
            Self::PluginUnload { .. } => "plugin:unload",
            Self::ConfigChanged { .. } => "config-changed",
        }
    }

    pub fn plugin_id(&self) -> &str {
        match self {
            Self::PluginEnable { id } | Self::PluginUnload { id } | Self::ConfigChanged { id, .. } => {
                id.as_str()
            }
        }
    }
}

impl fmt::Display for ContextMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.plugin_id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Position in the broadcaster's stream. Strictly increasing per peer.
    pub seq: u64,
    pub message: ContextMessage,
}

/// Merged config of every plugin at the moment a peer connected.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateSnapshot {
    pub plugins: Map<String, Value>,
}

impl StateSnapshot {
    pub fn config(&self, id: &str) -> Option<&Value> {
        self.plugins.get(id)
    }
}

/// Receiving side handed to a connected peer.
pub struct PeerEndpoint {
    id: PeerId,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl PeerEndpoint {
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Next message, or `None` once the broadcaster dropped this peer.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: Vec<PeerId>,
}

type SnapshotFn = Box<dyn Fn() -> Map<String, Value> + Send + Sync>;

struct Peers {
    senders: BTreeMap<PeerId, mpsc::UnboundedSender<Envelope>>,
    next_peer: u64,
    next_seq: u64,
}

pub struct CrossContextBroadcaster {
    peers: Mutex<Peers>,
    snapshot: SnapshotFn,
    console: SharedConsole,
}

impl CrossContextBroadcaster {
    /// `snapshot` must return the merged config of every plugin as of now.
    pub fn new<F>(snapshot: F, console: SharedConsole) -> Self
    where
        F: Fn() -> Map<String, Value> + Send + Sync + 'static,
    {
        Self {
            peers: Mutex::new(Peers {
                senders: BTreeMap::new(),
                next_peer: 1,
                next_seq: 0,
            }),
            snapshot: Box::new(snapshot),
            console,
        }
    }

    /// Register a new peer. The snapshot is taken under the same lock that
    /// orders broadcasts, so every later broadcast reaches the new peer and
    /// no earlier one does.
    pub fn connect(&self) -> (PeerEndpoint, StateSnapshot) {
        let mut peers = self.peers.lock();
        let id = PeerId(peers.next_peer);
        peers.next_peer += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        peers.senders.insert(id, tx);
        let snapshot = StateSnapshot {
            plugins: (self.snapshot)(),
        };
        log::debug!("{} connected ({} peer(s))", id, peers.senders.len());

        (PeerEndpoint { id, rx }, snapshot)
    }

    pub fn disconnect(&self, peer: PeerId) -> bool {
        let removed = self.peers.lock().senders.remove(&peer).is_some();
        if removed {
            log::debug!("{} disconnected", peer);
        }
        removed
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().senders.len()
    }

    /// Fire-and-forget delivery to every peer. Peers whose endpoint is gone
    /// are pruned; they reconcile on reconnect.
    pub fn broadcast(&self, message: ContextMessage) -> BroadcastReport {
        let summary = message.to_string();
        let mut report = BroadcastReport::default();
        {
            let mut peers = self.peers.lock();
            let seq = peers.next_seq;
            peers.next_seq += 1;

            for (id, tx) in &peers.senders {
                let envelope = Envelope {
                    seq,
                    message: message.clone(),
                };
                match tx.send(envelope) {
                    Ok(()) => report.delivered += 1,
                    Err(_) => {
                        let e = ChannelError::Delivery(format!("{} is gone", id));
                        log::warn!("Dropping {} from broadcast: {}", summary, e);
                        report.dropped.push(*id);
                    }
                }
            }
            for id in &report.dropped {
                peers.senders.remove(id);
            }
        }

        self.console.write().log_broadcast(&summary, report.delivered);
        report
    }
}
