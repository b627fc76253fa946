use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub position: usize,
    #[serde(default)]
    pub items: Vec<Item>,
}

/// A whole-board snapshot. Serialized as a bare array of containers, which is
/// what the backend sends and expects back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Board {
    pub containers: Vec<Container>,
}

impl Board {
    pub fn item_count(&self) -> usize {
        self.containers.iter().map(|c| c.items.len()).sum()
    }
}

/// Body of `PATCH /api/containers-order-items`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemsOrder {
    pub containers: Vec<ContainerOrder>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerOrder {
    pub id: String,
    pub items: Vec<ItemPosition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPosition {
    pub id: String,
    pub position: usize,
}

/// What the dragged item is currently hovering over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropTarget {
    Item(String),
    Container(String),
}

impl DropTarget {
    /// Classify a raw id by its `item-` / `container-` prefix.
    pub fn from_id(id: &str) -> Option<Self> {
        if id.starts_with(ITEM_ID_PREFIX) {
            Some(DropTarget::Item(id.to_string()))
        } else if id.starts_with(CONTAINER_ID_PREFIX) {
            Some(DropTarget::Container(id.to_string()))
        } else {
            None
        }
    }

    pub fn id(&self) -> &str {
        match self {
            DropTarget::Item(id) | DropTarget::Container(id) => id,
        }
    }
}

pub const ITEM_ID_PREFIX: &str = "item-";
pub const CONTAINER_ID_PREFIX: &str = "container-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Request/response over HTTP.
    Rest,
    /// Realtime event channel backed by the in-process loopback hub.
    Loopback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub base_url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    pub transport: TransportKind,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Artificial latency added by the loopback hub before it rebroadcasts.
    #[serde(with = "humantime_serde")]
    pub simulated_latency: Duration,
    /// Random extra latency (0..=jitter) on top of `simulated_latency`.
    #[serde(with = "humantime_serde")]
    pub simulated_jitter: Duration,
    /// Pause between replayed drags.
    #[serde(with = "humantime_serde")]
    pub drag_interval: Duration,
    pub deliver_superseded: bool,
    pub user_agent: String,
}

/// Events emitted by the drag session for presentation layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    BoardChanged {
        board: Board,
    },
    SyncStarted {
        seq: u64,
    },
    SyncCompleted {
        seq: u64,
        response: String,
        #[serde(with = "humantime_serde")]
        rtt: Duration,
    },
    /// A sync that was overtaken by a newer drop.
    SyncSuperseded {
        seq: u64,
    },
    SyncFailed {
        seq: u64,
        error: String,
    },
    Info(String),
}

/// Summary of a finished drag session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub timestamp_utc: String,
    pub transport: TransportKind,
    pub drags: usize,
    pub syncs_started: u64,
    pub syncs_completed: u64,
    pub syncs_superseded: u64,
    pub syncs_failed: u64,
    #[serde(default)]
    pub rtt_ms: Vec<f64>,
    #[serde(default)]
    pub last_response: Option<String>,
    pub board: Board,
}
