//! Skiff store: reduces emitted actions into an entity table plus request
//! status and a bounded event log, and publishes immutable snapshots.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use serde::Serialize;
use skiff_core::ResourceId;
use skiff_ops::{Action, EntityTable, EventLogEntry, Payload, Routine, Stage};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Default bound on retained event-log entries.
pub const DEFAULT_EVENT_LOG_CAP: usize = 1000;

/// Read `SKIFF_EVENT_LOG_CAP`, falling back to the default.
pub fn event_log_cap_from_env() -> usize {
    std::env::var("SKIFF_EVENT_LOG_CAP")
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_EVENT_LOG_CAP)
}

/// Last known outcome of the operations on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RequestStatus {
    Pending { routine: String },
    Ready { routine: String },
    Failed { routine: String, title: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreSnapshot {
    pub epoch: u64,
    pub entities: EntityTable,
    pub status: FxHashMap<ResourceId, RequestStatus>,
    pub event_log: Vec<EventLogEntry>,
    pub current_pipeline: Option<String>,
    pub initialized: bool,
}

impl StoreSnapshot {
    pub fn entity(&self, table: &str, id: &ResourceId) -> Option<&serde_json::Value> {
        self.entities.get(table).and_then(|rows| rows.get(id))
    }
}

/// Mutable reducer state. Owned by one task; readers see `StoreSnapshot`s.
pub struct EntityStore {
    epoch: u64,
    entities: EntityTable,
    status: FxHashMap<ResourceId, RequestStatus>,
    event_log: VecDeque<EventLogEntry>,
    cap: usize,
    dropped: u64,
    current_pipeline: Option<String>,
    initialized: bool,
}

impl EntityStore {
    pub fn with_event_log_cap(cap: usize) -> Self {
        Self {
            epoch: 0,
            entities: EntityTable::new(),
            status: FxHashMap::default(),
            event_log: VecDeque::new(),
            cap: cap.max(1),
            dropped: 0,
            current_pipeline: None,
            initialized: false,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Event-log entries evicted by the cap so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Apply one action. Rows in a SUCCESS payload replace the stored row
    /// whole, so fields the server dropped (e.g. `state` after stop) go away.
    pub fn apply(&mut self, action: &Action) {
        let routine = action.routine.to_string();
        match (&action.stage, &action.payload) {
            (Stage::Request, Payload::Id { id }) => {
                self.status.insert(id.clone(), RequestStatus::Pending { routine });
            }
            (Stage::Success, Payload::Success(s)) => {
                for (table, rows) in &s.normalized.entities {
                    let dst = self.entities.entry(table.clone()).or_default();
                    for (id, row) in rows {
                        dst.insert(id.clone(), row.clone());
                    }
                }
                if let Some(id) = &s.id {
                    self.status.insert(id.clone(), RequestStatus::Ready { routine });
                }
            }
            (Stage::Success, Payload::Removed(r)) => {
                if let Some(rows) = self.entities.get_mut(r.entity) {
                    rows.remove(&r.id);
                }
                self.status.remove(&r.id);
            }
            (Stage::Success, Payload::Name { name }) if action.routine == Routine::SWITCH_PIPELINE => {
                self.current_pipeline = Some(name.clone());
            }
            (Stage::Failure, Payload::Failure(f)) => {
                if let Some(id) = &f.id {
                    self.status.insert(id.clone(), RequestStatus::Failed { routine, title: f.title.clone() });
                }
            }
            (Stage::Fulfill, _) if action.routine == Routine::INITIALIZE_APP => {
                self.initialized = true;
            }
            (Stage::Trigger, Payload::EventLog(entry)) => {
                if self.event_log.len() >= self.cap {
                    self.event_log.pop_front();
                    self.dropped += 1;
                }
                self.event_log.push_back(entry.clone());
                gauge!("store_event_log_len", self.event_log.len() as f64);
            }
            _ => {
                debug!(action = %action.type_name(), "action has no store effect");
                return;
            }
        }
        counter!("store_actions_total", 1, "stage" => action.stage.as_str());
    }

    /// Apply a batch and advance the epoch once.
    pub fn apply_batch(&mut self, batch: &[Action]) {
        for action in batch {
            self.apply(action);
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<StoreSnapshot> {
        Arc::new(StoreSnapshot {
            epoch: self.epoch,
            entities: self.entities.clone(),
            status: self.status.clone(),
            event_log: self.event_log.iter().cloned().collect(),
            current_pipeline: self.current_pipeline.clone(),
            initialized: self.initialized,
        })
    }
}

/// Handle for readers to access the current snapshot and subscribe to swaps.
#[derive(Clone)]
pub struct StoreHandle {
    snap: Arc<ArcSwap<StoreSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl StoreHandle {
    pub fn current(&self) -> Arc<StoreSnapshot> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }
}

/// Spawn the reducer loop. Every wakeup drains what is queued, applies it as
/// one batch and swaps in a new snapshot. Ends when all senders are dropped.
pub fn spawn_reducer(cap: usize, mut rx: mpsc::UnboundedReceiver<Action>) -> (StoreHandle, JoinHandle<()>) {
    let snap = Arc::new(ArcSwap::from_pointee(StoreSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let snap_clone = Arc::clone(&snap);

    let join = tokio::spawn(async move {
        let mut store = EntityStore::with_event_log_cap(cap);
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while let Ok(more) = rx.try_recv() {
                batch.push(more);
            }
            store.apply_batch(&batch);
            let next = store.freeze();
            let epoch = next.epoch;
            snap_clone.store(next);
            let _ = epoch_tx.send(epoch);
            debug!(epoch, actions = batch.len(), "store snapshot swapped");
        }
        info!(epoch = store.epoch(), dropped_events = store.dropped(), "reducer loop stopped");
    });

    (StoreHandle { snap, epoch_rx }, join)
}
