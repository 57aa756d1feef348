//! Dedup / debounce gate: which triggers start a flow, and which in-flight
//! flow they supersede.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::action::{Action, Dispatcher, Routine};

/// Gating strategy of one orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// One flow per resource id. A differing trigger for the same id
    /// supersedes the in-flight flow; an identical one is dropped while the
    /// flow is still running. Distinct ids never interact.
    LatestPerKey,
    /// One flow overall; every trigger supersedes the previous flow.
    Latest,
    /// Wait for a quiet window after the last trigger, then run only that
    /// trigger, superseding any flow still running. Not scoped by id.
    Debounce(Duration),
}

/// Gate key shared by every trigger of a non-keyed gate.
pub(crate) const GLOBAL_KEY: &str = "*";

/// Emission handle of one flow. Once retired (superseded) it drops every
/// action, so an abandoned flow can never be observed after its successor.
#[derive(Debug, Clone)]
pub struct FlowEmitter {
    out: Dispatcher,
    live: Arc<Mutex<bool>>,
}

impl FlowEmitter {
    pub fn new(out: Dispatcher) -> Self {
        Self { out, live: Arc::new(Mutex::new(true)) }
    }

    pub fn emit(&self, action: Action) {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if *live {
            self.out.emit(action);
        } else {
            debug!(action = %action.type_name(), "retired flow; action dropped");
        }
    }

    /// Run a caller callback only while the flow is live. The lock is held
    /// for the call, so a superseding flow cannot retire it halfway.
    pub fn notify(&self, f: impl FnOnce()) {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if *live {
            f();
        }
    }

    fn retire(&self) {
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

struct InFlight<T> {
    generation: u64,
    trigger: T,
    emitter: FlowEmitter,
    handle: JoinHandle<()>,
}

/// Table of in-flight flows keyed by gate key. Owned by one orchestrator
/// loop, so it needs no locking.
pub(crate) struct Flights<T> {
    routine: Routine,
    drop_identical: bool,
    generation: u64,
    table: FxHashMap<String, InFlight<T>>,
}

pub(crate) enum Admission {
    /// Start a new flow with this generation.
    Start(u64),
    /// Identical trigger already running.
    Dropped,
}

impl<T: PartialEq> Flights<T> {
    pub(crate) fn new(routine: Routine, gate: Gate) -> Self {
        Self { routine, drop_identical: matches!(gate, Gate::LatestPerKey), generation: 0, table: FxHashMap::default() }
    }

    /// Decide whether `trigger` runs; supersede whatever is in flight for `key`.
    pub(crate) fn admit(&mut self, key: &str, trigger: &T) -> Admission {
        if let Some(cur) = self.table.get(key) {
            let running = !cur.handle.is_finished();
            if running && self.drop_identical && cur.trigger == *trigger {
                debug!(routine = %self.routine, key, "identical trigger in flight; dropped");
                counter!("ops_flow_deduped_total", 1, "routine" => self.routine.to_string());
                return Admission::Dropped;
            }
            if running {
                cur.emitter.retire();
                cur.handle.abort();
                info!(routine = %self.routine, key, generation = cur.generation, "flow superseded");
                counter!("ops_flow_superseded_total", 1, "routine" => self.routine.to_string());
            }
        }
        self.generation += 1;
        Admission::Start(self.generation)
    }

    pub(crate) fn insert(&mut self, key: String, generation: u64, trigger: T, emitter: FlowEmitter, handle: JoinHandle<()>) {
        self.table.insert(key, InFlight { generation, trigger, emitter, handle });
    }

    /// Forget a finished flow unless a newer one already replaced it.
    pub(crate) fn finish(&mut self, key: &str, generation: u64) {
        if self.table.get(key).map(|f| f.generation) == Some(generation) {
            self.table.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn drain(&mut self) -> Vec<JoinHandle<()>> {
        self.table.drain().map(|(_, f)| f.handle).collect()
    }
}
