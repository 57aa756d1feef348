//! Orchestrator event loop: receives triggers, applies the gate, and runs
//! each admitted flow as its own task. Superseded flows are aborted, which
//! drops their poll timers and pending fetches.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::action::{Dispatcher, Routine};
use crate::gate::{Admission, Flights, FlowEmitter, Gate, GLOBAL_KEY};

/// One asynchronous operation: what a trigger turns into.
#[async_trait::async_trait]
pub trait Flow: Send + Sync + 'static {
    type Trigger: Clone + PartialEq + fmt::Debug + Send + Sync + 'static;

    fn routine(&self) -> &Routine;

    /// Gate key for `Gate::LatestPerKey`.
    fn key(&self, trigger: &Self::Trigger) -> String;

    /// Triggers rejected here never reach the gate.
    fn accepts(&self, _trigger: &Self::Trigger) -> bool {
        true
    }

    /// Run to a terminal outcome, emitting actions as it goes.
    async fn run(&self, trigger: Self::Trigger, out: &FlowEmitter);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("orchestrator is not running")]
pub struct EpicClosed;

/// Trigger side of a running orchestrator.
#[derive(Debug)]
pub struct EpicHandle<T> {
    tx: mpsc::UnboundedSender<T>,
    join: JoinHandle<()>,
}

impl<T> EpicHandle<T> {
    pub fn trigger(&self, trigger: T) -> Result<(), EpicClosed> {
        self.tx.send(trigger).map_err(|_| EpicClosed)
    }

    /// Stop accepting triggers and wait for pending work. A debounced trigger
    /// still fires at its deadline; in-flight flows run to completion.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.join.await;
    }
}

/// Spawn the event loop of one orchestrator.
pub fn spawn_epic<F: Flow>(flow: Arc<F>, gate: Gate, out: Dispatcher) -> EpicHandle<F::Trigger> {
    let (tx, rx) = mpsc::unbounded_channel();
    let join = tokio::spawn(run_epic(flow, gate, out, rx));
    EpicHandle { tx, join }
}

struct Runner<F: Flow> {
    flow: Arc<F>,
    out: Dispatcher,
    done_tx: mpsc::UnboundedSender<(String, u64)>,
    flights: Flights<F::Trigger>,
}

impl<F: Flow> Runner<F> {
    fn launch(&mut self, key: String, trigger: F::Trigger) {
        let generation = match self.flights.admit(&key, &trigger) {
            Admission::Start(g) => g,
            Admission::Dropped => return,
        };
        let emitter = FlowEmitter::new(self.out.clone());
        let flow = self.flow.clone();
        let run_emitter = emitter.clone();
        let run_trigger = trigger.clone();
        let done_tx = self.done_tx.clone();
        let done_key = key.clone();
        debug!(routine = %self.flow.routine(), key = %key, generation, "flow admitted");
        let handle = tokio::spawn(async move {
            flow.run(run_trigger, &run_emitter).await;
            let _ = done_tx.send((done_key, generation));
        });
        self.flights.insert(key, generation, trigger, emitter, handle);
    }
}

async fn run_epic<F: Flow>(flow: Arc<F>, gate: Gate, out: Dispatcher, mut rx: mpsc::UnboundedReceiver<F::Trigger>) {
    let routine = flow.routine().clone();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(String, u64)>();
    let mut runner = Runner { flow: flow.clone(), out, done_tx, flights: Flights::new(routine.clone(), gate) };
    let mut pending: Option<(F::Trigger, Instant)> = None;
    info!(routine = %routine, gate = ?gate, "orchestrator started");

    loop {
        let deadline = pending.as_ref().map(|(_, at)| *at);
        let quiet = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now));
        tokio::select! {
            maybe = rx.recv() => {
                let Some(trigger) = maybe else { break };
                if !flow.accepts(&trigger) {
                    debug!(routine = %routine, trigger = ?trigger, "trigger filtered");
                    continue;
                }
                match gate {
                    Gate::Debounce(window) => {
                        if pending.is_some() {
                            debug!(routine = %routine, "debounce window restarted");
                        }
                        pending = Some((trigger, Instant::now() + window));
                    }
                    Gate::LatestPerKey => {
                        let key = flow.key(&trigger);
                        runner.launch(key, trigger);
                    }
                    Gate::Latest => runner.launch(GLOBAL_KEY.to_string(), trigger),
                }
            }
            Some((key, generation)) = done_rx.recv() => runner.flights.finish(&key, generation),
            _ = quiet, if deadline.is_some() => {
                if let Some((trigger, _)) = pending.take() {
                    runner.launch(GLOBAL_KEY.to_string(), trigger);
                }
            }
        }
    }

    if let Some((trigger, at)) = pending.take() {
        tokio::time::sleep_until(at).await;
        runner.launch(GLOBAL_KEY.to_string(), trigger);
    }
    let handles = runner.flights.drain();
    info!(routine = %routine, in_flight = handles.len(), "orchestrator draining");
    for handle in handles {
        let _ = handle.await;
    }
    info!(routine = %routine, "orchestrator stopped");
}
