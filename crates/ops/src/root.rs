//! Root set of orchestrators: one per (kind, operation) plus the
//! application-level flows, all emitting into one dispatcher.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use skiff_api::ClusterApi;
use skiff_core::ResourceKind;
use tracing::info;

use crate::action::Dispatcher;
use crate::app::{InitializeAppFlow, SwitchPipelineFlow};
use crate::config::OpsConfig;
use crate::epic::{spawn_epic, EpicClosed, EpicHandle};
use crate::gate::Gate;
use crate::resource::{Operation, OperationRequest, ResourceFlow};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("{op} is not supported for {kind}")]
    Unsupported { kind: ResourceKind, op: Operation },
    #[error(transparent)]
    Closed(#[from] EpicClosed),
}

pub struct EpicSet {
    resources: FxHashMap<(ResourceKind, Operation), EpicHandle<OperationRequest>>,
    initialize: EpicHandle<()>,
    switch: EpicHandle<String>,
}

impl EpicSet {
    /// Spawn every orchestrator on the current runtime.
    pub fn spawn(api: Arc<dyn ClusterApi>, cfg: &OpsConfig, out: Dispatcher) -> Self {
        let mut resources = FxHashMap::default();
        for kind in ResourceKind::ALL {
            for op in Operation::ALL {
                if !op.applies_to(kind) {
                    continue;
                }
                let flow = Arc::new(ResourceFlow::new(kind, op, op.policy(cfg), api.clone()));
                resources.insert((kind, op), spawn_epic(flow, op.gate(cfg), out.clone()));
            }
        }
        let initialize = spawn_epic(Arc::new(InitializeAppFlow::new(api)), Gate::Latest, out.clone());
        let switch = spawn_epic(Arc::new(SwitchPipelineFlow::default()), Gate::Debounce(cfg.debounce), out);
        info!(orchestrators = resources.len() + 2, "orchestrators spawned");
        Self { resources, initialize, switch }
    }

    pub fn dispatch(&self, kind: ResourceKind, op: Operation, req: OperationRequest) -> Result<(), DispatchError> {
        let epic = self.resources.get(&(kind, op)).ok_or(DispatchError::Unsupported { kind, op })?;
        Ok(epic.trigger(req)?)
    }

    pub fn initialize_app(&self) -> Result<(), EpicClosed> {
        self.initialize.trigger(())
    }

    pub fn switch_pipeline(&self, name: impl Into<String>) -> Result<(), EpicClosed> {
        self.switch.trigger(name.into())
    }

    /// Close every trigger channel and wait for pending work to finish.
    pub async fn shutdown(self) {
        let Self { resources, initialize, switch } = self;
        futures::future::join_all(resources.into_values().map(EpicHandle::shutdown)).await;
        tokio::join!(initialize.shutdown(), switch.shutdown());
        info!("orchestrators stopped");
    }
}
