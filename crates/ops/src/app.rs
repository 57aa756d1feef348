//! Application-level flows: initial load and pipeline switching.

use std::sync::Arc;

use metrics::counter;
use skiff_api::ClusterApi;
use skiff_core::ResourceKind;
use tracing::{info, warn};

use crate::action::{Action, Payload, Routine, Stage, SuccessPayload};
use crate::epic::Flow;
use crate::gate::FlowEmitter;
use crate::normalize::{normalize_list, Normalized};
use crate::resource::FlowError;

/// Load every pipeline and workspace concurrently and publish them as one
/// normalized result, followed by `FULFILL`.
pub struct InitializeAppFlow {
    routine: Routine,
    api: Arc<dyn ClusterApi>,
}

impl InitializeAppFlow {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { routine: Routine::INITIALIZE_APP, api }
    }

    async fn list(&self, kind: ResourceKind) -> Result<Normalized, FlowError> {
        let resp = self.api.get_all(kind).await?.into_result()?;
        Ok(normalize_list(kind, &resp.data)?)
    }
}

#[async_trait::async_trait]
impl Flow for InitializeAppFlow {
    type Trigger = ();

    fn routine(&self) -> &Routine {
        &self.routine
    }

    fn key(&self, _: &()) -> String {
        self.routine.to_string()
    }

    async fn run(&self, _: (), out: &FlowEmitter) {
        let routine = &self.routine;
        out.emit(Action::request(routine, None));
        let loaded = futures::try_join!(self.list(ResourceKind::Pipeline), self.list(ResourceKind::Workspace));
        match loaded {
            Ok((pipelines, workspaces)) => {
                let normalized = pipelines.merge(workspaces);
                info!(tables = normalized.entities.len(), "application initialized");
                out.emit(Action::success(routine, SuccessPayload { id: None, normalized }));
                out.emit(Action::fulfill(routine));
            }
            Err(err) => {
                warn!(error = %err, "application initialization failed");
                counter!("ops_flow_failed_total", 1, "routine" => routine.to_string());
                out.emit(Action::failure(routine, err.into_failure(None)));
            }
        }
    }
}

/// Select the current pipeline by name. Empty names are ignored.
#[derive(Debug)]
pub struct SwitchPipelineFlow {
    routine: Routine,
}

impl Default for SwitchPipelineFlow {
    fn default() -> Self {
        Self { routine: Routine::SWITCH_PIPELINE }
    }
}

#[async_trait::async_trait]
impl Flow for SwitchPipelineFlow {
    type Trigger = String;

    fn routine(&self) -> &Routine {
        &self.routine
    }

    fn key(&self, name: &String) -> String {
        name.clone()
    }

    fn accepts(&self, name: &String) -> bool {
        !name.is_empty()
    }

    async fn run(&self, name: String, out: &FlowEmitter) {
        info!(pipeline = %name, "switch pipeline");
        out.emit(Action::new(self.routine.clone(), Stage::Request, Payload::Name { name: name.clone() }));
        out.emit(Action::new(self.routine.clone(), Stage::Success, Payload::Name { name }));
    }
}
