//! Per-kind resource flows: create, fetch, update, start, stop, delete.

use std::fmt;
use std::sync::Arc;

use metrics::{counter, histogram};
use skiff_api::{ApiError, ClusterApi};
use skiff_core::{ClusterStatusSnapshot, CoreError, ResourceId, ResourceKey, ResourceKind, ServiceState};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::action::{Action, EventLogEntry, FailurePayload, Payload, RemovedPayload, Routine, Stage, SuccessPayload};
use crate::config::OpsConfig;
use crate::epic::Flow;
use crate::gate::{FlowEmitter, Gate};
use crate::normalize::normalize_with;
use crate::poll::{poll_until, PollError, PollTarget};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Fetch,
    Update,
    Start,
    Stop,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 6] =
        [Operation::Create, Operation::Fetch, Operation::Update, Operation::Start, Operation::Stop, Operation::Delete];

    pub fn verb(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Fetch => "fetch",
            Operation::Update => "update",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Delete => "delete",
        }
    }

    /// `STOP_SHABONDI`, `FETCH_TOPIC`, ...
    pub fn routine(self, kind: ResourceKind) -> Routine {
        Routine::new(format!("{}_{}", self.verb(), kind.label()).to_uppercase())
    }

    /// Start and stop only apply to service kinds.
    pub fn applies_to(self, kind: ResourceKind) -> bool {
        match self {
            Operation::Start | Operation::Stop => kind.is_service(),
            _ => true,
        }
    }

    pub fn gate(self, cfg: &OpsConfig) -> Gate {
        match self {
            Operation::Delete => Gate::Debounce(cfg.debounce),
            _ => Gate::LatestPerKey,
        }
    }

    pub fn policy(self, cfg: &OpsConfig) -> RetryPolicy {
        match self {
            Operation::Start => cfg.start,
            Operation::Stop => cfg.stop,
            Operation::Delete => cfg.delete,
            _ => RetryPolicy::fixed(0, cfg.stop.interval),
        }
    }

    /// Failures of these operations also go to the event log.
    pub fn logs_failures(self) -> bool {
        matches!(self, Operation::Start | Operation::Stop)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

impl std::str::FromStr for Operation {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.verb().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown operation: {}", s))
    }
}

/// Caller-side status callbacks. All methods default to no-ops.
pub trait StatusHook: Send + Sync {
    fn on_request(&self, _key: &ResourceKey) {}
    fn on_success(&self, _key: &ResourceKey, _data: &serde_json::Value) {}
    fn on_failure(&self, _key: &ResourceKey, _failure: &FailurePayload) {}
}

/// Per-trigger options; never part of trigger equality.
#[derive(Clone, Default)]
pub struct Options {
    pub hook: Option<Arc<dyn StatusHook>>,
    /// Objects deep-merged into the entity before normalization.
    pub view: Vec<serde_json::Value>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options").field("hook", &self.hook.is_some()).field("view", &self.view).finish()
    }
}

/// Trigger of a resource flow.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub key: ResourceKey,
    pub body: serde_json::Value,
    pub options: Options,
}

impl PartialEq for OperationRequest {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.body == other.body
    }
}

impl OperationRequest {
    pub fn new(key: ResourceKey) -> Self {
        Self { key, body: serde_json::Value::Null, options: Options::default() }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn StatusHook>) -> Self {
        self.options.hook = Some(hook);
        self
    }

    pub fn with_view(mut self, view: serde_json::Value) -> Self {
        self.options.view.push(view);
        self
    }

    /// Request body with `name`/`group` filled in from the key when absent.
    fn body_with_key(&self) -> serde_json::Value {
        let mut body = match &self.body {
            serde_json::Value::Object(m) => m.clone(),
            _ => serde_json::Map::new(),
        };
        body.entry("name").or_insert_with(|| self.key.name.clone().into());
        body.entry("group").or_insert_with(|| self.key.group.clone().into());
        serde_json::Value::Object(body)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error("invalid response: {0}")]
    Invalid(#[from] CoreError),
}

impl FlowError {
    pub fn title(&self) -> String {
        match self {
            FlowError::Api(e) | FlowError::Poll(PollError::Fetch(e)) => e.title(),
            FlowError::Poll(PollError::Exhausted { title, .. }) => title.clone(),
            FlowError::Invalid(e) => format!("Invalid response: {}", e),
        }
    }

    pub fn data(&self) -> serde_json::Value {
        match self {
            FlowError::Api(e) | FlowError::Poll(PollError::Fetch(e)) => e.data(),
            FlowError::Poll(PollError::Exhausted { last, .. }) => last.clone(),
            FlowError::Invalid(_) => serde_json::Value::Null,
        }
    }

    pub fn meta(&self) -> Option<serde_json::Value> {
        match self {
            FlowError::Api(e) | FlowError::Poll(PollError::Fetch(e)) => e.meta(),
            _ => None,
        }
    }

    pub fn into_failure(self, id: Option<ResourceId>) -> FailurePayload {
        FailurePayload { id, data: self.data(), title: self.title(), meta: self.meta() }
    }
}

fn observed_state(data: &serde_json::Value) -> String {
    match data.get("state") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => ServiceState::describe(None).to_string(),
        Some(other) => other.to_string(),
    }
}

/// One operation on one resource kind.
pub struct ResourceFlow {
    kind: ResourceKind,
    op: Operation,
    routine: Routine,
    policy: RetryPolicy,
    api: Arc<dyn ClusterApi>,
}

impl ResourceFlow {
    pub fn new(kind: ResourceKind, op: Operation, policy: RetryPolicy, api: Arc<dyn ClusterApi>) -> Self {
        Self { kind, op, routine: op.routine(kind), policy, api }
    }

    fn target(&self, key: &ResourceKey, expected: &str) -> PollTarget {
        PollTarget {
            operation: self.op.verb().to_string(),
            kind: self.kind.label().to_string(),
            name: key.name.clone(),
            expected: expected.to_string(),
        }
    }

    async fn fetch(&self, key: &ResourceKey) -> Result<serde_json::Value, ApiError> {
        Ok(self.api.get(self.kind, key).await?.into_result()?.data)
    }

    async fn fetch_list(&self) -> Result<Vec<serde_json::Value>, ApiError> {
        let data = self.api.get_all(self.kind).await?.into_result()?.data;
        Ok(match data {
            serde_json::Value::Array(items) => items,
            _ => Vec::new(),
        })
    }

    fn success(&self, req: &OperationRequest, data: &serde_json::Value) -> Result<Payload, FlowError> {
        let normalized = normalize_with(self.kind, data, &req.options.view)?;
        Ok(Payload::Success(SuccessPayload { id: Some(req.key.id()), normalized }))
    }

    async fn execute(&self, req: &OperationRequest) -> Result<(Payload, serde_json::Value), FlowError> {
        let key = &req.key;
        let data = match self.op {
            Operation::Create => self.api.create(self.kind, &req.body_with_key()).await?.into_result()?.data,
            Operation::Fetch => self.fetch(key).await?,
            Operation::Update => self.api.update(self.kind, key, &req.body).await?.into_result()?.data,
            Operation::Start => {
                self.api.start(self.kind, key).await?.into_result()?;
                poll_until(
                    &self.policy,
                    &self.target(key, ServiceState::Running.as_str()),
                    || self.fetch(key),
                    |data: &serde_json::Value| ClusterStatusSnapshot::from_value(data).map(|s| s.is_running()).unwrap_or(false),
                    observed_state,
                )
                .await?
            }
            Operation::Stop => {
                self.api.stop(self.kind, key).await?.into_result()?;
                poll_until(
                    &self.policy,
                    &self.target(key, ServiceState::describe(None)),
                    || self.fetch(key),
                    |data: &serde_json::Value| data.get("state").map_or(true, serde_json::Value::is_null),
                    observed_state,
                )
                .await?
            }
            Operation::Delete => {
                self.api.remove(self.kind, key).await?.into_result()?;
                let present = |items: &Vec<serde_json::Value>| {
                    items.iter().any(|item| ResourceKey::from_value(item).map(|k| k == *key).unwrap_or(false))
                };
                poll_until(
                    &self.policy,
                    &self.target(key, ServiceState::describe(None)),
                    || self.fetch_list(),
                    |items: &Vec<serde_json::Value>| !present(items),
                    |items: &Vec<serde_json::Value>| if present(items) { "present".to_string() } else { ServiceState::describe(None).to_string() },
                )
                .await?;
                let removed = RemovedPayload { id: key.id(), entity: self.kind.plural() };
                return Ok((Payload::Removed(removed), serde_json::Value::Null));
            }
        };
        Ok((self.success(req, &data)?, data))
    }
}

#[async_trait::async_trait]
impl Flow for ResourceFlow {
    type Trigger = OperationRequest;

    fn routine(&self) -> &Routine {
        &self.routine
    }

    fn key(&self, req: &OperationRequest) -> String {
        req.key.id().as_str().to_string()
    }

    async fn run(&self, req: OperationRequest, out: &FlowEmitter) {
        let id = req.key.id();
        let t0 = Instant::now();
        let routine = self.routine.to_string();
        counter!("ops_flow_started_total", 1, "routine" => routine.clone());
        info!(routine = %routine, key = %req.key, id = %id, "flow request");
        out.emit(Action::request(&self.routine, Some(id.clone())));
        if let Some(hook) = &req.options.hook {
            out.notify(|| hook.on_request(&req.key));
        }

        match self.execute(&req).await {
            Ok((payload, data)) => {
                info!(routine = %routine, key = %req.key, elapsed_ms = t0.elapsed().as_millis() as u64, "flow succeeded");
                counter!("ops_flow_succeeded_total", 1, "routine" => routine.clone());
                if let Some(hook) = &req.options.hook {
                    out.notify(|| hook.on_success(&req.key, &data));
                }
                out.emit(Action::new(self.routine.clone(), Stage::Success, payload));
            }
            Err(err) => {
                warn!(routine = %routine, key = %req.key, error = %err, "flow failed");
                counter!("ops_flow_failed_total", 1, "routine" => routine.clone());
                let failure = err.into_failure(Some(id));
                if let Some(hook) = &req.options.hook {
                    out.notify(|| hook.on_failure(&req.key, &failure));
                }
                out.emit(Action::failure(&self.routine, failure.clone()));
                if self.op.logs_failures() {
                    out.emit(Action::event_log(EventLogEntry::error(failure)));
                }
            }
        }
        histogram!("ops_flow_ms", t0.elapsed().as_secs_f64() * 1000.0, "routine" => routine);
    }
}
