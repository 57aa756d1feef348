//! Action envelope: the records orchestrators emit for the state layer.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use skiff_core::{LogLevel, ResourceId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::normalize::Normalized;

/// Lifecycle stage of one asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Trigger,
    Request,
    Success,
    Failure,
    Fulfill,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Trigger => "TRIGGER",
            Stage::Request => "REQUEST",
            Stage::Success => "SUCCESS",
            Stage::Failure => "FAILURE",
            Stage::Fulfill => "FULFILL",
        }
    }
}

/// Operation name, e.g. `STOP_SHABONDI`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Routine(Cow<'static, str>);

impl Routine {
    pub const CREATE_EVENT_LOG: Routine = Routine(Cow::Borrowed("CREATE_EVENT_LOG"));
    pub const INITIALIZE_APP: Routine = Routine(Cow::Borrowed("INITIALIZE_APP"));
    pub const SWITCH_PIPELINE: Routine = Routine(Cow::Borrowed("SWITCH_PIPELINE"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuccessPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,
    #[serde(flatten)]
    pub normalized: Normalized,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailurePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,
    pub data: serde_json::Value,
    pub title: String,
    pub meta: Option<serde_json::Value>,
}

/// Payload of a delete SUCCESS: which entity table row to drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedPayload {
    pub id: ResourceId,
    pub entity: &'static str,
}

/// Payload of `CREATE_EVENT_LOG/TRIGGER`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventLogEntry {
    #[serde(flatten)]
    pub failure: FailurePayload,
    #[serde(rename = "type")]
    pub level: LogLevel,
    pub created_at: DateTime<Utc>,
}

impl EventLogEntry {
    pub fn error(failure: FailurePayload) -> Self {
        Self { failure, level: LogLevel::Error, created_at: Utc::now() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Empty,
    Id { id: ResourceId },
    Name { name: String },
    Success(SuccessPayload),
    Removed(RemovedPayload),
    Failure(FailurePayload),
    EventLog(EventLogEntry),
}

impl Payload {
    pub fn id(&self) -> Option<&ResourceId> {
        match self {
            Payload::Id { id } => Some(id),
            Payload::Success(s) => s.id.as_ref(),
            Payload::Removed(r) => Some(&r.id),
            Payload::Failure(f) => f.id.as_ref(),
            Payload::EventLog(e) => e.failure.id.as_ref(),
            Payload::Empty | Payload::Name { .. } => None,
        }
    }
}

/// One immutable action record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    pub routine: Routine,
    pub stage: Stage,
    pub payload: Payload,
}

impl Action {
    pub fn new(routine: Routine, stage: Stage, payload: Payload) -> Self {
        Self { routine, stage, payload }
    }

    pub fn request(routine: &Routine, id: Option<ResourceId>) -> Self {
        let payload = match id {
            Some(id) => Payload::Id { id },
            None => Payload::Empty,
        };
        Self::new(routine.clone(), Stage::Request, payload)
    }

    pub fn success(routine: &Routine, payload: SuccessPayload) -> Self {
        Self::new(routine.clone(), Stage::Success, Payload::Success(payload))
    }

    pub fn failure(routine: &Routine, payload: FailurePayload) -> Self {
        Self::new(routine.clone(), Stage::Failure, Payload::Failure(payload))
    }

    pub fn fulfill(routine: &Routine) -> Self {
        Self::new(routine.clone(), Stage::Fulfill, Payload::Empty)
    }

    pub fn event_log(entry: EventLogEntry) -> Self {
        Self::new(Routine::CREATE_EVENT_LOG, Stage::Trigger, Payload::EventLog(entry))
    }

    /// `"<ROUTINE>/<STAGE>"`, e.g. `STOP_SHABONDI/SUCCESS`.
    pub fn type_name(&self) -> String {
        format!("{}/{}", self.routine, self.stage.as_str())
    }
}

/// Explicitly owned action bus. Orchestrators emit into it; the state layer
/// (or a test) owns the receiving end.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Action>,
}

impl Dispatcher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Action>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, action: Action) {
        debug!(action = %action.type_name(), id = ?action.payload.id(), "dispatch");
        if self.tx.send(action).is_err() {
            warn!("action receiver dropped; action discarded");
        }
    }
}
