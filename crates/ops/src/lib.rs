//! Skiff Ops: asynchronous action orchestration over the console REST API.
//!
//! A trigger enters an orchestrator, passes its gate (latest-per-key,
//! latest, or debounce), and becomes a flow task that emits `REQUEST`
//! followed by exactly one terminal action. Start/stop/delete flows poll the
//! API until the cluster converges or the retry budget is spent.

#![forbid(unsafe_code)]

pub mod action;
pub mod app;
pub mod config;
pub mod epic;
pub mod gate;
pub mod normalize;
pub mod poll;
pub mod resource;
pub mod retry;
pub mod root;

pub use action::{Action, Dispatcher, EventLogEntry, FailurePayload, Payload, RemovedPayload, Routine, Stage, SuccessPayload};
pub use app::{InitializeAppFlow, SwitchPipelineFlow};
pub use config::OpsConfig;
pub use epic::{spawn_epic, EpicClosed, EpicHandle, Flow};
pub use gate::{FlowEmitter, Gate};
pub use normalize::{deep_merge, normalize, normalize_list, normalize_with, EntityTable, Normalized, NormalizedResult};
pub use poll::{poll_until, PollError, PollTarget};
pub use resource::{FlowError, Operation, OperationRequest, Options, ResourceFlow, StatusHook};
pub use retry::{RetryOutcome, RetryPolicy, RetryState};
pub use root::{DispatchError, EpicSet};
