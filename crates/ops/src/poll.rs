//! Convergence poller: re-fetch a status until a predicate holds or the retry
//! budget runs out. Cancellation is by dropping the future (the owning flow
//! task is aborted); no timer or fetch outlives it.

use std::future::Future;

use metrics::counter;
use serde::Serialize;
use skiff_api::ApiError;
use skiff_core::ServiceState;
use tracing::debug;

use crate::retry::{RetryOutcome, RetryPolicy};

/// What is being waited for; used to build the exhaustion title.
#[derive(Debug, Clone)]
pub struct PollTarget {
    /// Verb as shown to the user, e.g. "stop".
    pub operation: String,
    /// Kind label, e.g. "shabondi".
    pub kind: String,
    /// Display name of the target.
    pub name: String,
    /// Expected state, e.g. "RUNNING" or "nonexistent".
    pub expected: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PollError {
    #[error("{title}")]
    Exhausted { title: String, retries: u32, last: serde_json::Value },
    #[error(transparent)]
    Fetch(#[from] ApiError),
}

impl PollTarget {
    /// Waiting for absence reads "Expected state is nonexistent"; waiting for
    /// a concrete state reads "Expected state: RUNNING".
    pub fn exhausted_title(&self, retries: u32, actual: &str) -> String {
        let sep = if self.expected == ServiceState::describe(None) { " is " } else { ": " };
        format!(
            "Try to {} {}: \"{}\" failed after retry {} times. Expected state{}{}, Actual state: {}",
            self.operation, self.kind, self.name, retries, sep, self.expected, actual
        )
    }
}

/// Fetch immediately, then every `policy` delay, until `is_satisfied`.
///
/// A fetch error ends polling at once; only unsatisfied results are retried.
/// `observe` renders the actual state for the exhaustion title.
pub async fn poll_until<T, F, Fut, P, O>(
    policy: &RetryPolicy,
    target: &PollTarget,
    mut fetch: F,
    is_satisfied: P,
    observe: O,
) -> Result<T, PollError>
where
    T: Serialize,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
    P: Fn(&T) -> bool,
    O: Fn(&T) -> String,
{
    let mut retry = policy.state();
    loop {
        let value = fetch().await?;
        counter!("ops_poll_attempts_total", 1, "operation" => target.operation.clone());
        if is_satisfied(&value) {
            debug!(op = %target.operation, name = %target.name, attempt = retry.attempt(), "poll satisfied");
            return Ok(value);
        }
        match retry.next_outcome() {
            RetryOutcome::RetryAfter(delay) => {
                debug!(
                    op = %target.operation,
                    name = %target.name,
                    attempt = retry.attempt(),
                    max = retry.max_attempts(),
                    actual = %observe(&value),
                    delay_ms = delay.as_millis() as u64,
                    "poll not satisfied; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            RetryOutcome::GiveUp { retries } => {
                let title = target.exhausted_title(retries, &observe(&value));
                let last = serde_json::to_value(&value).unwrap_or(serde_json::Value::Null);
                return Err(PollError::Exhausted { title, retries, last });
            }
        }
    }
}
