//! The workflow executor.
//!
//! A handler execution is a *workflow*: a durable record of labeled steps
//! keyed by `(session, request, label)`. The two combinators are the whole
//! programming model:
//!
//! - [`at_least_once`]: the body must tolerate re-execution; a completed
//!   step replays its recorded value on every later entry.
//! - [`at_most_once`]: the body wraps an external side effect that must
//!   not double-execute; the step commits `started` before running and
//!   `completed` after, and a crash observed between the two fences makes
//!   every later entry fail with
//!   [`RuntimeError::AtMostOnceFailedBeforeCompleting`].
//!
//! Step status transitions commit through the same [`StateRuntime`] the
//! event log uses, so their ordering against log appends is well-defined.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::state::{RecordRef, StateRuntime};

/// Record type holding a workflow's step statuses.
pub const WORKFLOW_RECORD_KIND: &str = "durablemcp.v1.Workflow";

/// Status of one labeled step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum StepStatus {
    NotStarted,
    Started,
    Completed { value: Value },
    Failed { message: String },
}

/// Execution context of one workflow: identity, step storage, and the
/// bookkeeping that makes aliases unique within a run.
#[derive(Clone)]
pub struct WorkflowContext {
    runtime: Arc<dyn StateRuntime>,
    session_id: String,
    request_id: String,
    workflow_id: Uuid,
    steps: RecordRef,
    run: Arc<Mutex<RunState>>,
}

#[derive(Debug, Default)]
struct RunState {
    event_aliases: HashSet<String>,
    iteration: Option<u64>,
}

/// Snapshot of the in-run bookkeeping, used to rewind the context between
/// effect-validation runs. Durable step state is deliberately not part of
/// the snapshot: the second run must observe completed steps so it replays
/// their values instead of re-executing effects.
#[derive(Debug, Clone)]
pub struct WorkflowCheckpoint {
    event_aliases: HashSet<String>,
    iteration: Option<u64>,
}

impl WorkflowContext {
    /// Create the context for one `(session, request)` workflow.
    pub fn new(
        runtime: Arc<dyn StateRuntime>,
        session_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        let session_id = session_id.into();
        let request_id = request_id.into();
        let workflow_id = runtime.workflow_id(&session_id, &request_id);
        let steps = RecordRef::new(
            WORKFLOW_RECORD_KIND,
            format!("{session_id}/{request_id}"),
        );
        Self {
            runtime,
            session_id,
            request_id,
            workflow_id,
            steps,
            run: Arc::new(Mutex::new(RunState::default())),
        }
    }

    /// The state runtime this workflow commits through.
    pub fn runtime(&self) -> &Arc<dyn StateRuntime> {
        &self.runtime
    }

    /// Session this workflow belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Canonical id of the request this workflow executes.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The workflow id: stable across retries and replica moves, the
    /// namespace for every deterministic event id this workflow emits.
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Whether the handler is currently inside a server-side loop.
    pub fn within_loop(&self) -> bool {
        self.run.lock().iteration.is_some()
    }

    /// The current loop iteration, when inside one.
    pub fn iteration(&self) -> Option<u64> {
        self.run.lock().iteration
    }

    /// Enter iteration `n` of a server-side loop. Step labels and event
    /// aliases get ` #n` appended while set, so each iteration has its own
    /// step identities.
    pub fn set_iteration(&self, iteration: Option<u64>) {
        self.run.lock().iteration = iteration;
    }

    /// The durable label for a step: the developer's `why`, suffixed with
    /// the loop iteration when inside one.
    pub fn step_label(&self, why: &str) -> String {
        match self.run.lock().iteration {
            Some(iteration) => format!("{why} #{iteration}"),
            None => why.to_string(),
        }
    }

    /// Register an event alias, failing on in-run duplicates. Returns the
    /// alias as registered (with the loop-iteration suffix applied).
    pub fn register_event_alias(&self, alias: &str) -> Result<String, RuntimeError> {
        let alias = self.step_label(alias);
        let mut run = self.run.lock();
        if !run.event_aliases.insert(alias.clone()) {
            return Err(RuntimeError::DuplicateEventAlias { alias });
        }
        Ok(alias)
    }

    /// A commit idempotency key scoped to this workflow.
    pub fn per_workflow_key(&self, alias: &str) -> String {
        format!("wf:{}:{}", self.workflow_id.simple(), self.step_label(alias))
    }

    /// Snapshot the in-run bookkeeping.
    pub fn checkpoint(&self) -> WorkflowCheckpoint {
        let run = self.run.lock();
        WorkflowCheckpoint {
            event_aliases: run.event_aliases.clone(),
            iteration: run.iteration,
        }
    }

    /// Rewind the in-run bookkeeping to a checkpoint.
    pub fn restore(&self, checkpoint: &WorkflowCheckpoint) {
        let mut run = self.run.lock();
        run.event_aliases = checkpoint.event_aliases.clone();
        run.iteration = checkpoint.iteration;
    }

    async fn step_status(&self, label: &str) -> Result<Option<StepStatus>, RuntimeError> {
        let Some(record) = self.runtime.read(&self.steps).await? else {
            return Ok(None);
        };
        match record.get(label) {
            Some(status) => Ok(Some(serde_json::from_value(status.clone())?)),
            None => Ok(None),
        }
    }

    async fn commit_step(&self, label: &str, status: StepStatus) -> Result<(), RuntimeError> {
        let label = label.to_string();
        let status = serde_json::to_value(&status)?;
        self.runtime
            .commit(
                &self.steps,
                None,
                Box::new(move |value| {
                    if !value.is_object() {
                        *value = Value::Object(Default::default());
                    }
                    value
                        .as_object_mut()
                        .ok_or_else(|| RuntimeError::Storage("workflow record is not an object".into()))?
                        .insert(label, status);
                    Ok(Value::Null)
                }),
            )
            .await?;
        Ok(())
    }
}

impl fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("session_id", &self.session_id)
            .field("request_id", &self.request_id)
            .field("workflow_id", &self.workflow_id)
            .finish()
    }
}

/// Run a step whose body is safe to re-run.
///
/// A prior completion replays its recorded value without invoking `f`. On
/// success the value is committed; on error nothing is committed and a
/// retry of the surrounding workflow retries the step.
pub async fn at_least_once<T, F, Fut>(
    why: &str,
    context: &WorkflowContext,
    f: F,
) -> Result<T, RuntimeError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
{
    let label = context.step_label(why);

    match context.step_status(&label).await? {
        Some(StepStatus::Completed { value }) => {
            tracing::debug!(label, "at-least-once step replaying recorded value");
            return Ok(serde_json::from_value(value)?);
        }
        Some(StepStatus::Started) | Some(StepStatus::NotStarted) | Some(StepStatus::Failed { .. })
        | None => {}
    }

    let value = f().await?;
    context
        .commit_step(&label, StepStatus::Completed {
            value: serde_json::to_value(&value)?,
        })
        .await?;
    Ok(value)
}

/// Run a step wrapping an external side effect that must not
/// double-execute.
///
/// The step commits `started` before invoking `f` (fence 1) and
/// `completed` after (fence 2). An error for which `retryable` returns
/// true rolls the step back to `not_started` and re-raises so a later
/// workflow retry may re-enter. Any other error, and any crash observed
/// in the `started` state, poisons the step permanently.
pub async fn at_most_once<T, F, Fut, R>(
    why: &str,
    context: &WorkflowContext,
    f: F,
    retryable: R,
) -> Result<T, RuntimeError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
    R: Fn(&RuntimeError) -> bool,
{
    let label = context.step_label(why);

    match context.step_status(&label).await? {
        Some(StepStatus::Completed { value }) => {
            tracing::debug!(label, "at-most-once step replaying recorded value");
            return Ok(serde_json::from_value(value)?);
        }
        Some(StepStatus::Failed { .. }) => {
            return Err(RuntimeError::AtMostOnceFailedBeforeCompleting { label });
        }
        Some(StepStatus::Started) => {
            // Fence 1 committed, fence 2 never did: the previous life
            // crashed inside the side effect. Poison the step.
            context
                .commit_step(&label, StepStatus::Failed {
                    message: "crashed between commit fences".into(),
                })
                .await?;
            return Err(RuntimeError::AtMostOnceFailedBeforeCompleting { label });
        }
        Some(StepStatus::NotStarted) | None => {}
    }

    context.commit_step(&label, StepStatus::Started).await?;

    match f().await {
        Ok(value) => {
            context
                .commit_step(&label, StepStatus::Completed {
                    value: serde_json::to_value(&value)?,
                })
                .await?;
            Ok(value)
        }
        Err(error) if retryable(&error) => {
            tracing::debug!(label, %error, "at-most-once step rolled back for retry");
            context.commit_step(&label, StepStatus::NotStarted).await?;
            Err(error)
        }
        Err(error) => {
            context
                .commit_step(&label, StepStatus::Failed {
                    message: error.to_string(),
                })
                .await?;
            Err(error)
        }
    }
}
