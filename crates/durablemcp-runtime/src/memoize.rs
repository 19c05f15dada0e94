//! A tiny durable started/not-started cell.
//!
//! Elicitation needs to know, durably, whether a request was ever *issued*
//! for a given alias, while still re-sending it over the wire on every
//! retry, because the client side is not durable. [`Memoize`] is that one
//! bit: reset once per workflow, read, and set.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::error::RuntimeError;
use crate::state::{RecordRef, StateRuntime};
use crate::workflow::WorkflowContext;

/// Record type holding memoize cells.
pub const MEMOIZE_RECORD_KIND: &str = "durablemcp.v1.Memoize";

/// Handle to one durable memoize cell.
#[derive(Debug, Clone)]
pub struct Memoize {
    record: RecordRef,
}

impl Memoize {
    /// Reference the cell with the given id (typically a deterministic
    /// UUIDv5 hex derived from the workflow id and an alias).
    pub fn reference(id: impl Into<String>) -> Self {
        Self {
            record: RecordRef::new(MEMOIZE_RECORD_KIND, id),
        }
    }

    /// Reset the cell to not-started, applied at most once per workflow
    /// and alias. Later re-entries of the same workflow see whatever state
    /// the first life left behind.
    pub async fn reset_per_workflow(
        &self,
        context: &WorkflowContext,
        alias: &str,
    ) -> Result<(), RuntimeError> {
        let key = context.per_workflow_key(&format!("memoize-reset:{alias}"));
        context
            .runtime()
            .commit(
                &self.record,
                Some(key),
                Box::new(|value| {
                    *value = json!({"started": false});
                    Ok(Value::Null)
                }),
            )
            .await?;
        Ok(())
    }

    /// Whether the cell has been started.
    pub async fn started(&self, runtime: &Arc<dyn StateRuntime>) -> Result<bool, RuntimeError> {
        Ok(runtime
            .read(&self.record)
            .await?
            .and_then(|value| value.get("started").and_then(Value::as_bool))
            .unwrap_or(false))
    }

    /// Mark the cell started.
    pub async fn start(&self, runtime: &Arc<dyn StateRuntime>) -> Result<(), RuntimeError> {
        runtime
            .commit(
                &self.record,
                None,
                Box::new(|value| {
                    *value = json!({"started": true});
                    Ok(Value::Null)
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryRuntime;

    #[tokio::test]
    async fn reset_applies_once_per_workflow() {
        let memory = Arc::new(MemoryRuntime::new());
        let runtime: Arc<dyn StateRuntime> = Arc::clone(&memory) as _;
        let cell = Memoize::reference("cell-1");

        // First life: reset, observe not started, start.
        let ctx = WorkflowContext::new(Arc::clone(&runtime), "session", "1");
        cell.reset_per_workflow(&ctx, "elicit").await.unwrap();
        assert!(!cell.started(&runtime).await.unwrap());
        cell.start(&runtime).await.unwrap();

        // Second life of the same workflow: the reset is deduped, so the
        // started bit from the first life survives.
        let ctx = WorkflowContext::new(Arc::clone(&runtime), "session", "1");
        cell.reset_per_workflow(&ctx, "elicit").await.unwrap();
        assert!(cell.started(&runtime).await.unwrap());
    }
}
