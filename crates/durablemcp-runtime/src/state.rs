//! The state-runtime contract and its in-memory implementation.
//!
//! A *record* is a named durable JSON document. The contract gives callers:
//!
//! - read/commit with closure-based updates,
//! - idempotent commits keyed by a string (a keyed commit that already
//!   applied returns its stored result without re-running the update),
//! - reactive reads (a watch that fires on every committed change),
//! - a stable workflow id per `(session, request)`, and
//! - routing: which replica owns a record right now.
//!
//! [`MemoryRuntime`] keeps records in process memory and always routes to
//! itself. A replicated backend implements the same trait over its own
//! storage and consensus; nothing above this module knows the difference.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::RuntimeError;

/// Reference to a named durable record: a type name plus an id.
///
/// The readable form `"<kind>:<id>"` doubles as the routing-header value
/// the front-end attaches so the request reaches the owning replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordRef {
    /// Record type name, e.g. `durablemcp.v1.Session`.
    pub kind: String,
    /// Record id.
    pub id: String,
}

impl RecordRef {
    /// Create a record reference.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Parse the readable `"<kind>:<id>"` form.
    pub fn from_readable(readable: &str) -> Option<Self> {
        let (kind, id) = readable.split_once(':')?;
        if kind.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(kind, id))
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A record update: mutates the document in place and returns the commit
/// result that an idempotent re-application will yield without re-running.
pub type Update = Box<dyn FnOnce(&mut Value) -> Result<Value, RuntimeError> + Send>;

/// Reactive read handle: resolves each time the record is committed.
#[derive(Debug, Clone)]
pub struct RecordWatch {
    receiver: watch::Receiver<u64>,
}

impl RecordWatch {
    /// Wait until the record changes again.
    ///
    /// Returns `false` if the record's runtime was dropped.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }

    /// Mark the current version as seen without waiting.
    pub fn mark_seen(&mut self) {
        self.receiver.borrow_and_update();
    }
}

/// The collaborator contract: a durable, routed record store.
#[async_trait]
pub trait StateRuntime: Send + Sync + 'static {
    /// Read a record. `None` if it has never been committed.
    async fn read(&self, record: &RecordRef) -> Result<Option<Value>, RuntimeError>;

    /// Commit an update to a record, creating it if absent.
    ///
    /// When `idempotency_key` is set and a commit with that key already
    /// applied to this record, the stored result is returned and `update`
    /// is not run. A failed update commits nothing and does not consume
    /// the key.
    async fn commit(
        &self,
        record: &RecordRef,
        idempotency_key: Option<String>,
        update: Update,
    ) -> Result<Value, RuntimeError>;

    /// Subscribe to changes of a record.
    async fn subscribe(&self, record: &RecordRef) -> Result<RecordWatch, RuntimeError>;

    /// The stable workflow id for a `(session, request)` pair. Identical
    /// across retries and replica moves of the same request.
    fn workflow_id(&self, session_id: &str, request_id: &str) -> Uuid;

    /// The upstream authority (`host:port`) owning `record`, or `None`
    /// when this replica owns it.
    fn route(&self, record: &RecordRef) -> Option<String>;
}

struct RecordCell {
    state: Mutex<RecordState>,
    version_tx: watch::Sender<u64>,
}

struct RecordState {
    value: Value,
    applied: HashMap<String, Value>,
    version: u64,
}

impl RecordCell {
    fn new() -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(RecordState {
                value: Value::Null,
                applied: HashMap::new(),
                version: 0,
            }),
            version_tx,
        }
    }
}

/// Single-replica, in-process state runtime.
///
/// Durability here means "survives everything except the process": tests
/// model a replica crash by discarding the servicer and every in-memory
/// channel while keeping the runtime, exactly the split a replicated
/// backend provides across real restarts.
pub struct MemoryRuntime {
    records: DashMap<RecordRef, Arc<RecordCell>>,
    namespace: Uuid,
}

impl MemoryRuntime {
    /// Create an empty runtime with a fresh workflow-id namespace.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            namespace: Uuid::new_v4(),
        }
    }

    fn cell(&self, record: &RecordRef) -> Arc<RecordCell> {
        self.records
            .entry(record.clone())
            .or_insert_with(|| Arc::new(RecordCell::new()))
            .clone()
    }
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRuntime")
            .field("records", &self.records.len())
            .finish()
    }
}

#[async_trait]
impl StateRuntime for MemoryRuntime {
    async fn read(&self, record: &RecordRef) -> Result<Option<Value>, RuntimeError> {
        match self.records.get(record) {
            Some(cell) => {
                let state = cell.state.lock();
                if state.version == 0 {
                    Ok(None)
                } else {
                    Ok(Some(state.value.clone()))
                }
            }
            None => Ok(None),
        }
    }

    async fn commit(
        &self,
        record: &RecordRef,
        idempotency_key: Option<String>,
        update: Update,
    ) -> Result<Value, RuntimeError> {
        let cell = self.cell(record);
        let mut state = cell.state.lock();

        if let Some(key) = &idempotency_key
            && let Some(result) = state.applied.get(key)
        {
            tracing::trace!(record = %record, key, "idempotent commit already applied");
            return Ok(result.clone());
        }

        // Run the update on a copy so a failing update leaves the record
        // exactly as it was.
        let mut value = state.value.clone();
        let result = update(&mut value)?;

        state.value = value;
        state.version += 1;
        if let Some(key) = idempotency_key {
            state.applied.insert(key, result.clone());
        }
        let version = state.version;
        drop(state);

        let _ = cell.version_tx.send(version);
        Ok(result)
    }

    async fn subscribe(&self, record: &RecordRef) -> Result<RecordWatch, RuntimeError> {
        let cell = self.cell(record);
        Ok(RecordWatch {
            receiver: cell.version_tx.subscribe(),
        })
    }

    fn workflow_id(&self, session_id: &str, request_id: &str) -> Uuid {
        Uuid::new_v5(
            &self.namespace,
            format!("{session_id}/{request_id}").as_bytes(),
        )
    }

    fn route(&self, _record: &RecordRef) -> Option<String> {
        None
    }
}
