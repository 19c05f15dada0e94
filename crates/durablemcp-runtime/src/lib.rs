//! # DurableMCP Runtime
//!
//! The durable substrate the MCP runtime executes on: named durable records
//! with keyed idempotent writes and reactive reads (the *state runtime*
//! contract), and the workflow executor that gives tool handlers
//! at-least-once and at-most-once step semantics on top of it.
//!
//! The [`StateRuntime`] trait is the collaborator boundary: a replicated
//! deployment plugs in a backend that persists and routes records across
//! replicas; [`MemoryRuntime`] is the single-replica implementation used in
//! tests and small deployments. Everything above this crate (the event
//! log, session state, and workflow checkpoints) is expressed purely in
//! terms of the trait, so "replica restart" means dropping every in-memory
//! structure and rebuilding it over the same runtime.

pub mod error;
pub mod memoize;
pub mod state;
pub mod workflow;

pub use error::RuntimeError;
pub use memoize::Memoize;
pub use state::{MemoryRuntime, RecordRef, RecordWatch, StateRuntime, Update};
pub use workflow::{WorkflowCheckpoint, WorkflowContext, at_least_once, at_most_once};
