//! # DurableMCP
//!
//! A Model Context Protocol runtime where tool invocations survive
//! crashes, process restarts, and client disconnects. Register tools,
//! resources, and prompts against a [`DurableMcp`] builder; handlers run
//! as workflows with [`at_least_once`] / [`at_most_once`] step semantics,
//! every outbound event is appended to a durable per-request log before
//! release, and a reconnecting client replays exactly what it missed.
//!
//! This crate re-exports the `durablemcp-*` family:
//!
//! - [`protocol`]: JSON-RPC and MCP wire types.
//! - [`runtime`]: the state-runtime contract and workflow executor.
//! - [`server`]: the durable server itself.
//! - [`client`]: connect / reconnect helpers.

pub use durablemcp_client as client;
pub use durablemcp_protocol as protocol;
pub use durablemcp_runtime as runtime;
pub use durablemcp_server as server;

pub use durablemcp_runtime::{
    MemoryRuntime, RuntimeError, StateRuntime, WorkflowContext, at_least_once, at_most_once,
};
pub use durablemcp_server::{
    AccessToken, Application, AuthConfig, DurableContext, DurableMcp, ElicitationResult,
    ServerError, SortedMap, TokenVerifier,
};
