//! # DurableMCP Server
//!
//! A Model Context Protocol server where tool invocations *survive*: every
//! outbound event lands in a per-request durable log before it is released
//! to the client, handlers run as workflows with at-least-once and
//! at-most-once step semantics, and a client that reconnects with its last
//! event id replays exactly the suffix it missed: progress notifications,
//! elicitation prompts, and the final result included.
//!
//! The moving parts, bottom up:
//!
//! - [`stream`]: the per-request append-only event log.
//! - [`session_state`]: durable session metadata (client info, owned
//!   stream ids).
//! - [`event_store`]: maps MCP stream/event ids onto the log and drives
//!   replay for reconnecting clients.
//! - [`servicer`]: owns the embedded MCP engine per live session and pumps
//!   messages between it and the log.
//! - [`http`]: the session-routed streamable-HTTP front-end.
//! - [`adapter`]: wraps user handlers in a [`DurableContext`] exposing
//!   progress, logging, and elicitation with deterministic event ids.
//! - [`auth`]: bearer verification and access-token propagation.
//! - [`builder`]: the [`DurableMcp`] registration surface.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use durablemcp_runtime::{MemoryRuntime, at_least_once};
//! use durablemcp_server::{DurableContext, DurableMcp, ServerError};
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize, JsonSchema)]
//! struct AddArgs {
//!     a: i64,
//!     b: i64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut mcp = DurableMcp::new("/mcp");
//!     mcp.tool("add", "Add two numbers", |args: AddArgs, ctx: DurableContext| async move {
//!         ctx.report_progress(0.5, Some(1.0), None).await?;
//!         Ok::<_, ServerError>(args.a + args.b)
//!     });
//!
//!     let application = mcp.application(Arc::new(MemoryRuntime::new()));
//!     application.serve("127.0.0.1:3000").await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod adapter;
pub mod auth;
pub mod builder;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod event_store;
pub mod http;
pub mod registry;
pub mod servicer;
pub mod session_state;
pub mod sorted_map;
pub mod stream;

pub use adapter::{DurableContext, DurableSession, ElicitationResult};
pub use auth::{AccessToken, AuthConfig, AuthLayer, TokenVerifier};
pub use builder::{Application, DurableMcp, InitializeContext};
pub use envelope::MessageEnvelope;
pub use error::{ServerError, ServerResult};
pub use event_store::DurableEventStore;
pub use servicer::SessionServicer;
pub use session_state::SessionStateHandle;
pub use sorted_map::SortedMap;
pub use stream::StreamHandle;
