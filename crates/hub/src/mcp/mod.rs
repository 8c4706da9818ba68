//! MCP (Model Context Protocol) Hub Module
//!
//! Aggregates many upstream MCP servers behind one catalog and serves it to
//! downstream sessions.
//!
//! # Architecture
//!
//! ```text
//! HTTP / WebSocket client --+                      +--> stdio backend (child process)
//!                           +--> McpRouter --> BackendManager --> SSE backend
//! Endpoint bridge ----------+                      +--> streamable HTTP backend
//!                                                  +--> OpenAPI backend
//! ```
//!
//! # Features
//!
//! - Tool namespacing: `{backend}-{tool}` to prevent conflicts
//! - Group scopes with per-backend tool selections
//! - Per-tool and per-prompt overrides (disable, replace description)
//! - Smart routing: `search_tools` + `call_tool` over similarity search
//! - Tiered reconnection for every backend

pub mod adapter;
pub mod catalog;
pub mod client;
pub mod handlers;
pub mod manager;
pub mod openapi;
pub mod router;
pub mod search;
pub mod smart;
pub mod transport;
pub mod types;

pub use adapter::{AdapterFactory, ConnectPhase, DefaultAdapterFactory, UpstreamAdapter};
pub use catalog::{BackendRuntime, BackendSummary, Catalog};
pub use client::{McpClientError, McpResult};
pub use handlers::{McpMethod, McpRequestHandler, SessionKind};
pub use manager::{BackendManager, ManagerSettings, ReloadOutcome};
pub use router::{McpRouter, Scope};
pub use search::{InMemoryToolSearch, SearchHit, ToolSearch};
pub use types::*;
