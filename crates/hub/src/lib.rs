//! MCPHub Library
//!
//! Aggregates upstream MCP servers into one catalog and serves it over HTTP,
//! local WebSocket sessions and outbound endpoint bridges.

pub mod bridge;
pub mod config;
pub mod error;
pub mod mcp;
pub mod reconnect;
pub mod routes;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
