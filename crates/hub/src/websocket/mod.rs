//! WebSocket support for local MCP sessions
//!
//! # Architecture
//!
//! - **Connection**: one open session with its outbound queue
//! - **State**: registry of open sessions, used for tools-changed fan-out
//! - **Handler**: Axum WebSocket route handlers

pub mod connection;
pub mod handler;
pub mod state;

pub use handler::{ws_group_handler, ws_handler};
pub use state::SessionRegistry;
