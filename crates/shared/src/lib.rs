//! MCPHub Shared Types and Utilities
//!
//! Configuration entities, the configuration store interface and the error
//! types shared between the hub and its tooling.

pub mod error;
pub mod store;
pub mod types;

pub use error::*;
pub use store::{ConfigStore, MemoryConfigStore};
pub use types::*;
