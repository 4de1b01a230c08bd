//! Aggregating MCP bridge.
//!
//! Presents one MCP server to a downstream client while multiplexing many
//! upstream MCP servers behind it. Upstream tools are namespaced as
//! `<server>__<tool>`; instead of the full tool list the downstream sees
//! two synthetic tools, `search_tools` and `run_tool`, keeping its context
//! window small while every upstream tool stays invocable.

pub mod client;
pub mod config;
pub mod diff;
pub mod error;
pub mod index;
pub mod logging;
pub mod manager;
pub mod names;
pub mod observers;
pub mod policy;
pub mod registry;
pub mod search;
pub mod server;
pub mod transport;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{BridgeError, Result};
