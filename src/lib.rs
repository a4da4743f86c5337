//! code-sandbox daemon library
//!
//! This crate provides the core functionality for the code-sandbox daemon:
//! - Configuration from a JSON file and environment overrides
//! - Container runtime trait with a Docker implementation and orphan sweep
//! - Per-owner sessions with idle reaping and a disconnect grace period
//! - Code execution with streamed output and persisted records
//! - Remote debugging over the Debug Adapter Protocol
//! - MCP server implementation using rmcp

pub mod config;
pub mod dap;
pub mod debug;
pub mod error;
pub mod events;
pub mod execution;
pub mod language;
pub mod mcp;
pub mod runtime;
pub mod sandbox;
pub mod session;

#[cfg(test)]
mod testing;
