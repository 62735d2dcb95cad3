//! Authenticated MCP server over Streamable HTTP.
//!
//! Exposes registered tools (the built-in `calculator` among them) to MCP
//! clients. Each client opens a session with `initialize`; the server tracks
//! sessions in memory and tears them down on DELETE, on transport closure,
//! or at shutdown.

pub mod auth;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod tools;
pub mod transport;

pub mod schema;
