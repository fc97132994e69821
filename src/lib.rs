//! # Computer Use Server
//!
//! MCP server that gives each chat its own Docker container to work in.
//!
//! This library provides:
//! - Per-chat container sessions, created on first use and restarted when stopped
//! - MCP tools (`bash_tool`, `str_replace`, `create_file`, `view`, `sub_agent`)
//!   that run inside the chat's container
//! - A file server for per-chat uploads and outputs
//!
//! ## Request Flow
//!
//! ```text
//!   POST /mcp (X-Chat-Id, X-User-Email, ...)
//!              │
//!              ▼
//!      RequestContext::from_header_map
//!              │
//!              ▼
//!      ToolRegistry::execute ──► SessionManager::exec_with
//!                                        │
//!                                        ▼
//!                              ContainerRuntime (Docker)
//! ```
//!
//! ## Modules
//! - `context`: request header resolution
//! - `session`: container naming, lifecycle and command execution
//! - `tools`: the MCP tools
//! - `tokens`: stored SCM token lookup
//! - `api`: HTTP routes

pub mod api;
pub mod config;
pub mod context;
pub mod session;
pub mod tokens;
pub mod tools;
pub mod util;

pub use config::Config;
pub use context::RequestContext;
pub use session::{SessionError, SessionManager};
