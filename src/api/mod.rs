//! HTTP API for the computer-use server.
//!
//! ## Endpoints
//!
//! - `POST /mcp` - MCP JSON-RPC (`initialize`, `tools/list`, `tools/call`)
//! - `GET /mcp` - Server info and the headers it reads
//! - `GET /api/sessions` - Managed containers
//! - `GET /api/uploads/{chat_id}/manifest` - MD5 of every uploaded file
//! - `POST /api/uploads/{chat_id}/{path}` - Upload a file (multipart `file`)
//! - `GET /files/{chat_id}/archive` - Zip of the chat's outputs
//! - `GET /files/{chat_id}/{path}` - Download one output file
//! - `GET /health` - Health check

mod auth;
mod files;
pub mod mcp;
mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
