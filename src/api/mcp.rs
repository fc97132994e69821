//! MCP endpoint (JSON-RPC 2.0 over plain HTTP POST).
//!
//! Each request's headers are resolved into a `RequestContext`, which decides
//! the chat container every tool call runs in.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use super::routes::AppState;
use super::types::{
    HeaderHelp, JsonRpcRequest, JsonRpcResponse, McpInfo, McpToolSummary, ToolResult,
};
use crate::context::{header_names, RequestContext};
use crate::tools::ToolContext;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "computer-use-mcp";

const PARSE_ERROR: i32 = -32700;
const INVALID_PARAMS: i32 = -32602;
const METHOD_NOT_FOUND: i32 = -32601;

/// Header name as documented (`x-chat-id` → `X-Chat-Id`).
fn display_header(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// `GET /mcp`: what this endpoint offers and which headers it reads.
pub async fn info(State(state): State<Arc<AppState>>) -> Json<McpInfo> {
    let tools = state
        .tools
        .list_tools()
        .into_iter()
        .map(|t| McpToolSummary {
            name: t.name,
            description: t.description,
        })
        .collect();

    let optional = header_names()
        .map(|(direct, _)| direct)
        .filter(|direct| *direct != "x-chat-id")
        .map(display_header)
        .collect();

    Json(McpInfo {
        name: SERVER_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: "Computer Use tools via MCP - execute commands in isolated Docker containers"
            .to_string(),
        tools,
        headers: HeaderHelp {
            required: vec!["X-Chat-Id".to_string()],
            optional,
        },
    })
}

/// `POST /mcp`: one JSON-RPC message per call. Notifications (no `id`) are
/// answered with `202 Accepted` and no body.
pub async fn handle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return Json(JsonRpcResponse::error(
                Value::Null,
                PARSE_ERROR,
                format!("Parse error: {}", e),
            ))
            .into_response()
        }
    };

    let context = RequestContext::from_header_map(&headers);
    tracing::debug!(method = %request.method, chat_id = ?context.chat_id, "MCP request");

    if request.is_notification() {
        return StatusCode::ACCEPTED.into_response();
    }

    Json(dispatch(&state, request, context).await).into_response()
}

async fn dispatch(state: &AppState, request: JsonRpcRequest, context: RequestContext) -> JsonRpcResponse {
    let id = request.id.clone().unwrap_or(Value::Null);
    match request.method.as_str() {
        "initialize" => JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        ),
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => JsonRpcResponse::success(id, json!({ "tools": state.tools.list_tools() })),
        "tools/call" => {
            let Some(name) = request.params["name"].as_str() else {
                return JsonRpcResponse::error(id, INVALID_PARAMS, "Missing tool name");
            };
            if !state.tools.has_tool(name) {
                return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Unknown tool: {}", name));
            }
            let arguments = match &request.params["arguments"] {
                Value::Null => json!({}),
                other => other.clone(),
            };

            let ctx = ToolContext {
                request: context,
                sessions: Arc::clone(&state.sessions),
                config: Arc::clone(&state.config),
                tokens: state.tokens.clone(),
            };

            let result = match state.tools.execute(name, arguments, &ctx).await {
                Ok(text) => ToolResult::text(text, false),
                Err(e) => {
                    let message = e.to_string();
                    tracing::warn!(tool = %name, error = %message, "Tool call failed");
                    if message.starts_with("Error") {
                        ToolResult::text(message, true)
                    } else {
                        ToolResult::text(format!("Error: {}", message), true)
                    }
                }
            };
            match serde_json::to_value(result) {
                Ok(value) => JsonRpcResponse::success(id, value),
                Err(e) => JsonRpcResponse::error(id, -32603, e.to_string()),
            }
        }
        other => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", other)),
    }
}
