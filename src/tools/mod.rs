//! MCP tools that act inside a chat's container.
//!
//! Every tool resolves the chat's session from the request context, creating
//! the container on first use, and runs its work through `bash -c` there.
//! Nothing touches the server's own filesystem.

mod bash;
mod file_ops;
mod sub_agent;
mod view;

pub use bash::BashTool;
pub use file_ops::{CreateFile, StrReplace};
pub use sub_agent::SubAgent;
pub use view::View;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::Config;
use crate::context::RequestContext;
use crate::session::{ExecOutput, SessionManager, SessionResult};
use crate::tokens::TokenClient;

/// Returned when a request carries no chat id.
pub const CHAT_ID_REQUIRED: &str = "Error: X-Chat-Id header is required.

Please provide the X-Chat-Id header in your request. This header is used to isolate
your container environment from other users.

If using LiteLLM, ensure extra_headers includes \"x-chat-id\" or \"x-openwebui-chat-id\".
If using direct MCP access, add: -H \"X-Chat-Id: your-unique-chat-id\"";

/// Everything a tool needs for one call.
pub struct ToolContext {
    pub request: RequestContext,
    pub sessions: Arc<SessionManager>,
    pub config: Arc<Config>,
    pub tokens: TokenClient,
}

impl ToolContext {
    /// The chat id, or the explanatory error when the header was missing.
    pub fn chat_id(&self) -> anyhow::Result<&str> {
        self.request
            .session_key()
            .ok_or_else(|| anyhow::anyhow!(CHAT_ID_REQUIRED))
    }

    /// Container environment for this request. Looks up a stored token when
    /// no token header was sent.
    pub async fn container_env(&self) -> HashMap<String, String> {
        let mut request = self.request.clone();
        if request.scm_token.is_none() {
            if let Some(email) = request.user_email.as_deref() {
                request.scm_token = self.tokens.fetch_scm_token(email).await;
            }
        }
        request.container_env(&self.config)
    }

    /// Run a command in this chat's container with the given limit.
    pub async fn run(
        &self,
        command: &str,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> anyhow::Result<SessionResult<ExecOutput>> {
        let chat_id = self.chat_id()?;
        let env = self.container_env().await;
        Ok(self
            .sessions
            .exec_with(chat_id, &env, command, stdin, timeout)
            .await)
    }
}

/// Stdout followed by stderr on its own line, as a model would read it.
pub fn combine_output(output: &ExecOutput) -> String {
    let mut text = output.stdout.clone();
    if !output.stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&output.stderr);
    }
    text
}

/// Name, description and input schema, as listed by `tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String>;
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a registry with every computer-use tool.
    pub fn new() -> Self {
        let mut tools: HashMap<String, Arc<dyn Tool>> = HashMap::new();

        tools.insert("bash_tool".to_string(), Arc::new(BashTool));
        tools.insert("str_replace".to_string(), Arc::new(StrReplace));
        tools.insert("create_file".to_string(), Arc::new(CreateFile));
        tools.insert("view".to_string(), Arc::new(View));
        tools.insert("sub_agent".to_string(), Arc::new(SubAgent));

        tracing::debug!("Tool registry ready with {} tools", tools.len());
        Self { tools }
    }

    /// List all available tools, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameters_schema(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> anyhow::Result<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown tool: {}", name))?;

        tracing::info!(tool = %name, chat_id = ?ctx.request.chat_id, "Executing tool");
        tool.execute(args, ctx).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Required string argument.
fn str_arg<'a>(args: &'a Value, name: &str) -> anyhow::Result<&'a str> {
    args[name]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing '{}' argument", name))
}


#[cfg(test)]
mod tests {
    use super::test_support::context_with;
    use super::*;
    use crate::session::InMemoryRuntime;
    use serde_json::json;

    #[test]
    fn registry_lists_all_tools_in_order() {
        let names: Vec<String> = ToolRegistry::new()
            .list_tools()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(
            names,
            vec!["bash_tool", "create_file", "str_replace", "sub_agent", "view"]
        );
    }

    #[test]
    fn combine_output_joins_streams() {
        let output = ExecOutput {
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            exit_code: 0,
        };
        assert_eq!(combine_output(&output), "out\nerr");

        let only_err = ExecOutput {
            stderr: "err".to_string(),
            ..Default::default()
        };
        assert_eq!(combine_output(&only_err), "err");
    }

    #[tokio::test]
    async fn missing_chat_id_explains_header() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let ctx = context_with(runtime.clone(), None);

        let err = ToolRegistry::new()
            .execute("bash_tool", json!({"command": "ls", "description": "d"}), &ctx)
            .await
            .expect_err("chat id required");
        assert!(err.to_string().contains("X-Chat-Id header is required"));
        assert!(runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let ctx = context_with(Arc::new(InMemoryRuntime::new()), Some("c"));
        let err = ToolRegistry::new()
            .execute("rm_rf", json!({}), &ctx)
            .await
            .expect_err("unknown tool");
        assert_eq!(err.to_string(), "Unknown tool: rm_rf");
    }
}
