//! Shell command execution inside the chat container.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{combine_output, str_arg, Tool, ToolContext};
use crate::session::SessionError;

/// Run a bash command.
pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash_tool"
    }

    fn description(&self) -> &str {
        "Run a bash command in the container. Returns stdout followed by stderr."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Bash command to run in container"
                },
                "description": {
                    "type": "string",
                    "description": "Why I'm running this command"
                }
            },
            "required": ["command", "description"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let command = str_arg(&args, "command")?;
        let timeout = ctx.config.command_timeout;

        match ctx.run(command, None, timeout).await? {
            Ok(output) => {
                let text = combine_output(&output);
                if text.is_empty() {
                    Ok(format!("[Exit code: {}]", output.exit_code))
                } else {
                    Ok(text)
                }
            }
            Err(SessionError::TimedOut(limit)) => Ok(format!(
                "[Command timed out after {} seconds]",
                limit.as_secs()
            )),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ExecOutput, InMemoryRuntime};
    use crate::tools::test_support::context_with;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn returns_stdout_then_stderr() {
        let runtime = Arc::new(InMemoryRuntime::new().with_exec_handler(|_| ExecOutput {
            stdout: "hello".to_string(),
            stderr: "warning".to_string(),
            exit_code: 0,
        }));
        let ctx = context_with(runtime.clone(), Some("chat-1"));

        let out = BashTool
            .execute(json!({"command": "echo hello", "description": "greet"}), &ctx)
            .await
            .expect("bash");
        assert_eq!(out, "hello\nwarning");

        let (name, request) = runtime.exec_log().pop().expect("exec logged");
        assert_eq!(name, "owui-chat-chat-1");
        assert_eq!(request.command, "echo hello");
        assert_eq!(request.timeout, Some(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn silent_command_reports_exit_code() {
        let runtime = Arc::new(InMemoryRuntime::new().with_exec_handler(|_| ExecOutput {
            exit_code: 3,
            ..Default::default()
        }));
        let ctx = context_with(runtime, Some("chat-1"));
        let out = BashTool
            .execute(json!({"command": "exit 3", "description": "d"}), &ctx)
            .await
            .expect("bash");
        assert_eq!(out, "[Exit code: 3]");
    }

    #[tokio::test]
    async fn timeout_is_reported_as_text() {
        let runtime = Arc::new(InMemoryRuntime::new().with_exec_duration(Duration::from_secs(30)));
        let mut ctx = context_with(runtime, Some("chat-1"));
        let mut config = (*ctx.config).clone();
        config.command_timeout = Duration::from_millis(20);
        ctx.config = Arc::new(config);

        let out = BashTool
            .execute(json!({"command": "sleep 30", "description": "d"}), &ctx)
            .await
            .expect("bash");
        assert_eq!(out, "[Command timed out after 0 seconds]");
    }

    #[tokio::test]
    async fn container_env_carries_request_identity() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let mut ctx = context_with(runtime.clone(), Some("chat-9"));
        ctx.request.user_email = Some("dev@example.com".to_string());
        ctx.request.scm_token = Some("glpat-x".to_string());

        BashTool
            .execute(json!({"command": "true", "description": "d"}), &ctx)
            .await
            .expect("bash");

        let spec = runtime.spec("owui-chat-chat-9").expect("created");
        assert_eq!(spec.env["GITLAB_TOKEN"], "glpat-x");
        assert_eq!(spec.env["GIT_AUTHOR_EMAIL"], "dev@example.com");
    }
}
