//! File edit tools: exact string replacement and file creation.
//!
//! Content travels to the container as JSON on stdin of a small python script,
//! so large files never hit argument length limits or shell quoting.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{combine_output, str_arg, Tool, ToolContext};
use crate::session::SessionError;
use crate::util::shell_quote;

const STR_REPLACE_SCRIPT: &str = r#"
import sys
import json

try:
    data = json.loads(sys.stdin.read())
    path = data['path']
    old_str = data['old_str']
    new_str = data['new_str']

    with open(path, 'r') as f:
        content = f.read()

    if old_str not in content:
        print(f"Error: old_str not found in {path}")
        sys.exit(1)

    with open(path, 'w') as f:
        f.write(content.replace(old_str, new_str, 1))

    print(f"Successfully replaced text in {path}")
except Exception as e:
    print(f"Error: {e}")
    sys.exit(1)
"#;

const CREATE_FILE_SCRIPT: &str = r#"
import sys
import json
import os

try:
    data = json.loads(sys.stdin.read())
    path = data['path']
    parent = os.path.dirname(path)
    if parent:
        os.makedirs(parent, exist_ok=True)

    with open(path, 'w') as f:
        f.write(data['file_text'])

    print(f"Successfully created {path}")
except Exception as e:
    print(f"Error: {e}")
    sys.exit(1)
"#;

/// Run one of the scripts above with `payload` on stdin.
async fn run_script(ctx: &ToolContext, script: &str, payload: Value) -> anyhow::Result<String> {
    let command = format!("python3 -c {}", shell_quote(script));
    let stdin = serde_json::to_vec(&payload)?;
    let timeout = ctx.config.command_timeout;

    match ctx.run(&command, Some(stdin), timeout).await? {
        Ok(output) => {
            let text = combine_output(&output).trim_end().to_string();
            if output.exit_code == 0 {
                Ok(text)
            } else if text.is_empty() {
                Err(anyhow::anyhow!("script exited with code {}", output.exit_code))
            } else {
                Err(anyhow::anyhow!(text))
            }
        }
        Err(SessionError::TimedOut(limit)) => Err(anyhow::anyhow!(
            "Command timed out after {} seconds",
            limit.as_secs()
        )),
        Err(e) => Err(e.into()),
    }
}

/// Replace the first occurrence of a string in a file.
pub struct StrReplace;

#[async_trait]
impl Tool for StrReplace {
    fn name(&self) -> &str {
        "str_replace"
    }

    fn description(&self) -> &str {
        "Replace a unique string in a file with another string. The string to replace must appear exactly once in the file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "description": {
                    "type": "string",
                    "description": "Why I'm making this edit"
                },
                "path": {
                    "type": "string",
                    "description": "Path to the file to edit"
                },
                "old_str": {
                    "type": "string",
                    "description": "String to replace (must be unique in file)"
                },
                "new_str": {
                    "type": "string",
                    "description": "String to replace with (empty to delete)",
                    "default": ""
                }
            },
            "required": ["description", "path", "old_str"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        ctx.chat_id()?;
        let path = str_arg(&args, "path")?;
        let old_str = str_arg(&args, "old_str")?;
        let new_str = args["new_str"].as_str().unwrap_or("");

        if old_str == new_str {
            return Err(anyhow::anyhow!(
                "old_str and new_str are identical. No changes would be made."
            ));
        }

        run_script(
            ctx,
            STR_REPLACE_SCRIPT,
            json!({"path": path, "old_str": old_str, "new_str": new_str}),
        )
        .await
    }
}

/// Create (or overwrite) a file, making parent directories as needed.
pub struct CreateFile;

#[async_trait]
impl Tool for CreateFile {
    fn name(&self) -> &str {
        "create_file"
    }

    fn description(&self) -> &str {
        "Create a new file with content in the container."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "description": {
                    "type": "string",
                    "description": "Why I'm creating this file. ALWAYS PROVIDE THIS PARAMETER FIRST."
                },
                "file_text": {
                    "type": "string",
                    "description": "Content to write to the file. ALWAYS PROVIDE THIS PARAMETER SECOND."
                },
                "path": {
                    "type": "string",
                    "description": "Path to the file to create. ALWAYS PROVIDE THIS PARAMETER LAST."
                }
            },
            "required": ["description", "file_text", "path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let path = str_arg(&args, "path")?;
        let file_text = str_arg(&args, "file_text")?;

        run_script(
            ctx,
            CREATE_FILE_SCRIPT,
            json!({"path": path, "file_text": file_text}),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ExecOutput, InMemoryRuntime};
    use crate::tools::test_support::context_with;
    use std::sync::Arc;

    #[tokio::test]
    async fn identical_strings_are_rejected_without_exec() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let ctx = context_with(runtime.clone(), Some("c"));

        let err = StrReplace
            .execute(
                json!({"description": "d", "path": "/tmp/a", "old_str": "x", "new_str": "x"}),
                &ctx,
            )
            .await
            .expect_err("identical strings");
        assert!(err.to_string().contains("identical"));
        assert!(runtime.exec_log().is_empty());
        assert!(runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn replacement_ships_json_on_stdin() {
        let runtime = Arc::new(InMemoryRuntime::new().with_exec_handler(|_| ExecOutput {
            stdout: "Successfully replaced text in /home/assistant/a.py\n".to_string(),
            ..Default::default()
        }));
        let ctx = context_with(runtime.clone(), Some("c"));

        let out = StrReplace
            .execute(
                json!({"description": "d", "path": "/home/assistant/a.py", "old_str": "it's", "new_str": "it is"}),
                &ctx,
            )
            .await
            .expect("replace");
        assert_eq!(out, "Successfully replaced text in /home/assistant/a.py");

        let (_, request) = runtime.exec_log().pop().expect("exec");
        assert!(request.command.starts_with("python3 -c '"));
        let payload: Value =
            serde_json::from_slice(request.stdin.as_deref().expect("stdin")).expect("json");
        assert_eq!(payload["old_str"], "it's");
        assert_eq!(payload["new_str"], "it is");
    }

    #[tokio::test]
    async fn missing_old_str_surfaces_script_error() {
        let runtime = Arc::new(InMemoryRuntime::new().with_exec_handler(|_| ExecOutput {
            stdout: "Error: old_str not found in /x\n".to_string(),
            exit_code: 1,
            ..Default::default()
        }));
        let ctx = context_with(runtime, Some("c"));

        let err = StrReplace
            .execute(
                json!({"description": "d", "path": "/x", "old_str": "nope"}),
                &ctx,
            )
            .await
            .expect_err("not found");
        assert_eq!(err.to_string(), "Error: old_str not found in /x");
    }

    #[tokio::test]
    async fn create_file_sends_content() {
        let runtime = Arc::new(InMemoryRuntime::new().with_exec_handler(|_| ExecOutput {
            stdout: "Successfully created /home/assistant/out/report.md".to_string(),
            ..Default::default()
        }));
        let ctx = context_with(runtime.clone(), Some("c"));

        let out = CreateFile
            .execute(
                json!({"description": "d", "file_text": "# Report\n", "path": "/home/assistant/out/report.md"}),
                &ctx,
            )
            .await
            .expect("create");
        assert!(out.starts_with("Successfully created"));

        let (_, request) = runtime.exec_log().pop().expect("exec");
        let payload: Value =
            serde_json::from_slice(request.stdin.as_deref().expect("stdin")).expect("json");
        assert_eq!(payload["file_text"], "# Report\n");
    }
}
