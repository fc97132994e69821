//! View text files (numbered lines) and directory listings.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{combine_output, str_arg, Tool, ToolContext};
use crate::session::SessionError;
use crate::util::{shell_quote, truncate_middle};

/// Output longer than this is cut when no range was requested.
const VIEW_LIMIT: usize = 16_000;
const VIEW_KEEP: usize = 8_000;

/// Extensions `cat` cannot usefully show, with what to do instead.
/// `{path}` is replaced with the quoted path.
const BINARY_HINTS: &[(&str, &str)] = &[
    (".xlsx", "Excel spreadsheet. Read SKILL first:\n  view /mnt/skills/public/xlsx/SKILL.md"),
    (".xls", "Excel spreadsheet (old). Read SKILL first:\n  view /mnt/skills/public/xlsx/SKILL.md"),
    (".docx", "Word document. Read SKILL first:\n  view /mnt/skills/public/docx/SKILL.md"),
    (".pptx", "PowerPoint. Read SKILL first:\n  view /mnt/skills/public/pptx/SKILL.md"),
    (".pdf", "PDF document. Read SKILL first:\n  view /mnt/skills/public/pdf/SKILL.md"),
    (".zip", "ZIP archive. Use: unzip -l {path}"),
    (".tar", "TAR archive. Use: tar -tvf {path}"),
    (".gz", "Gzip file. Use: gunzip -c {path} | head -n 100"),
    (".jpg", "JPEG image. This is a binary file."),
    (".jpeg", "JPEG image. This is a binary file."),
    (".png", "PNG image. This is a binary file."),
    (".gif", "GIF image. This is a binary file."),
    (".webp", "WebP image. This is a binary file."),
    (".mp4", "MP4 video. This is a binary file."),
    (".mov", "QuickTime video. This is a binary file."),
];

fn binary_hint(path: &str) -> Option<(&'static str, String)> {
    let lower = path.to_lowercase();
    BINARY_HINTS
        .iter()
        .find(|(ext, _)| lower.ends_with(ext))
        .map(|(ext, hint)| (*ext, hint.replace("{path}", &shell_quote(path))))
}

/// Parse `[start, end]`; `end == -1` reads to the end of the file.
fn parse_range(value: &Value) -> anyhow::Result<Option<(u64, Option<u64>)>> {
    if value.is_null() {
        return Ok(None);
    }
    let items = value
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| anyhow::anyhow!("view_range must be [start_line, end_line]"))?;
    let start = items[0]
        .as_i64()
        .filter(|s| *s >= 1)
        .ok_or_else(|| anyhow::anyhow!("view_range start must be a line number >= 1"))?;
    let end = items[1]
        .as_i64()
        .ok_or_else(|| anyhow::anyhow!("view_range end must be an integer"))?;
    match end {
        -1 => Ok(Some((start as u64, None))),
        e if e >= start => Ok(Some((start as u64, Some(e as u64)))),
        _ => Err(anyhow::anyhow!(
            "view_range end must be >= start, or -1 for end of file"
        )),
    }
}

/// Shell script that prints a file, a range of it, or a directory listing.
fn view_command(path: &str, range: Option<(u64, Option<u64>)>) -> String {
    let quoted = shell_quote(path);

    let file_branch = match binary_hint(path) {
        Some((ext, hint)) => format!(
            "echo \"Error: Cannot view binary file with 'cat'. This is a {} file.\"\n    echo \"\"\n    echo {}\n    exit 1",
            ext,
            shell_quote(&hint)
        ),
        None => match range {
            Some((start, Some(end))) => format!("sed -n '{},{}p' {} | cat -n", start, end, quoted),
            Some((start, None)) => format!("sed -n '{},$p' {} | cat -n", start, quoted),
            None => format!("cat -n {}", quoted),
        },
    };

    format!(
        "if [ -f {q} ]; then\n    {file}\nelif [ -d {q} ]; then\n    ls -lah {q}\nelse\n    echo \"Error: path not found\"\n    exit 1\nfi",
        q = quoted,
        file = file_branch
    )
}

/// View a file or directory.
pub struct View;

#[async_trait]
impl Tool for View {
    fn name(&self) -> &str {
        "view"
    }

    fn description(&self) -> &str {
        "View text files or directory listings. Directories are listed with details; text files are shown with line numbers and an optional view_range. Binary files (.xlsx, .docx, .pptx, .pdf, etc.) are rejected with instructions to read the matching SKILL.md."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "description": {
                    "type": "string",
                    "description": "Why I need to view this"
                },
                "path": {
                    "type": "string",
                    "description": "Absolute path to file or directory, e.g. `/repo/file.py` or `/repo`"
                },
                "view_range": {
                    "type": "array",
                    "items": {"type": "integer"},
                    "minItems": 2,
                    "maxItems": 2,
                    "description": "Optional line range [start_line, end_line]. Use [start, -1] to view from start to end."
                }
            },
            "required": ["description", "path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        ctx.chat_id()?;
        let path = str_arg(&args, "path")?;
        let range = parse_range(&args["view_range"])?;

        let output = match ctx
            .run(&view_command(path, range), None, ctx.config.command_timeout)
            .await?
        {
            Ok(output) => output,
            Err(SessionError::TimedOut(limit)) => {
                return Err(anyhow::anyhow!(
                    "Command timed out after {} seconds",
                    limit.as_secs()
                ))
            }
            Err(e) => return Err(e.into()),
        };

        let text = combine_output(&output);
        if output.exit_code != 0 {
            return Err(anyhow::anyhow!(if text.is_empty() {
                format!("Error: exit code {}", output.exit_code)
            } else {
                text.trim_end().to_string()
            }));
        }
        if text.is_empty() {
            return Ok("Error: No output".to_string());
        }
        if range.is_some() {
            return Ok(text);
        }

        let total = text.chars().count();
        let notice = format!(
            "\n\n... [File truncated - middle omitted. Total: {} chars. Use view_range.] ...\n\n",
            total
        );
        Ok(truncate_middle(&text, VIEW_LIMIT, VIEW_KEEP, &notice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ExecOutput, InMemoryRuntime};
    use crate::tools::test_support::context_with;
    use std::sync::Arc;

    #[test]
    fn builds_range_commands() {
        let cmd = view_command("/home/assistant/a.py", Some((10, Some(20))));
        assert!(cmd.contains("sed -n '10,20p' /home/assistant/a.py | cat -n"));

        let cmd = view_command("/home/assistant/a.py", Some((5, None)));
        assert!(cmd.contains("sed -n '5,$p' /home/assistant/a.py | cat -n"));

        let cmd = view_command("/home/assistant/my file.txt", None);
        assert!(cmd.contains("cat -n '/home/assistant/my file.txt'"));
        assert!(cmd.contains("ls -lah '/home/assistant/my file.txt'"));
    }

    #[test]
    fn binary_files_get_hints() {
        let cmd = view_command("/mnt/user-data/uploads/Report.XLSX", None);
        assert!(cmd.contains("This is a .xlsx file."));
        assert!(cmd.contains("/mnt/skills/public/xlsx/SKILL.md"));
        assert!(!cmd.contains("cat -n"));

        let (_, hint) = binary_hint("/tmp/a b.zip").expect("zip hint");
        assert_eq!(hint, "ZIP archive. Use: unzip -l '/tmp/a b.zip'");
    }

    #[test]
    fn rejects_malformed_ranges() {
        assert!(parse_range(&json!([1])).is_err());
        assert!(parse_range(&json!([0, 5])).is_err());
        assert!(parse_range(&json!([9, 3])).is_err());
        assert_eq!(parse_range(&json!([3, -1])).expect("to eof"), Some((3, None)));
        assert_eq!(parse_range(&Value::Null).expect("none"), None);
    }

    #[tokio::test]
    async fn long_output_is_truncated_in_the_middle() {
        let body = "x".repeat(10_000) + &"y".repeat(10_000);
        let runtime = Arc::new(InMemoryRuntime::new().with_exec_handler(move |_| ExecOutput {
            stdout: body.clone(),
            ..Default::default()
        }));
        let ctx = context_with(runtime, Some("c"));

        let out = View
            .execute(json!({"description": "d", "path": "/big.txt"}), &ctx)
            .await
            .expect("view");
        assert!(out.starts_with(&"x".repeat(8_000)));
        assert!(out.ends_with(&"y".repeat(8_000)));
        assert!(out.contains("Total: 20000 chars. Use view_range."));
    }

    #[tokio::test]
    async fn ranged_output_is_not_truncated() {
        let body = "z".repeat(20_000);
        let runtime = Arc::new(InMemoryRuntime::new().with_exec_handler(move |_| ExecOutput {
            stdout: body.clone(),
            ..Default::default()
        }));
        let ctx = context_with(runtime, Some("c"));

        let out = View
            .execute(
                json!({"description": "d", "path": "/big.txt", "view_range": [1, -1]}),
                &ctx,
            )
            .await
            .expect("view");
        assert_eq!(out.len(), 20_000);
    }

    #[tokio::test]
    async fn missing_path_is_an_error() {
        let runtime = Arc::new(InMemoryRuntime::new().with_exec_handler(|_| ExecOutput {
            stdout: "Error: path not found\n".to_string(),
            exit_code: 1,
            ..Default::default()
        }));
        let ctx = context_with(runtime, Some("c"));
        let err = View
            .execute(json!({"description": "d", "path": "/nope"}), &ctx)
            .await
            .expect_err("not found");
        assert_eq!(err.to_string(), "Error: path not found");
    }
}
