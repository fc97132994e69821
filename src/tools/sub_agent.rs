//! Delegation of multi-step work to Claude Code running inside the container.
//!
//! A new session writes the task to a plan file first so the agent can re-read
//! it after context compaction; a resumed session only sends the follow-up
//! instruction and points back at that file.

use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{combine_output, str_arg, Tool, ToolContext};
use crate::session::SessionError;
use crate::util::{format_elapsed, shell_quote};

const PLAN_FILE: &str = "/home/assistant/task_plan.md";
const MODELS: [&str; 2] = ["sonnet", "opus"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Act,
    Plan,
}

/// The `{"type":"result"}` line printed by `claude --output-format json`.
#[derive(Debug, Default, Deserialize)]
struct AgentResult {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    result: String,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    num_turns: u32,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    session_id: String,
}

fn parse_result(output: &str) -> Option<AgentResult> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.contains("\"type\"") && line.contains("\"result\""))
        .filter_map(|line| serde_json::from_str::<AgentResult>(line).ok())
        .find(|parsed| parsed.kind == "result")
}

fn format_result(output: &str, model: &str, max_turns: u32, elapsed_secs: u64) -> String {
    let parsed = parse_result(output).unwrap_or_default();
    let response = if parsed.result.is_empty() {
        output.to_string()
    } else {
        parsed.result.clone()
    };
    let status = if parsed.is_error { "error" } else { "success" };

    let session_info = if parsed.session_id.is_empty() {
        String::new()
    } else {
        format!(" | **Session:** `{}`", parsed.session_id)
    };
    let resume_hint = if !parsed.session_id.is_empty() && parsed.num_turns >= max_turns {
        format!(
            "\n\n> Turn limit reached. To continue, call sub_agent with `resume_session_id=\"{}\"`",
            parsed.session_id
        )
    } else {
        String::new()
    };

    format!(
        "**Sub-Agent Completed** ({})\n**Model:** {} | **Turns:** {}/{} | **Cost:** ${:.4} | **Duration:** {}{}\n\n{}{}",
        status,
        model,
        parsed.num_turns,
        max_turns,
        parsed.total_cost_usd,
        format_elapsed(elapsed_secs),
        session_info,
        response,
        resume_hint
    )
}

fn system_prompt(file_base_url: &str, mode: Mode) -> String {
    let mode_block = match mode {
        Mode::Act => "",
        Mode::Plan => {
            "\n<mode>\nPLAN ONLY. Investigate and write a detailed plan to /mnt/user-data/outputs/plan.md.\nDo not modify project files or run destructive commands.\n</mode>\n"
        }
    };

    format!(
        "<critical_instruction>
Your task plan is saved at {plan}

BEFORE ANY ACTION:
1. Read {plan} to understand your full task
2. If context becomes compacted, re-read {plan} - it is your source of truth
3. The plan file contains all details you need

Never forget: {plan} has your complete instructions.
</critical_instruction>
{mode_block}
<environment>
You are working in a Linux container (Ubuntu 24) as an autonomous sub-agent.
FILE LOCATIONS:
- User uploads: /mnt/user-data/uploads (read-only)
- Workspace: /home/assistant
- Outputs: /mnt/user-data/outputs (URL: {url}/)
</environment>

<available_skills>
IMPORTANT: Read the relevant SKILL.md BEFORE starting any task!

- docx: /mnt/skills/public/docx/SKILL.md - Word documents creation and editing
- pdf: /mnt/skills/public/pdf/SKILL.md - PDF manipulation, forms, text extraction
- pptx: /mnt/skills/public/pptx/SKILL.md - PowerPoint presentations
- xlsx: /mnt/skills/public/xlsx/SKILL.md - Excel spreadsheets with formulas
- gitlab-explorer: /mnt/skills/public/gitlab-explorer/SKILL.md - GitLab operations (clone, MR, issues)
- skill-creator: /mnt/skills/public/skill-creator/SKILL.md - Creating new skills

Use `cat /mnt/skills/public/<skill>/SKILL.md` to read skill instructions.
</available_skills>",
        plan = PLAN_FILE,
        mode_block = mode_block,
        url = file_base_url
    )
}

/// Arguments after defaults and validation.
#[derive(Debug, PartialEq)]
struct Invocation {
    task: String,
    model: String,
    max_turns: u32,
    mode: Mode,
    working_directory: String,
    resume_session_id: Option<String>,
}

impl Invocation {
    fn from_args(args: &Value, default_model: &str, default_turns: u32) -> anyhow::Result<Self> {
        let task = str_arg(args, "task")?.to_string();

        let default_model = if MODELS.contains(&default_model) {
            default_model
        } else {
            "sonnet"
        };
        let model = args["model"]
            .as_str()
            .filter(|m| MODELS.contains(m))
            .unwrap_or(default_model)
            .to_string();

        let max_turns = args["max_turns"]
            .as_i64()
            .filter(|n| *n > 0)
            .map(|n| n.min(u32::MAX as i64) as u32)
            .unwrap_or(default_turns);

        let mode = match args["mode"].as_str() {
            Some("plan") => Mode::Plan,
            _ => Mode::Act,
        };

        let working_directory = args["working_directory"]
            .as_str()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or("/home/assistant")
            .to_string();

        let resume_session_id = args["resume_session_id"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(Self {
            task,
            model,
            max_turns,
            mode,
            working_directory,
            resume_session_id,
        })
    }

    fn base_flags(&self) -> String {
        format!(
            "--max-turns {} --permission-mode bypassPermissions --disallowedTools 'AskUserQuestion,ExitPlanMode' --output-format json",
            self.max_turns
        )
    }

    fn claude_command(&self, file_base_url: &str, user_email: Option<&str>) -> String {
        let headers_env = user_email
            .map(|email| {
                format!(
                    "ANTHROPIC_CUSTOM_HEADERS={} ",
                    shell_quote(&format!("x-openwebui-user-email: {}", email))
                )
            })
            .unwrap_or_default();

        match &self.resume_session_id {
            Some(session_id) => {
                let prompt = format!(
                    "Your original task is saved at {}. Read it if your context was compacted. New instruction from caller: {}",
                    PLAN_FILE, self.task
                );
                format!(
                    "cd {} && {}claude -p {} --resume {} {}",
                    shell_quote(&self.working_directory),
                    headers_env,
                    shell_quote(&prompt),
                    shell_quote(session_id),
                    self.base_flags()
                )
            }
            None => format!(
                "cd {} && {}claude -p {} --model {} --append-system-prompt {} {}",
                shell_quote(&self.working_directory),
                headers_env,
                shell_quote(&format!("Read and execute your task plan from {}", PLAN_FILE)),
                self.model,
                shell_quote(&system_prompt(file_base_url, self.mode)),
                self.base_flags()
            ),
        }
    }
}

/// Write the plan file through a quoted heredoc so the task is stored verbatim.
fn write_plan_command(task: &str) -> String {
    let mut delimiter = "TASK_PLAN_EOF".to_string();
    while task.lines().any(|line| line == delimiter) {
        delimiter.push('_');
    }
    format!(
        "cat > {} << '{d}'\n{}\n{d}",
        PLAN_FILE,
        task,
        d = delimiter
    )
}

/// Run Claude Code as an autonomous sub-agent.
pub struct SubAgent;

#[async_trait]
impl Tool for SubAgent {
    fn name(&self) -> &str {
        "sub_agent"
    }

    fn description(&self) -> &str {
        "Delegate complex, multi-step tasks to an autonomous sub-agent (documents, multi-file refactoring, test/fix cycles, research). Do NOT use for simple tasks you can do directly in 1-2 tool calls."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Detailed description of the task for the sub-agent to accomplish"
                },
                "description": {
                    "type": "string",
                    "description": "Why you are delegating this task to a sub-agent"
                },
                "model": {
                    "type": "string",
                    "enum": ["sonnet", "opus"],
                    "description": "'sonnet' (default, fast) or 'opus' (powerful, better for complex tasks)"
                },
                "max_turns": {
                    "type": "integer",
                    "description": "Maximum number of agentic turns"
                },
                "mode": {
                    "type": "string",
                    "enum": ["act", "plan"],
                    "description": "'act' executes the task (default), 'plan' only produces a plan"
                },
                "working_directory": {
                    "type": "string",
                    "description": "Working directory for the agent (default: /home/assistant)"
                },
                "resume_session_id": {
                    "type": "string",
                    "description": "Session ID from a previous result, to continue that session"
                }
            },
            "required": ["task", "description"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let chat_id = ctx.chat_id()?.to_string();
        let settings = &ctx.config.sub_agent;
        let invocation = Invocation::from_args(&args, &settings.default_model, settings.max_turns)?;

        tracing::info!(
            chat_id = %chat_id,
            model = %invocation.model,
            max_turns = invocation.max_turns,
            resume = invocation.resume_session_id.is_some(),
            "Starting sub-agent"
        );

        if invocation.resume_session_id.is_none() {
            let write = ctx
                .run(
                    &write_plan_command(&invocation.task),
                    None,
                    std::time::Duration::from_secs(30),
                )
                .await??;
            if write.exit_code != 0 {
                return Err(anyhow::anyhow!(
                    "Failed to write task plan: {}",
                    combine_output(&write)
                ));
            }
        }

        let file_base_url = format!(
            "{}/files/{}",
            ctx.config.file_server_url.trim_end_matches('/'),
            chat_id
        );
        let command =
            invocation.claude_command(&file_base_url, ctx.request.user_email.as_deref());

        let started = Instant::now();
        let output = match ctx.run(&command, None, settings.timeout).await? {
            Ok(output) => output,
            Err(SessionError::TimedOut(limit)) => {
                return Err(anyhow::anyhow!(
                    "Sub-agent timed out after {}",
                    format_elapsed(limit.as_secs())
                ))
            }
            Err(e) => return Err(e.into()),
        };
        let elapsed = started.elapsed().as_secs();

        tracing::info!(chat_id = %chat_id, exit_code = output.exit_code, elapsed_secs = elapsed, "Sub-agent finished");

        let raw = if output.stdout.trim().is_empty() {
            combine_output(&output)
        } else {
            output.stdout.clone()
        };
        Ok(format_result(
            &raw,
            &invocation.model,
            invocation.max_turns,
            elapsed,
        ))
    }
}
