//! Configuration management for the computer-use server.
//!
//! Configuration is read from environment variables:
//! - `HOST` / `PORT` - Listen address. Defaults to `0.0.0.0:8081`.
//! - `DOCKER_SOCKET` - Optional. `unix:///path`, `tcp://host:port` or `http://host:port`.
//!   Defaults to the local Docker socket.
//! - `DOCKER_IMAGE` - Image for chat containers. Defaults to `computer-use:latest`.
//! - `CONTAINER_MEM_LIMIT` - Memory ceiling per container (`512m`, `2g`). Defaults to `2g`.
//! - `CONTAINER_CPU_LIMIT` - CPU ceiling per container in cores. Defaults to `1.0`.
//! - `COMMAND_TIMEOUT` - Seconds before a tool command is killed. Defaults to `120`.
//! - `RUNTIME_TIMEOUT` - Seconds allowed for a Docker lifecycle call. Defaults to `60`.
//! - `ENABLE_NETWORK` - Network access inside containers. Defaults to `true`.
//! - `USER_DATA_BASE_PATH` - Host path holding `<chat>/uploads` and `<chat>/outputs`
//!   as seen by the Docker daemon. Defaults to `/tmp/computer-use-data`.
//! - `BASE_DATA_DIR` - The same tree as seen by this process (file server). Defaults to `/data`.
//! - `SKILLS_PATH` - Optional host path bound read-only at `/mnt/skills`.
//! - `FILE_SERVER_URL` - Public URL of this server, used in sub-agent prompts.
//! - `CONTAINER_IDLE_TIMEOUT` - Seconds of inactivity before a container stops itself
//!   (`0` disables). Defaults to `600`.
//! - `MCP_API_KEY` - Optional bearer key required on `/mcp` and `/api/sessions`.
//! - `MCP_TOKENS_URL` / `MCP_TOKENS_API_KEY` - Optional token-wrapper service.
//! - `GITLAB_HOST`, `ANTHROPIC_API_KEY`, `ANTHROPIC_BASE_URL` - Defaults used when the
//!   request headers do not carry them.
//! - `SUB_AGENT_DEFAULT_MODEL`, `SUB_AGENT_MAX_TURNS`, `SUB_AGENT_TIMEOUT` - Sub-agent defaults.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::util::env_var_bool;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Container shape applied to every chat container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Docker endpoint (None = local defaults)
    pub docker_socket: Option<String>,

    /// Image reference for chat containers
    pub image: String,

    /// Memory ceiling in bytes
    pub mem_limit_bytes: i64,

    /// CPU ceiling in cores
    pub cpu_limit: f64,

    /// Network access inside containers
    pub enable_network: bool,

    /// Host-side base path for per-chat uploads/outputs
    pub user_data_base_path: PathBuf,

    /// Optional host-side skills directory
    pub skills_path: Option<PathBuf>,

    /// Idle auto-shutdown, None when disabled
    pub idle_timeout: Option<Duration>,

    /// Bound on each Docker lifecycle call
    pub runtime_timeout: Duration,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            docker_socket: None,
            image: "computer-use:latest".to_string(),
            mem_limit_bytes: 2 * 1024 * 1024 * 1024,
            cpu_limit: 1.0,
            enable_network: true,
            user_data_base_path: PathBuf::from("/tmp/computer-use-data"),
            skills_path: None,
            idle_timeout: Some(Duration::from_secs(600)),
            runtime_timeout: Duration::from_secs(60),
        }
    }
}

/// Sub-agent (Claude Code inside the container) defaults.
#[derive(Debug, Clone)]
pub struct SubAgentConfig {
    pub default_model: String,
    pub max_turns: u32,
    pub timeout: Duration,
}

impl Default for SubAgentConfig {
    fn default() -> Self {
        Self {
            default_model: "sonnet".to_string(),
            max_turns: 30,
            timeout: Duration::from_secs(600),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Chat container settings
    pub container: ContainerConfig,

    /// Per-command timeout for tools
    pub command_timeout: Duration,

    /// Local view of the per-chat data tree
    pub data_dir: PathBuf,

    /// Public base URL of the file server
    pub file_server_url: String,

    /// Bearer key for MCP routes (None = open, development mode)
    pub mcp_api_key: Option<String>,

    /// Token-wrapper service
    pub tokens_url: Option<String>,
    pub tokens_api_key: Option<String>,

    /// Defaults for values that may also arrive in headers
    pub gitlab_host: String,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: String,

    /// Sub-agent defaults
    pub sub_agent: SubAgentConfig,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

/// Parse a Docker-style memory size (`512m`, `2g`, `1024k`, `1073741824`).
pub fn parse_memory_limit(value: &str) -> Option<i64> {
    let value = value.trim().to_lowercase();
    let value = value.strip_suffix('b').unwrap_or(&value);
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024_i64),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        c if c.is_ascii_digit() => (value, 1),
        _ => return None,
    };
    let n: f64 = digits.trim().parse().ok()?;
    if n <= 0.0 {
        return None;
    }
    Some((n * multiplier as f64) as i64)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when a numeric or size variable
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env_parse("PORT", "8081")?;

        let mem_raw = std::env::var("CONTAINER_MEM_LIMIT").unwrap_or_else(|_| "2g".to_string());
        let mem_limit_bytes = parse_memory_limit(&mem_raw).ok_or_else(|| {
            ConfigError::InvalidValue("CONTAINER_MEM_LIMIT".to_string(), mem_raw.clone())
        })?;

        let cpu_limit: f64 = env_parse("CONTAINER_CPU_LIMIT", "1.0")?;
        if cpu_limit <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "CONTAINER_CPU_LIMIT".to_string(),
                "must be positive".to_string(),
            ));
        }

        let idle_secs: u64 = env_parse("CONTAINER_IDLE_TIMEOUT", "600")?;
        let runtime_secs: u64 = env_parse("RUNTIME_TIMEOUT", "60")?;
        let command_secs: u64 = env_parse("COMMAND_TIMEOUT", "120")?;

        let container = ContainerConfig {
            docker_socket: env_opt("DOCKER_SOCKET"),
            image: std::env::var("DOCKER_IMAGE")
                .unwrap_or_else(|_| "computer-use:latest".to_string()),
            mem_limit_bytes,
            cpu_limit,
            enable_network: env_var_bool("ENABLE_NETWORK", true),
            user_data_base_path: std::env::var("USER_DATA_BASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/computer-use-data")),
            skills_path: env_opt("SKILLS_PATH").map(PathBuf::from),
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            runtime_timeout: Duration::from_secs(runtime_secs.max(1)),
        };

        let sub_agent = SubAgentConfig {
            default_model: std::env::var("SUB_AGENT_DEFAULT_MODEL")
                .unwrap_or_else(|_| "sonnet".to_string()),
            max_turns: env_parse("SUB_AGENT_MAX_TURNS", "30")?,
            timeout: Duration::from_secs(env_parse("SUB_AGENT_TIMEOUT", "600")?),
        };

        Ok(Self {
            host,
            port,
            container,
            command_timeout: Duration::from_secs(command_secs.max(1)),
            data_dir: std::env::var("BASE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/data")),
            file_server_url: std::env::var("FILE_SERVER_URL")
                .unwrap_or_else(|_| "http://localhost:8081".to_string()),
            mcp_api_key: env_opt("MCP_API_KEY"),
            tokens_url: env_opt("MCP_TOKENS_URL"),
            tokens_api_key: env_opt("MCP_TOKENS_API_KEY"),
            gitlab_host: std::env::var("GITLAB_HOST").unwrap_or_else(|_| "gitlab.com".to_string()),
            anthropic_api_key: env_opt("ANTHROPIC_API_KEY"),
            anthropic_base_url: std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
            sub_agent,
        })
    }

    /// Create a config with default values rooted at `data_dir` (useful for testing).
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
            container: ContainerConfig::default(),
            command_timeout: Duration::from_secs(120),
            data_dir,
            file_server_url: "http://localhost:8081".to_string(),
            mcp_api_key: None,
            tokens_url: None,
            tokens_api_key: None,
            gitlab_host: "gitlab.com".to_string(),
            anthropic_api_key: None,
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            sub_agent: SubAgentConfig::default(),
        }
    }
}
