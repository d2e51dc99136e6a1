//! Octo 配置系统
//!
//! 支持 YAML 配置文件 (`<workspace>/.octotask/config.yaml`) 和环境变量覆盖。
//! 所有字段都有默认值，配置文件可以只写需要修改的部分。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::generation::ModelRoute;

/// 工作区状态目录名
pub const STATE_DIR: &str = ".octotask";

/// 配置文件名
pub const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Octo 主配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OctoConfig {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub workspace: WorkspaceConfig,

    #[serde(default)]
    pub process: ProcessConfig,
}

/// Agent 循环配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// 每个目标的最大迭代次数
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// 委派深度上限
    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: u32,

    /// 每 N 次迭代做一次检查点
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,

    /// 检索返回的 chunk 数
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,

    /// 前 N 次迭代只开放 planning 工具
    #[serde(default = "default_planning_iterations")]
    pub planning_iterations: u32,

    /// 估算 token 超过该值时告警
    #[serde(default = "default_token_warning_threshold")]
    pub token_warning_threshold: usize,

    /// 模型输出包含这些短语 (不区分大小写) 且无工具调用时结束
    #[serde(default = "default_completion_phrases")]
    pub completion_phrases: Vec<String>,

    /// 观察内容超过该长度时在叙事中截断
    #[serde(default = "default_observation_truncate_chars")]
    pub observation_truncate_chars: usize,

    #[serde(default = "default_primary_route")]
    pub primary: ModelRoute,

    #[serde(default = "default_fallback_route")]
    pub fallback: ModelRoute,

    /// 每次迭代查询凭证的 provider 列表
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_max_delegation_depth() -> u32 {
    3
}

fn default_checkpoint_interval() -> u32 {
    3
}

fn default_retrieval_top_k() -> usize {
    5
}

fn default_planning_iterations() -> u32 {
    1
}

fn default_token_warning_threshold() -> usize {
    100_000
}

fn default_completion_phrases() -> Vec<String> {
    vec!["task complete".to_string(), "finished".to_string()]
}

fn default_observation_truncate_chars() -> usize {
    500
}

fn default_primary_route() -> ModelRoute {
    ModelRoute::new("Anthropic", "claude-3-5-sonnet-20240620")
}

fn default_fallback_route() -> ModelRoute {
    ModelRoute::new("OpenAI", "gpt-4o")
}

fn default_providers() -> Vec<String> {
    vec!["Anthropic".to_string(), "OpenAI".to_string()]
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_delegation_depth: default_max_delegation_depth(),
            checkpoint_interval: default_checkpoint_interval(),
            retrieval_top_k: default_retrieval_top_k(),
            planning_iterations: default_planning_iterations(),
            token_warning_threshold: default_token_warning_threshold(),
            completion_phrases: default_completion_phrases(),
            observation_truncate_chars: default_observation_truncate_chars(),
            primary: default_primary_route(),
            fallback: default_fallback_route(),
            providers: default_providers(),
        }
    }
}

/// 工作区扫描与切分配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    #[serde(default = "default_excluded_dirs")]
    pub excluded_dirs: Vec<String>,

    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,

    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// 寻找语法边界时的回看窗口
    #[serde(default = "default_boundary_lookback")]
    pub boundary_lookback: usize,
}

fn default_extensions() -> Vec<String> {
    ["ts", "tsx", "js", "jsx", "md", "json", "css", "scss", "rs", "py", "go", "toml"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_excluded_dirs() -> Vec<String> {
    ["node_modules", "dist", "build", "target", "vendor", ".git", STATE_DIR]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    100
}

fn default_boundary_lookback() -> usize {
    200
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            excluded_dirs: default_excluded_dirs(),
            max_chunk_size: default_max_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            boundary_lookback: default_boundary_lookback(),
        }
    }
}

/// 子进程配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// spawn 后等待输出的时间 (毫秒)
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// 一次性命令超时 (秒)
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// 一次性命令输出上限 (字节)
    #[serde(default = "default_command_output_limit")]
    pub command_output_limit: usize,

    /// 语言服务器启动命令
    #[serde(default = "default_lsp_command")]
    pub lsp_command: Vec<String>,
}

fn default_settle_ms() -> u64 {
    500
}

fn default_command_timeout_secs() -> u64 {
    120
}

fn default_command_output_limit() -> usize {
    1024 * 1024
}

fn default_lsp_command() -> Vec<String> {
    vec![
        "npx".to_string(),
        "typescript-language-server".to_string(),
        "--stdio".to_string(),
    ]
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            command_timeout_secs: default_command_timeout_secs(),
            command_output_limit: default_command_output_limit(),
            lsp_command: default_lsp_command(),
        }
    }
}

impl OctoConfig {
    /// 工作区配置文件路径
    pub fn path_for(workspace_root: &Path) -> PathBuf {
        workspace_root.join(STATE_DIR).join(CONFIG_FILE)
    }

    /// 加载配置：文件 (可缺省) → 环境变量 → 校验
    pub fn load(workspace_root: &Path) -> Result<Self, ConfigError> {
        let path = Self::path_for(workspace_root);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => Self::from_yaml(&content).map_err(|source| ConfigError::Yaml {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                Self::default()
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// 环境变量覆盖
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("OCTO_MAX_ITERATIONS") {
            match v.parse() {
                Ok(n) => self.agent.max_iterations = n,
                Err(_) => warn!(value = %v, "Ignoring invalid OCTO_MAX_ITERATIONS"),
            }
        }
        if let Some(v) = lookup("OCTO_MAX_DELEGATION_DEPTH") {
            match v.parse() {
                Ok(n) => self.agent.max_delegation_depth = n,
                Err(_) => warn!(value = %v, "Ignoring invalid OCTO_MAX_DELEGATION_DEPTH"),
            }
        }
        if let Some(v) = lookup("OCTO_LSP_COMMAND") {
            let parts: Vec<String> = v.split_whitespace().map(|s| s.to_string()).collect();
            if !parts.is_empty() {
                self.process.lsp_command = parts;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::Invalid("agent.max_iterations must be > 0".into()));
        }
        if self.agent.checkpoint_interval == 0 {
            return Err(ConfigError::Invalid("agent.checkpoint_interval must be > 0".into()));
        }
        if self.agent.retrieval_top_k == 0 {
            return Err(ConfigError::Invalid("agent.retrieval_top_k must be > 0".into()));
        }
        if self.workspace.max_chunk_size == 0 {
            return Err(ConfigError::Invalid("workspace.max_chunk_size must be > 0".into()));
        }
        if self.workspace.chunk_overlap >= self.workspace.max_chunk_size {
            return Err(ConfigError::Invalid(
                "workspace.chunk_overlap must be smaller than max_chunk_size".into(),
            ));
        }
        if self.process.lsp_command.is_empty() {
            return Err(ConfigError::Invalid("process.lsp_command must not be empty".into()));
        }
        Ok(())
    }
}
