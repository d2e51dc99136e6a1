//! Tool Trait - 工具接口定义
//!
//! 设计原则：
//! - 所有工具实现统一的 Tool Trait
//! - 参数和结果使用 JSON 序列化
//! - 能力分组 (planning / acting) 决定工具在哪个阶段可见
//! - 工具的 Flow surface 决定 action/observation 归属

use async_trait::async_trait;
use octo_core::FlowSurface;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// 工具执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub metadata: ToolMetadata,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            metadata: ToolMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: ToolMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub execution_time_ms: u64,
    pub files_read: u32,
    pub files_written: u32,
    pub bytes_processed: u64,
    /// 受影响的工作区相对路径
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// 工具错误
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("工具不存在: {0}")]
    NotFound(String),

    #[error("执行失败: {0}")]
    ExecutionFailed(String),

    #[error("路径无效: {0}")]
    InvalidPath(PathBuf),

    #[error("参数错误: {0}")]
    InvalidArgument(String),

    #[error("执行超时: {0}")]
    Timeout(String),
}

/// 工具参数（JSON 序列化）
pub type ToolParams = serde_json::Value;

/// 能力分组
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolGroup {
    /// 只读探索、检索、委派
    Planning,
    /// 全部工具
    Acting,
}

impl ToolGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolGroup::Planning => "planning",
            ToolGroup::Acting => "acting",
        }
    }
}

/// Tool Trait - 所有工具必须实现
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称
    fn name(&self) -> &str;

    /// 工具描述
    fn description(&self) -> &str;

    /// 执行工具
    async fn execute(&self, params: &ToolParams) -> Result<ToolResult, ToolError>;

    /// 获取参数模式（用于验证）
    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    }

    /// 所属能力分组
    fn groups(&self) -> &'static [ToolGroup] {
        &[ToolGroup::Acting]
    }

    /// Flow surface
    fn surface(&self) -> FlowSurface {
        FlowSurface::Editor
    }
}

/// 将 JSON 参数解析为强类型参数结构
pub fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, params: &ToolParams) -> Result<T, ToolError> {
    serde_json::from_value(params.clone())
        .map_err(|e| ToolError::InvalidArgument(format!("{tool}: {e}")))
}
