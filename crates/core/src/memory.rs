//! Conversational Memory - 对话记忆
//!
//! 职责：
//! - 按严格追加顺序保存发送给模型的消息序列
//! - 短期 / 长期分层：`clear_short_term` 将短期记忆归档到长期
//! - Telemetry 旁路：记录隔离的失败与元数据，永不回流到提示词

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryRole {
    User,
    Assistant,
    System,
}

impl MemoryRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryRole::User => "user",
            MemoryRole::Assistant => "assistant",
            MemoryRole::System => "system",
        }
    }
}

/// 对话记忆条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub role: MemoryRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(role: MemoryRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Telemetry 条目类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    ToolFailure,
    TokenWarning,
    GenerationFailure,
    Note,
}

/// Telemetry 条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEntry {
    pub kind: TelemetryKind,
    pub tool: Option<String>,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEntry {
    pub fn new(kind: TelemetryKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            tool: None,
            message: message.into(),
            metadata: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_failure(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: Some(tool.into()),
            ..Self::new(TelemetryKind::ToolFailure, message)
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// 对话记忆
#[derive(Debug, Default, Clone)]
pub struct ConversationalMemory {
    long_term: Vec<MemoryEntry>,
    short_term: Vec<MemoryEntry>,
    telemetry: Vec<TelemetryEntry>,
}

impl ConversationalMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, role: MemoryRole, content: impl Into<String>) {
        self.short_term.push(MemoryEntry::new(role, content));
    }

    /// 发送给模型的完整历史：长期在前，短期在后
    pub fn history(&self) -> Vec<MemoryEntry> {
        self.long_term
            .iter()
            .chain(self.short_term.iter())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.long_term.len() + self.short_term.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 将短期记忆归档为长期记忆
    pub fn clear_short_term(&mut self) {
        self.long_term.append(&mut self.short_term);
    }

    pub fn record_telemetry(&mut self, entry: TelemetryEntry) {
        tracing::debug!(kind = ?entry.kind, tool = ?entry.tool, "telemetry recorded");
        self.telemetry.push(entry);
    }

    pub fn telemetry(&self) -> &[TelemetryEntry] {
        &self.telemetry
    }

    /// 粗略 token 估算 (4 字符 ≈ 1 token)
    pub fn estimated_tokens(&self) -> usize {
        self.long_term
            .iter()
            .chain(self.short_term.iter())
            .map(|e| e.content.chars().count())
            .sum::<usize>()
            / 4
    }
}
