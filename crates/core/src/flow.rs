//! Flow - 工程流记录
//!
//! 职责：
//! - 以追加方式记录 action / observation / human_intervention
//! - 按 id 查询、按谓词过滤窗口
//! - 为提示词构建提供有序的工程叙事
//!
//! 条目一旦追加即不可变；观察条目通过 `caused_by` 指向触发它的动作。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// Flow 条目 ID (ULID 字符串)
pub type FlowEntryId = String;

/// 进程内单调递增的 ULID：同一毫秒内的 id 仍严格有序
fn next_entry_id() -> FlowEntryId {
    static GENERATOR: OnceLock<Mutex<ulid::Generator>> = OnceLock::new();
    let mut generator = GENERATOR
        .get_or_init(|| Mutex::new(ulid::Generator::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    // 同一毫秒内随机部分溢出时退回普通 ULID
    generator
        .generate()
        .unwrap_or_else(|_| ulid::Ulid::new())
        .to_string()
}

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEntryType {
    Action,
    Observation,
    HumanIntervention,
}

/// 条目发生的工作面
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowSurface {
    Editor,
    Terminal,
    Test,
    Lsp,
    Docs,
}

impl FlowSurface {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowSurface::Editor => "editor",
            FlowSurface::Terminal => "terminal",
            FlowSurface::Test => "test",
            FlowSurface::Lsp => "lsp",
            FlowSurface::Docs => "docs",
        }
    }
}

/// 单个 Flow 条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEntry {
    pub id: FlowEntryId,

    #[serde(rename = "type")]
    pub entry_type: FlowEntryType,

    pub surface: FlowSurface,

    pub content: serde_json::Value,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<Vec<FlowEntryId>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affects: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl FlowEntry {
    fn new(entry_type: FlowEntryType, surface: FlowSurface, content: serde_json::Value) -> Self {
        Self {
            id: next_entry_id(),
            entry_type,
            surface,
            content,
            timestamp: Utc::now(),
            caused_by: None,
            affects: None,
            confidence: None,
        }
    }

    pub fn action(surface: FlowSurface, content: serde_json::Value) -> Self {
        Self::new(FlowEntryType::Action, surface, content)
    }

    pub fn observation(surface: FlowSurface, content: serde_json::Value) -> Self {
        Self::new(FlowEntryType::Observation, surface, content)
    }

    /// 人工干预默认落在 editor 面
    pub fn human_intervention(content: impl Into<String>) -> Self {
        Self::new(
            FlowEntryType::HumanIntervention,
            FlowSurface::Editor,
            serde_json::Value::String(content.into()),
        )
    }

    pub fn with_caused_by(mut self, ids: Vec<FlowEntryId>) -> Self {
        self.caused_by = Some(ids);
        self
    }

    pub fn with_affects(mut self, paths: Vec<String>) -> Self {
        if !paths.is_empty() {
            self.affects = Some(paths);
        }
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn is_action(&self) -> bool {
        self.entry_type == FlowEntryType::Action
    }

    pub fn is_observation(&self) -> bool {
        self.entry_type == FlowEntryType::Observation
    }

    pub fn is_human_intervention(&self) -> bool {
        self.entry_type == FlowEntryType::HumanIntervention
    }

    /// 观察条目是否记录了一次失败 (`success: false` 或含 `error` 字段)
    pub fn is_failure(&self) -> bool {
        match &self.content {
            serde_json::Value::Object(map) => {
                map.get("success").and_then(|v| v.as_bool()) == Some(false)
                    || map.get("error").is_some_and(|v| !v.is_null())
            }
            _ => false,
        }
    }

    /// 内容的文本形式 (字符串直接返回，其他 JSON 序列化)
    pub fn content_text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// 追加式 Flow 存储
#[derive(Debug, Default, Clone)]
pub struct FlowStore {
    entries: Vec<FlowEntry>,
    index: HashMap<FlowEntryId, usize>,
}

impl FlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加条目，返回其 id
    pub fn append(&mut self, entry: FlowEntry) -> FlowEntryId {
        let id = entry.id.clone();
        self.index.insert(id.clone(), self.entries.len());
        self.entries.push(entry);
        id
    }

    pub fn get_by_id(&self, id: &str) -> Option<&FlowEntry> {
        self.index.get(id).and_then(|&i| self.entries.get(i))
    }

    /// 完整的有序窗口
    pub fn get_window(&self) -> Vec<&FlowEntry> {
        self.entries.iter().collect()
    }

    /// 按谓词过滤的有序窗口
    pub fn get_window_where<F>(&self, predicate: F) -> Vec<&FlowEntry>
    where
        F: Fn(&FlowEntry) -> bool,
    {
        self.entries.iter().filter(|e| predicate(e)).collect()
    }

    /// 最近 n 条
    pub fn recent(&self, n: usize) -> &[FlowEntry] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn entries(&self) -> &[FlowEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// 用持久化的条目替换当前内容
    pub fn restore(&mut self, entries: Vec<FlowEntry>) {
        self.clear();
        for entry in entries {
            self.append(entry);
        }
    }
}
