//! Tool Router - 工具注册表与调度
//!
//! - 名称 → 工具 (描述、Schema、能力分组、surface)
//! - 重名注册覆盖旧工具并告警
//! - 按能力分组导出工具定义，供各阶段收窄模型可用的动作空间
//! - 调用统计

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use octo_core::{FlowSurface, ToolDefinition};

use super::trait_mod::{Tool, ToolError, ToolGroup, ToolParams, ToolResult};

/// 工具路由
#[derive(Default)]
pub struct ToolRouter {
    tools: HashMap<String, Arc<dyn Tool>>,
    stats: HashMap<String, ToolStats>,
}

impl std::fmt::Debug for ToolRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRouter")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；重名时覆盖并返回被替换的工具名
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Option<String> {
        let name = tool.name().to_string();
        let replaced = self.tools.insert(name.clone(), tool);
        self.stats.insert(
            name.clone(),
            ToolStats {
                name: name.clone(),
                registered_at: chrono::Utc::now(),
                ..ToolStats::default()
            },
        );

        match replaced {
            Some(old) => {
                warn!(tool = %name, "Tool already registered, overwriting");
                Some(old.name().to_string())
            }
            None => {
                debug!(tool = %name, "Tool registered");
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 全部工具名 (排序)
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 工具对应的 Flow surface；未注册时视为编辑器
    pub fn surface_of(&self, name: &str) -> FlowSurface {
        self.tools
            .get(name)
            .map(|t| t.surface())
            .unwrap_or(FlowSurface::Editor)
    }

    /// 按能力分组获取工具 (按名称排序)
    pub fn by_group(&self, group: ToolGroup) -> Vec<&Arc<dyn Tool>> {
        let mut tools: Vec<&Arc<dyn Tool>> = self
            .tools
            .values()
            .filter(|t| t.groups().contains(&group))
            .collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// 生成能力所需的工具定义
    pub fn definitions(&self, group: ToolGroup) -> Vec<ToolDefinition> {
        self.by_group(group)
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.schema(),
            })
            .collect()
    }

    /// 执行工具；处理器的结果与错误原样返回
    pub async fn execute_tool(
        &mut self,
        name: &str,
        params: &ToolParams,
    ) -> Result<ToolResult, ToolError> {
        let tool = self
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        let start = std::time::Instant::now();
        let mut result = tool.execute(params).await;
        let duration = start.elapsed().as_millis() as u64;

        if let Ok(ok) = result.as_mut() {
            if ok.metadata.execution_time_ms == 0 {
                ok.metadata.execution_time_ms = duration;
            }
        }

        if let Some(stats) = self.stats.get_mut(name) {
            stats.call_count += 1;
            match &result {
                Ok(_) => stats.success_count += 1,
                Err(_) => stats.failure_count += 1,
            }
        }

        debug!(
            tool = name,
            duration_ms = duration,
            ok = result.is_ok(),
            "Tool executed"
        );
        result
    }

    pub fn stats(&self, name: &str) -> Option<&ToolStats> {
        self.stats.get(name)
    }

    pub fn summary(&self) -> RouterSummary {
        let total_calls: u64 = self.stats.values().map(|s| s.call_count).sum();
        let total_success: u64 = self.stats.values().map(|s| s.success_count).sum();

        RouterSummary {
            total_tools: self.tools.len(),
            total_calls,
            success_rate: if total_calls > 0 {
                total_success as f64 / total_calls as f64
            } else {
                0.0
            },
        }
    }
}

/// 单个工具的调用统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolStats {
    pub name: String,
    pub registered_at: chrono::DateTime<chrono::Utc>,
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

/// 路由统计摘要
#[derive(Debug, Clone)]
pub struct RouterSummary {
    pub total_tools: usize,
    pub total_calls: u64,
    pub success_rate: f64,
}
