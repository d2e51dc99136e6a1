//! 子 Agent 委派

use async_trait::async_trait;
use tracing::info;

use super::context::AgentContext;
use super::core_agent::CoreAgent;
use crate::tools::{ExpertType, TaskDelegator, ToolError};

/// 以共享上下文构造带角色的子 Agent
#[derive(Debug, Clone)]
pub struct SubAgentDelegator {
    context: AgentContext,
}

impl SubAgentDelegator {
    pub fn new(context: AgentContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl TaskDelegator for SubAgentDelegator {
    async fn delegate(&self, goal: &str, expert: ExpertType, depth: u32) -> Result<String, ToolError> {
        let mut agent = CoreAgent::new(self.context.clone(), Some(expert.as_str().to_string()), depth)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        info!(expert = %expert, depth, session = %agent.session_id(), "Sub-agent started");
        // 子 Agent 的 future 递归包含父 Agent 的循环，需要装箱
        let report = Box::pin(agent.execute(goal)).await;
        Ok(report)
    }
}
