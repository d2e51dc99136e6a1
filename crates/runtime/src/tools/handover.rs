//! Handover - 任务委派
//!
//! `delegate_task` 把子任务交给带角色的子 Agent：
//! - 子 Agent 深度 = 当前深度 + 1
//! - 达到深度上限时返回拒绝文本，而不是工具错误
//! - 子 Agent 的构造由 `TaskDelegator` 注入，工具层不依赖 Agent 实现

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::builtin::ToolContext;
use super::trait_mod::{ToolError, ToolParams, ToolResult, parse_args};

/// 专家类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpertType {
    Researcher,
    Reviewer,
    Coder,
}

impl ExpertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpertType::Researcher => "researcher",
            ExpertType::Reviewer => "reviewer",
            ExpertType::Coder => "coder",
        }
    }
}

impl std::fmt::Display for ExpertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 子 Agent 工厂
#[async_trait]
pub trait TaskDelegator: Send + Sync {
    /// 以 `depth` 构造子 Agent 执行 `goal`，返回其最终文本
    async fn delegate(&self, goal: &str, expert: ExpertType, depth: u32) -> Result<String, ToolError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelegateTaskArgs {
    goal: String,
    expert_type: ExpertType,
}

/// 深度上限拒绝文本
pub fn depth_refusal(max_depth: u32) -> String {
    format!("Error: Maximum delegation depth reached ({max_depth}). Please handle the task directly.")
}

pub(crate) async fn delegate_task(ctx: &ToolContext, params: &ToolParams) -> Result<ToolResult, ToolError> {
    let args: DelegateTaskArgs = parse_args("delegate_task", params)?;

    let child_depth = ctx.depth + 1;
    if child_depth >= ctx.max_delegation_depth {
        info!(depth = ctx.depth, max = ctx.max_delegation_depth, "Delegation refused");
        return Ok(ToolResult::ok(depth_refusal(ctx.max_delegation_depth)));
    }

    let delegator = ctx
        .delegator
        .as_ref()
        .ok_or_else(|| ToolError::ExecutionFailed("Delegation is not available".to_string()))?;

    info!(
        goal = %args.goal,
        expert = %args.expert_type,
        depth = child_depth,
        "Delegating task"
    );
    let report = delegator.delegate(&args.goal, args.expert_type, child_depth).await?;
    let report = if report.trim().is_empty() {
        "The expert completed the task but provided no summary.".to_string()
    } else {
        report
    };

    Ok(ToolResult::ok(format!(
        "EXPERT ({}) REPORT:\n{report}",
        args.expert_type.as_str().to_uppercase()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::test_support::context_for;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingDelegator {
        calls: Mutex<Vec<(String, ExpertType, u32)>>,
        reply: String,
    }

    #[async_trait]
    impl TaskDelegator for RecordingDelegator {
        async fn delegate(&self, goal: &str, expert: ExpertType, depth: u32) -> Result<String, ToolError> {
            self.calls.lock().unwrap().push((goal.to_string(), expert, depth));
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn test_delegates_with_incremented_depth() {
        let dir = TempDir::new().unwrap();
        let delegator = Arc::new(RecordingDelegator {
            reply: "Found 3 call sites.".into(),
            ..Default::default()
        });
        let mut ctx = context_for(dir.path());
        ctx.depth = 1;
        ctx.delegator = Some(delegator.clone());

        let result = delegate_task(&ctx, &json!({ "goal": "find callers", "expertType": "researcher" }))
            .await
            .unwrap();
        assert_eq!(result.output, "EXPERT (RESEARCHER) REPORT:\nFound 3 call sites.");
        assert_eq!(
            delegator.calls.lock().unwrap().as_slice(),
            &[("find callers".to_string(), ExpertType::Researcher, 2)]
        );
    }

    #[tokio::test]
    async fn test_refuses_at_depth_ceiling() {
        let dir = TempDir::new().unwrap();
        let delegator = Arc::new(RecordingDelegator::default());
        let mut ctx = context_for(dir.path());
        ctx.depth = 2;
        ctx.delegator = Some(delegator.clone());

        let result = delegate_task(&ctx, &json!({ "goal": "x", "expertType": "coder" }))
            .await
            .unwrap();
        assert_eq!(
            result.output,
            "Error: Maximum delegation depth reached (3). Please handle the task directly."
        );
        assert!(delegator.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_report_and_bad_expert() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context_for(dir.path());
        ctx.delegator = Some(Arc::new(RecordingDelegator::default()));

        let result = delegate_task(&ctx, &json!({ "goal": "x", "expertType": "reviewer" }))
            .await
            .unwrap();
        assert!(result.output.ends_with("The expert completed the task but provided no summary."));

        let bad = delegate_task(&ctx, &json!({ "goal": "x", "expertType": "wizard" })).await;
        assert!(matches!(bad, Err(ToolError::InvalidArgument(_))));
    }
}
