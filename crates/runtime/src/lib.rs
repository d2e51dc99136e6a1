//! Octo Runtime - Agent 执行引擎
//!
//! 职责：
//! - Agent 循环与子 Agent 委派
//! - 受控工具集与路由
//! - 工作区会话：Shadow Store、交互式终端、语言服务器
//! - 会话质量评估
//!
//! 架构：
//! - agent/: CoreAgent、AgentContext、委派
//! - tools/: Tool Trait、ToolRouter、内置工具、输出截断
//! - workspace/: ShadowStore、InteractiveShell、LspSession
//! - verify/: Evaluator

pub mod agent;
pub mod tools;
pub mod verify;
pub mod workspace;

pub use agent::{AgentContext, AgentError, CoreAgent, IndexReport, InterventionHandle, SubAgentDelegator};
pub use tools::{Tool, ToolError, ToolGroup, ToolResult, ToolRouter};
pub use verify::{EndToEndScenario, ConversationalScenario, EvaluationResult, Evaluator};
pub use workspace::{InteractiveShell, LspSession, ShadowStore};
