//! Octo Core - 核心数据模型
//!
//! 包含：
//! - Flow: 工程流 (action / observation / human_intervention)
//! - Memory: 对话记忆与 Telemetry 旁路
//! - TestSurface: 测试运行跟踪与失败关联
//! - Prompts: 系统提示词与 Flow 感知提示词
//! - Generation: 外部生成能力、凭证来源与模型路由
//! - Config: YAML 配置与环境变量覆盖

pub mod config;
pub mod flow;
pub mod generation;
pub mod memory;
pub mod prompts;
pub mod status;
pub mod test_surface;

pub use config::{AgentConfig, ConfigError, OctoConfig, ProcessConfig, WorkspaceConfig, STATE_DIR};
pub use flow::{FlowEntry, FlowEntryId, FlowEntryType, FlowStore, FlowSurface};
pub use generation::{
    CredentialError, CredentialSource, EnvCredentials, GenerationCapability, GenerationRequest,
    GenerationResponse, Message, ModelRoute, ProviderError, StaticCredentials, ToolCallRequest,
    ToolDefinition,
};
pub use memory::{ConversationalMemory, MemoryEntry, MemoryRole, TelemetryEntry, TelemetryKind};
pub use prompts::{FlowPromptInput, PromptFactory, SystemPromptOptions};
pub use status::{AgentStatus, StatusChange};
pub use test_surface::{
    looks_like_test_command, TestFailureAnalysis, TestResult, TestStatus, TestSurface,
    TestSurfaceError, TestUpdate,
};
