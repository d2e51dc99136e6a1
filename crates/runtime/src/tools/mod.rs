//! Tools - 受控工具集
//!
//! 职责：
//! - Tool Trait 与 ToolRouter (注册、按能力分组导出、调度、统计)
//! - 内置工具：文件 (经 Shadow Store)、终端、LSP、委派、检索
//! - 工具输出的分级截断

mod trait_mod;
pub use trait_mod::{Tool, ToolError, ToolGroup, ToolMetadata, ToolParams, ToolResult, parse_args};

pub mod builtin;
pub mod fs;
pub mod handover;
pub mod lsp;
pub mod output_truncation;
pub mod registry;
pub mod schema;
pub mod search;
pub mod shell;

pub use builtin::{BuiltinTool, BuiltinToolHandler, ToolContext, builtin_tools};
pub use handover::{ExpertType, TaskDelegator, depth_refusal};
pub use output_truncation::{OutputTruncator, TruncatedOutput, TruncationLevel};
pub use registry::{RouterSummary, ToolRouter, ToolStats};
pub use schema::{JsonSchema, JsonSchemaProperty, ToolSchemaBuilder};
