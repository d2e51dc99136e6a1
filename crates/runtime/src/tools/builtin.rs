//! Builtin Tools - 内置工具集
//!
//! 内置工具是一个封闭枚举 (`BuiltinTool`)：
//! - 名称、描述、Schema、能力分组、surface 由枚举集中定义
//! - 每个工具有一个强类型参数结构体，处理器先反序列化参数
//! - 处理器按工具族分布在 fs / shell / lsp / handover / search 模块

use async_trait::async_trait;
use octo_cognition::VectorIndex;
use octo_core::{FlowSurface, ProcessConfig};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::handover::TaskDelegator;
use super::schema::ToolSchemaBuilder;
use super::trait_mod::{Tool, ToolError, ToolGroup, ToolParams, ToolResult};
use super::{fs, handover, lsp, search, shell};
use crate::workspace::{InteractiveShell, LspSession, ShadowStore};

const PLANNING_AND_ACTING: &[ToolGroup] = &[ToolGroup::Planning, ToolGroup::Acting];
const ACTING_ONLY: &[ToolGroup] = &[ToolGroup::Acting];

/// 工具执行上下文：一个 Agent 的工作区资源
#[derive(Clone)]
pub struct ToolContext {
    pub shadow: Arc<ShadowStore>,
    pub shell: Arc<Mutex<InteractiveShell>>,
    pub lsp: Arc<Mutex<LspSession>>,
    pub vector_index: Arc<RwLock<VectorIndex>>,
    pub process: ProcessConfig,
    pub retrieval_top_k: usize,
    /// 当前 Agent 的委派深度
    pub depth: u32,
    pub max_delegation_depth: u32,
    pub delegator: Option<Arc<dyn TaskDelegator>>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("workspace_root", &self.shadow.root())
            .field("depth", &self.depth)
            .field("max_delegation_depth", &self.max_delegation_depth)
            .field("delegator", &self.delegator.is_some())
            .finish()
    }
}

/// 内置工具
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinTool {
    ReadFile,
    WriteFile,
    ListFiles,
    DeleteFile,
    CommitChanges,
    DiscardChanges,
    ListStaged,
    RunCommand,
    SpawnCommand,
    SendTerminalInput,
    ReadTerminal,
    KillTerminal,
    GoToDefinition,
    FindReferences,
    ListSymbols,
    GetHover,
    DelegateTask,
    SearchWorkspace,
}

impl BuiltinTool {
    pub const ALL: [BuiltinTool; 18] = [
        BuiltinTool::ReadFile,
        BuiltinTool::WriteFile,
        BuiltinTool::ListFiles,
        BuiltinTool::DeleteFile,
        BuiltinTool::CommitChanges,
        BuiltinTool::DiscardChanges,
        BuiltinTool::ListStaged,
        BuiltinTool::RunCommand,
        BuiltinTool::SpawnCommand,
        BuiltinTool::SendTerminalInput,
        BuiltinTool::ReadTerminal,
        BuiltinTool::KillTerminal,
        BuiltinTool::GoToDefinition,
        BuiltinTool::FindReferences,
        BuiltinTool::ListSymbols,
        BuiltinTool::GetHover,
        BuiltinTool::DelegateTask,
        BuiltinTool::SearchWorkspace,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinTool::ReadFile => "read_file",
            BuiltinTool::WriteFile => "write_file",
            BuiltinTool::ListFiles => "list_files",
            BuiltinTool::DeleteFile => "delete_file",
            BuiltinTool::CommitChanges => "commit_changes",
            BuiltinTool::DiscardChanges => "discard_changes",
            BuiltinTool::ListStaged => "list_staged",
            BuiltinTool::RunCommand => "run_command",
            BuiltinTool::SpawnCommand => "spawn_command",
            BuiltinTool::SendTerminalInput => "send_terminal_input",
            BuiltinTool::ReadTerminal => "read_terminal",
            BuiltinTool::KillTerminal => "kill_terminal",
            BuiltinTool::GoToDefinition => "go_to_definition",
            BuiltinTool::FindReferences => "find_references",
            BuiltinTool::ListSymbols => "list_symbols",
            BuiltinTool::GetHover => "get_hover",
            BuiltinTool::DelegateTask => "delegate_task",
            BuiltinTool::SearchWorkspace => "search_workspace",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    pub fn description(&self) -> &'static str {
        match self {
            BuiltinTool::ReadFile => "Read the contents of a file. Staged (uncommitted) edits are visible.",
            BuiltinTool::WriteFile => {
                "Write content to a file. The write is staged in the shadow workspace until commit_changes."
            }
            BuiltinTool::ListFiles => "List files in a directory. Directories end with '/'.",
            BuiltinTool::DeleteFile => "Stage the deletion of a file. Applied on commit_changes.",
            BuiltinTool::CommitChanges => {
                "Apply staged changes to the real workspace. Omit path to commit everything."
            }
            BuiltinTool::DiscardChanges => "Drop staged changes. Omit path to discard everything.",
            BuiltinTool::ListStaged => "List staged changes (M = modified/new, D = deleted).",
            BuiltinTool::RunCommand => "Run a shell command to completion and return its output and exit code.",
            BuiltinTool::SpawnCommand => {
                "Start a long-running or interactive command in the terminal session, replacing any running one."
            }
            BuiltinTool::SendTerminalInput => "Send input to the running terminal process and return new output.",
            BuiltinTool::ReadTerminal => "Read output produced by the terminal process since the last read.",
            BuiltinTool::KillTerminal => "Terminate the running terminal process.",
            BuiltinTool::GoToDefinition => "Find the definition of a symbol at a specific position in a file.",
            BuiltinTool::FindReferences => "Find all references of a symbol at a specific position in a file.",
            BuiltinTool::ListSymbols => "List all symbols (functions, classes, etc.) in a file.",
            BuiltinTool::GetHover => {
                "Get type information and documentation (hover) for a symbol at a specific position in a file."
            }
            BuiltinTool::DelegateTask => {
                "Delegate a specific sub-task to an expert agent (researcher, reviewer, or coder)."
            }
            BuiltinTool::SearchWorkspace => "Search the codebase using semantic search.",
        }
    }

    pub fn groups(&self) -> &'static [ToolGroup] {
        match self {
            BuiltinTool::ReadFile
            | BuiltinTool::ListFiles
            | BuiltinTool::ListStaged
            | BuiltinTool::ReadTerminal
            | BuiltinTool::GoToDefinition
            | BuiltinTool::FindReferences
            | BuiltinTool::ListSymbols
            | BuiltinTool::GetHover
            | BuiltinTool::DelegateTask
            | BuiltinTool::SearchWorkspace => PLANNING_AND_ACTING,
            BuiltinTool::WriteFile
            | BuiltinTool::DeleteFile
            | BuiltinTool::CommitChanges
            | BuiltinTool::DiscardChanges
            | BuiltinTool::RunCommand
            | BuiltinTool::SpawnCommand
            | BuiltinTool::SendTerminalInput
            | BuiltinTool::KillTerminal => ACTING_ONLY,
        }
    }

    pub fn surface(&self) -> FlowSurface {
        match self {
            BuiltinTool::ReadFile
            | BuiltinTool::WriteFile
            | BuiltinTool::ListFiles
            | BuiltinTool::DeleteFile
            | BuiltinTool::CommitChanges
            | BuiltinTool::DiscardChanges
            | BuiltinTool::ListStaged => FlowSurface::Editor,
            BuiltinTool::RunCommand
            | BuiltinTool::SpawnCommand
            | BuiltinTool::SendTerminalInput
            | BuiltinTool::ReadTerminal
            | BuiltinTool::KillTerminal => FlowSurface::Terminal,
            BuiltinTool::GoToDefinition
            | BuiltinTool::FindReferences
            | BuiltinTool::ListSymbols
            | BuiltinTool::GetHover => FlowSurface::Lsp,
            BuiltinTool::DelegateTask | BuiltinTool::SearchWorkspace => FlowSurface::Docs,
        }
    }

    pub fn schema(&self) -> serde_json::Value {
        let builder = ToolSchemaBuilder::new().description(self.description());
        let builder = match self {
            BuiltinTool::ReadFile | BuiltinTool::DeleteFile => {
                builder.required_string("path", "Relative path to the file")
            }
            BuiltinTool::WriteFile => builder
                .required_string("path", "Relative path to the file")
                .required_string("content", "Content to write"),
            BuiltinTool::ListFiles => builder.param_string(
                "path",
                "Relative path to the directory (optional, defaults to root)",
            ),
            BuiltinTool::CommitChanges | BuiltinTool::DiscardChanges => {
                builder.param_string("path", "Relative path (optional, defaults to all staged files)")
            }
            BuiltinTool::ListStaged | BuiltinTool::ReadTerminal | BuiltinTool::KillTerminal => builder,
            BuiltinTool::RunCommand => builder
                .required_string("command", "Shell command to execute")
                .param_integer("timeoutSecs", "Timeout in seconds (optional)"),
            BuiltinTool::SpawnCommand => {
                builder.required_string("command", "Shell command to start")
            }
            BuiltinTool::SendTerminalInput => builder
                .required_string("input", "Text to send to the process")
                .param_boolean("appendNewline", "Append a newline (default true)"),
            BuiltinTool::GoToDefinition | BuiltinTool::FindReferences | BuiltinTool::GetHover => {
                builder
                    .required_string("path", "Relative path to the file")
                    .required_integer("line", "Line number (0-indexed)")
                    .required_integer("character", "Character position (0-indexed)")
            }
            BuiltinTool::ListSymbols => builder.required_string("path", "Relative path to the file"),
            BuiltinTool::DelegateTask => builder
                .required_string("goal", "The specific goal for the expert agent")
                .required_enum(
                    "expertType",
                    "The type of expertise needed",
                    &["researcher", "reviewer", "coder"],
                ),
            BuiltinTool::SearchWorkspace => builder
                .required_string("query", "Search query")
                .param_integer("limit", "Maximum number of results (optional)"),
        };
        builder.build().to_value()
    }
}

/// 内置工具处理器
#[derive(Debug, Clone)]
pub struct BuiltinToolHandler {
    kind: BuiltinTool,
    context: ToolContext,
}

impl BuiltinToolHandler {
    pub fn new(kind: BuiltinTool, context: ToolContext) -> Self {
        Self { kind, context }
    }

    pub fn kind(&self) -> BuiltinTool {
        self.kind
    }
}

#[async_trait]
impl Tool for BuiltinToolHandler {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn description(&self) -> &str {
        self.kind.description()
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolResult, ToolError> {
        let ctx = &self.context;
        match self.kind {
            BuiltinTool::ReadFile => fs::read_file(ctx, params).await,
            BuiltinTool::WriteFile => fs::write_file(ctx, params).await,
            BuiltinTool::ListFiles => fs::list_files(ctx, params).await,
            BuiltinTool::DeleteFile => fs::delete_file(ctx, params).await,
            BuiltinTool::CommitChanges => fs::commit_changes(ctx, params).await,
            BuiltinTool::DiscardChanges => fs::discard_changes(ctx, params).await,
            BuiltinTool::ListStaged => fs::list_staged(ctx).await,
            BuiltinTool::RunCommand => shell::run_command(ctx, params).await,
            BuiltinTool::SpawnCommand => shell::spawn_command(ctx, params).await,
            BuiltinTool::SendTerminalInput => shell::send_terminal_input(ctx, params).await,
            BuiltinTool::ReadTerminal => shell::read_terminal(ctx).await,
            BuiltinTool::KillTerminal => shell::kill_terminal(ctx).await,
            BuiltinTool::GoToDefinition
            | BuiltinTool::FindReferences
            | BuiltinTool::ListSymbols
            | BuiltinTool::GetHover => lsp::query(self.kind, ctx, params).await,
            BuiltinTool::DelegateTask => handover::delegate_task(ctx, params).await,
            BuiltinTool::SearchWorkspace => search::search_workspace(ctx, params).await,
        }
    }

    fn schema(&self) -> serde_json::Value {
        self.kind.schema()
    }

    fn groups(&self) -> &'static [ToolGroup] {
        self.kind.groups()
    }

    fn surface(&self) -> FlowSurface {
        self.kind.surface()
    }
}

/// 全部内置工具的处理器
pub fn builtin_tools(context: &ToolContext) -> Vec<Arc<dyn Tool>> {
    BuiltinTool::ALL
        .into_iter()
        .map(|kind| Arc::new(BuiltinToolHandler::new(kind, context.clone())) as Arc<dyn Tool>)
        .collect()
}
