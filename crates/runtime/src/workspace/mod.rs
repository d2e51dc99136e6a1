//! Workspace - 工作区资源
//!
//! - shadow: 暂存文件系统
//! - interactive_shell: 交互式进程会话
//! - lsp_session: 语言服务器会话

pub mod interactive_shell;
pub mod lsp_session;
pub mod shadow;

pub use interactive_shell::{InteractiveShell, ShellError};
pub use lsp_session::{LspError, LspSession};
pub use shadow::{CommitOutcome, ShadowError, ShadowStore, StagedChange, StagedKind};
