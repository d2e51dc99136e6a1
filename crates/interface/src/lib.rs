//! Octo Interface - 命令行交互层
//!
//! 职责：
//! - `octo` 命令行：索引、检索、会话管理、Shadow 变更、会话评估
//! - 日志初始化 (tracing-subscriber)

pub mod cli;


pub use cli::{CliConfig, CliError, OutputFormat, run_cli};
