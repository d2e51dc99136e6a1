//! Shell tools - 终端命令
//!
//! - run_command: 一次性执行，超时与输出上限受 ProcessConfig 约束
//! - spawn_command / send_terminal_input / read_terminal / kill_terminal:
//!   操作 Agent 的交互式进程会话
//!
//! 非零退出码不是工具错误：输出连同退出码返回给模型。

use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::builtin::ToolContext;
use super::trait_mod::{ToolError, ToolMetadata, ToolParams, ToolResult, parse_args};
use crate::workspace::ShellError;

impl From<ShellError> for ToolError {
    fn from(e: ShellError) -> Self {
        match e {
            ShellError::Io(io) => ToolError::Io(io),
            other => ToolError::ExecutionFailed(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunCommandArgs {
    command: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SpawnCommandArgs {
    command: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminalInputArgs {
    input: String,
    #[serde(default = "default_append_newline")]
    append_newline: bool,
}

fn default_append_newline() -> bool {
    true
}

/// 输出超过上限时保留开头部分
fn limit_output(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n[output limited to {limit} of {} bytes]",
        &text[..cut],
        text.len()
    )
}

pub(crate) async fn run_command(ctx: &ToolContext, params: &ToolParams) -> Result<ToolResult, ToolError> {
    let args: RunCommandArgs = parse_args("run_command", params)?;
    let timeout = Duration::from_secs(
        args.timeout_secs
            .unwrap_or(ctx.process.command_timeout_secs)
            .max(1),
    );

    debug!(command = %args.command, ?timeout, "Executing command");
    let child = Command::new("/bin/bash")
        .arg("-c")
        .arg(&args.command)
        .current_dir(ctx.shadow.root())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::ExecutionFailed(format!("{}: {e}", args.command)))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(command = %args.command, "Command timed out");
            return Err(ToolError::Timeout(format!(
                "{} (after {}s)",
                args.command,
                timeout.as_secs()
            )));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let exit_code = output.status.code();
    let success = output.status.success();

    let mut text = String::new();
    if !stdout.is_empty() {
        text.push_str(&format!("[STDOUT]\n{stdout}"));
    }
    if !stderr.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("[STDERR]\n{stderr}"));
    }
    if text.is_empty() {
        text.push_str("(No output)");
    }
    if !success {
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("[EXIT CODE] {}", exit_code.unwrap_or(-1)));
    }
    let text = limit_output(&text, ctx.process.command_output_limit);

    Ok(ToolResult {
        success,
        error: (!success).then(|| format!("Exit code: {exit_code:?}")),
        metadata: ToolMetadata {
            bytes_processed: (output.stdout.len() + output.stderr.len()) as u64,
            exit_code,
            ..ToolMetadata::default()
        },
        output: text,
    })
}

pub(crate) async fn spawn_command(ctx: &ToolContext, params: &ToolParams) -> Result<ToolResult, ToolError> {
    let args: SpawnCommandArgs = parse_args("spawn_command", params)?;
    let output = ctx.shell.lock().await.spawn(&args.command).await?;
    let output = if output.is_empty() {
        "(No output yet)".to_string()
    } else {
        limit_output(&output, ctx.process.command_output_limit)
    };
    Ok(ToolResult::ok(format!("Started `{}`\n{output}", args.command)))
}

pub(crate) async fn send_terminal_input(ctx: &ToolContext, params: &ToolParams) -> Result<ToolResult, ToolError> {
    let args: TerminalInputArgs = parse_args("send_terminal_input", params)?;
    let mut input = args.input;
    if args.append_newline && !input.ends_with('\n') {
        input.push('\n');
    }

    let mut shell = ctx.shell.lock().await;
    shell.write(&input).await?;
    let output = shell.settle().await;
    Ok(ToolResult::ok(if output.is_empty() {
        "(No new output)".to_string()
    } else {
        limit_output(&output, ctx.process.command_output_limit)
    }))
}

pub(crate) async fn read_terminal(ctx: &ToolContext) -> Result<ToolResult, ToolError> {
    let mut shell = ctx.shell.lock().await;
    let output = shell.read();
    let alive = shell.is_alive();

    let mut text = if output.is_empty() {
        "(No new output)".to_string()
    } else {
        limit_output(&output, ctx.process.command_output_limit)
    };
    if !alive {
        text.push_str("\n[process not running]");
    }
    Ok(ToolResult::ok(text))
}

pub(crate) async fn kill_terminal(ctx: &ToolContext) -> Result<ToolResult, ToolError> {
    let killed = ctx.shell.lock().await.kill().await?;
    Ok(ToolResult::ok(if killed {
        "Terminated running process"
    } else {
        "No running process"
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::test_support::context_for;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let dir = TempDir::new().unwrap();
        let ctx = context_for(dir.path());
        let result = run_command(&ctx, &json!({ "command": "echo hi" })).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, "[STDOUT]\nhi\n");
        assert_eq!(result.metadata.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_a_tool_error() {
        let dir = TempDir::new().unwrap();
        let ctx = context_for(dir.path());
        let result = run_command(&ctx, &json!({ "command": "echo bad 1>&2; exit 3" }))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.output.contains("[STDERR]\nbad"));
        assert!(result.output.ends_with("[EXIT CODE] 3"));
        assert_eq!(result.metadata.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_run_command_times_out() {
        let dir = TempDir::new().unwrap();
        let ctx = context_for(dir.path());
        let result = run_command(&ctx, &json!({ "command": "sleep 5", "timeoutSecs": 1 })).await;
        assert!(matches!(result, Err(ToolError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_output_limit() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context_for(dir.path());
        ctx.process.command_output_limit = 16;
        let result = run_command(&ctx, &json!({ "command": "printf 'abcdefghijklmnopqrstuvwxyz'" }))
            .await
            .unwrap();
        assert!(result.output.starts_with("[STDOUT]\nabcdefg\n[output limited to 16"));
    }

    #[tokio::test]
    async fn test_terminal_session_tools() {
        let dir = TempDir::new().unwrap();
        let ctx = context_for(dir.path());

        let input = send_terminal_input(&ctx, &json!({ "input": "hello" })).await;
        assert!(matches!(input, Err(ToolError::ExecutionFailed(_))));

        let started = spawn_command(&ctx, &json!({ "command": "cat" })).await.unwrap();
        assert!(started.output.starts_with("Started `cat`"));

        let echoed = send_terminal_input(&ctx, &json!({ "input": "hello" })).await.unwrap();
        assert!(echoed.output.contains("hello"));

        let empty = read_terminal(&ctx).await.unwrap();
        assert_eq!(empty.output, "(No new output)");

        assert_eq!(kill_terminal(&ctx).await.unwrap().output, "Terminated running process");
        assert_eq!(kill_terminal(&ctx).await.unwrap().output, "No running process");
    }
}
