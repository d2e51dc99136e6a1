//! LSP tools - 语言智能查询
//!
//! go_to_definition / find_references / list_symbols / get_hover，
//! 行列号均为 0-indexed，路径相对工作区根目录。

use serde::Deserialize;
use serde_json::Value;

use super::builtin::{BuiltinTool, ToolContext};
use super::trait_mod::{ToolError, ToolParams, ToolResult, parse_args};
use crate::workspace::LspError;

impl From<LspError> for ToolError {
    fn from(e: LspError) -> Self {
        match e {
            LspError::Io(io) => ToolError::Io(io),
            other => ToolError::ExecutionFailed(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PositionArgs {
    path: String,
    line: u32,
    character: u32,
}

#[derive(Debug, Deserialize)]
struct SymbolArgs {
    path: String,
}

fn is_empty_result(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn render(value: &Value, empty_message: &str) -> Result<String, ToolError> {
    if is_empty_result(value) {
        return Ok(empty_message.to_string());
    }
    Ok(serde_json::to_string_pretty(value)?)
}

pub(crate) async fn query(
    kind: BuiltinTool,
    ctx: &ToolContext,
    params: &ToolParams,
) -> Result<ToolResult, ToolError> {
    let name = kind.name();

    let (value, empty_message) = if kind == BuiltinTool::ListSymbols {
        let args: SymbolArgs = parse_args(name, params)?;
        let rel = ctx.shadow.normalize(&args.path)?;
        (ctx.lsp.lock().await.symbols(&rel).await?, "No symbols found.")
    } else {
        let args: PositionArgs = parse_args(name, params)?;
        let rel = ctx.shadow.normalize(&args.path)?;
        let mut lsp = ctx.lsp.lock().await;
        match kind {
            BuiltinTool::GoToDefinition => (
                lsp.definition(&rel, args.line, args.character).await?,
                "Definition not found.",
            ),
            BuiltinTool::FindReferences => (
                lsp.references(&rel, args.line, args.character).await?,
                "References not found.",
            ),
            BuiltinTool::GetHover => (
                lsp.hover(&rel, args.line, args.character).await?,
                "Hover information not found.",
            ),
            other => {
                return Err(ToolError::InvalidArgument(format!(
                    "{} is not a language-server query",
                    other.name()
                )));
            }
        }
    };

    Ok(ToolResult::ok(render(&value, empty_message)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::test_support::context_for;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_render_empty_results() {
        assert_eq!(render(&Value::Null, "none").unwrap(), "none");
        assert_eq!(render(&json!([]), "none").unwrap(), "none");
        assert!(render(&json!([{ "uri": "file:///a.ts" }]), "none").unwrap().contains("file:///a.ts"));
    }

    #[tokio::test]
    async fn test_missing_position_is_invalid_argument() {
        let dir = TempDir::new().unwrap();
        let ctx = context_for(dir.path());
        let result = query(BuiltinTool::GetHover, &ctx, &json!({ "path": "a.ts" })).await;
        assert!(matches!(result, Err(ToolError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_unconfigured_server_surfaces_as_tool_error() {
        let dir = TempDir::new().unwrap();
        let ctx = context_for(dir.path());
        let result = query(BuiltinTool::ListSymbols, &ctx, &json!({ "path": "a.ts" })).await;
        assert!(matches!(result, Err(ToolError::ExecutionFailed(msg)) if msg.contains("not configured")));
    }
}
