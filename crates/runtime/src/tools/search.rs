//! search_workspace - 语义检索工作区

use serde::Deserialize;

use super::builtin::ToolContext;
use super::trait_mod::{ToolError, ToolParams, ToolResult, parse_args};

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

pub(crate) async fn search_workspace(ctx: &ToolContext, params: &ToolParams) -> Result<ToolResult, ToolError> {
    let args: SearchArgs = parse_args("search_workspace", params)?;
    let k = args.limit.unwrap_or(ctx.retrieval_top_k).max(1);

    let results = ctx
        .vector_index
        .read()
        .await
        .search(&args.query, k)
        .await
        .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

    if results.is_empty() {
        return Ok(ToolResult::ok("No matching code found."));
    }

    let sections: Vec<String> = results
        .iter()
        .map(|r| format!("[{:.3}] {}\n{}", r.score, r.path, r.chunk))
        .collect();
    Ok(ToolResult::ok(sections.join("\n---\n")))
}
