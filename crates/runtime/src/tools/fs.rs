//! Filesystem tools - 经由 Shadow Store 的文件操作
//!
//! - read_file / list_files 读取有效视图 (暂存优先)
//! - write_file / delete_file 只暂存，不触碰真实文件
//! - commit_changes / discard_changes / list_staged 管理暂存

use serde::Deserialize;
use tracing::debug;

use super::builtin::ToolContext;
use super::trait_mod::{ToolError, ToolMetadata, ToolParams, ToolResult, parse_args};
use crate::workspace::{CommitOutcome, ShadowError, StagedKind};

impl From<ShadowError> for ToolError {
    fn from(e: ShadowError) -> Self {
        match e {
            ShadowError::Io(io) => ToolError::Io(io),
            ShadowError::PathEscape(path) | ShadowError::InvalidPath(path) => {
                ToolError::InvalidPath(path.into())
            }
            other => ToolError::ExecutionFailed(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PathArgs {
    path: String,
}

#[derive(Debug, Deserialize)]
struct OptionalPathArgs {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

pub(crate) async fn read_file(ctx: &ToolContext, params: &ToolParams) -> Result<ToolResult, ToolError> {
    let args: PathArgs = parse_args("read_file", params)?;
    let content = ctx
        .shadow
        .read(&args.path)
        .await?
        .ok_or_else(|| ToolError::ExecutionFailed(format!("File not found: {}", args.path)))?;

    let bytes = content.len() as u64;
    Ok(ToolResult::ok(content).with_metadata(ToolMetadata {
        files_read: 1,
        bytes_processed: bytes,
        ..ToolMetadata::default()
    }))
}

pub(crate) async fn write_file(ctx: &ToolContext, params: &ToolParams) -> Result<ToolResult, ToolError> {
    let args: WriteFileArgs = parse_args("write_file", params)?;
    let rel = ctx.shadow.write(&args.path, &args.content).await?;
    debug!(path = %rel, "write_file staged");

    Ok(ToolResult::ok(format!(
        "Staged {rel} ({} bytes). Use commit_changes to apply it to the workspace.",
        args.content.len()
    ))
    .with_metadata(ToolMetadata {
        files_written: 1,
        bytes_processed: args.content.len() as u64,
        affected_paths: vec![rel],
        ..ToolMetadata::default()
    }))
}

pub(crate) async fn list_files(ctx: &ToolContext, params: &ToolParams) -> Result<ToolResult, ToolError> {
    let args: OptionalPathArgs = parse_args("list_files", params)?;
    let dir = args.path.unwrap_or_else(|| ".".to_string());
    let entries = ctx.shadow.list_dir(&dir).await?;

    let output = if entries.is_empty() {
        "(empty directory)".to_string()
    } else {
        entries.join("\n")
    };
    Ok(ToolResult::ok(output))
}

pub(crate) async fn delete_file(ctx: &ToolContext, params: &ToolParams) -> Result<ToolResult, ToolError> {
    let args: PathArgs = parse_args("delete_file", params)?;
    let rel = ctx.shadow.stage_delete(&args.path).await?;

    Ok(ToolResult::ok(format!(
        "Staged deletion of {rel}. Use commit_changes to apply it."
    ))
    .with_metadata(ToolMetadata {
        affected_paths: vec![rel],
        ..ToolMetadata::default()
    }))
}

pub(crate) async fn commit_changes(ctx: &ToolContext, params: &ToolParams) -> Result<ToolResult, ToolError> {
    let args: OptionalPathArgs = parse_args("commit_changes", params)?;

    let (output, committed) = match args.path {
        Some(path) => {
            let rel = ctx.shadow.normalize(&path)?;
            let verb = match ctx.shadow.commit(&rel).await? {
                CommitOutcome::Written => "Committed",
                CommitOutcome::Deleted => "Deleted",
            };
            (format!("{verb} {rel}"), vec![rel])
        }
        None => {
            let committed = ctx.shadow.commit_all().await?;
            let output = if committed.is_empty() {
                "No staged changes to commit".to_string()
            } else {
                let list: Vec<String> = committed.iter().map(|p| format!("- {p}")).collect();
                format!("Committed {} file(s):\n{}", committed.len(), list.join("\n"))
            };
            (output, committed)
        }
    };

    Ok(ToolResult::ok(output).with_metadata(ToolMetadata {
        files_written: committed.len() as u32,
        affected_paths: committed,
        ..ToolMetadata::default()
    }))
}

pub(crate) async fn discard_changes(ctx: &ToolContext, params: &ToolParams) -> Result<ToolResult, ToolError> {
    let args: OptionalPathArgs = parse_args("discard_changes", params)?;

    let output = match args.path {
        Some(path) => {
            let rel = ctx.shadow.normalize(&path)?;
            if ctx.shadow.discard(&rel).await? {
                format!("Discarded staged changes for {rel}")
            } else {
                format!("No staged changes for {rel}")
            }
        }
        None => {
            let count = ctx.shadow.discard_all().await?;
            format!("Discarded {count} staged change(s)")
        }
    };
    Ok(ToolResult::ok(output))
}

pub(crate) async fn list_staged(ctx: &ToolContext) -> Result<ToolResult, ToolError> {
    let changes = ctx.shadow.staged_changes().await?;
    if changes.is_empty() {
        return Ok(ToolResult::ok("No staged changes"));
    }

    let lines: Vec<String> = changes
        .iter()
        .map(|c| match c.kind {
            StagedKind::Write => format!("M {}", c.path),
            StagedKind::Delete => format!("D {}", c.path),
        })
        .collect();
    Ok(ToolResult::ok(lines.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::test_support::context_for;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read_sees_staged_content() {
        let dir = TempDir::new().unwrap();
        let ctx = context_for(dir.path());

        let written = write_file(&ctx, &json!({ "path": "src/main.rs", "content": "fn main() {}" }))
            .await
            .unwrap();
        assert_eq!(written.metadata.affected_paths, vec!["src/main.rs"]);
        assert!(!dir.path().join("src/main.rs").exists());

        let read = read_file(&ctx, &json!({ "path": "src/main.rs" })).await.unwrap();
        assert_eq!(read.output, "fn main() {}");

        let staged = list_staged(&ctx).await.unwrap();
        assert_eq!(staged.output, "M src/main.rs");
    }

    #[tokio::test]
    async fn test_read_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let ctx = context_for(dir.path());
        let result = read_file(&ctx, &json!({ "path": "nope.rs" })).await;
        assert!(matches!(result, Err(ToolError::ExecutionFailed(_))));
    }

    #[tokio::test]
    async fn test_escaping_path_is_rejected() {
        let dir = TempDir::new().unwrap();
        let ctx = context_for(dir.path());
        let result = write_file(&ctx, &json!({ "path": "../x", "content": "" })).await;
        assert!(matches!(result, Err(ToolError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_commit_all_and_single() {
        let dir = TempDir::new().unwrap();
        let ctx = context_for(dir.path());
        write_file(&ctx, &json!({ "path": "a.txt", "content": "a" })).await.unwrap();
        write_file(&ctx, &json!({ "path": "b.txt", "content": "b" })).await.unwrap();

        let one = commit_changes(&ctx, &json!({ "path": "./a.txt" })).await.unwrap();
        assert_eq!(one.output, "Committed a.txt");

        let rest = commit_changes(&ctx, &json!({})).await.unwrap();
        assert_eq!(rest.output, "Committed 1 file(s):\n- b.txt");
        assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).unwrap(), "b");

        let none = commit_changes(&ctx, &json!({})).await.unwrap();
        assert_eq!(none.output, "No staged changes to commit");
    }

    #[tokio::test]
    async fn test_delete_and_discard() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("old.txt"), "x").unwrap();
        let ctx = context_for(dir.path());

        delete_file(&ctx, &json!({ "path": "old.txt" })).await.unwrap();
        assert_eq!(list_staged(&ctx).await.unwrap().output, "D old.txt");
        assert!(read_file(&ctx, &json!({ "path": "old.txt" })).await.is_err());

        let discarded = discard_changes(&ctx, &json!({ "path": "old.txt" })).await.unwrap();
        assert_eq!(discarded.output, "Discarded staged changes for old.txt");
        assert_eq!(
            read_file(&ctx, &json!({ "path": "old.txt" })).await.unwrap().output,
            "x"
        );
    }

    #[tokio::test]
    async fn test_list_files_defaults_to_root() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        let ctx = context_for(dir.path());

        let listing = list_files(&ctx, &json!({})).await.unwrap();
        assert_eq!(listing.output, "Cargo.toml\nsrc/");
    }
}
