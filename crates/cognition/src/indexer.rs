//! Workspace Indexer - 工作区增量扫描与切分
//!
//! 职责：
//! - 按扩展名发现源码类文件，跳过依赖 / 构建 / 状态目录
//! - 基于 (mtime, size) 指纹判断新增、变更、删除
//! - 将文件切分为带重叠的 chunk，优先在语法边界处断开

use glob::glob;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

use octo_core::WorkspaceConfig;

use crate::IndexError;

/// 行首出现这些前缀时视为语法边界
const BOUNDARY_PREFIXES: &[&str] = &[
    "fn ", "pub ", "impl ", "impl<", "struct ", "enum ", "trait ", "mod ", "async fn ",
    "function ", "export ", "class ", "interface ", "const ", "type ", "def ", "func ",
    "# ", "## ", "### ", "#[",
];

/// 文件指纹
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// 修改时间 (毫秒)
    pub mtime: u64,
    pub size: u64,
}

/// 工作区相对路径 → 指纹
pub type FingerprintMap = HashMap<String, FileFingerprint>;

/// 切分后的文档
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// 工作区相对路径，使用 `/` 分隔
    pub path: String,
    pub content: String,
    pub chunks: Vec<String>,
}

/// 一次增量扫描的结果
#[derive(Debug, Clone, Default)]
pub struct IndexResult {
    /// 新增或变更的文档
    pub changed_documents: Vec<Document>,
    /// 上次存在、本次消失的文件
    pub deleted_files: Vec<String>,
    /// 本次扫描的完整指纹表
    pub metadata: FingerprintMap,
}

/// 切分参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    pub max_chunk_size: usize,
    pub overlap: usize,
    pub lookback: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1000,
            overlap: 100,
            lookback: 200,
        }
    }
}

impl From<&WorkspaceConfig> for ChunkConfig {
    fn from(config: &WorkspaceConfig) -> Self {
        Self {
            max_chunk_size: config.max_chunk_size.max(1),
            overlap: config.chunk_overlap,
            lookback: config.boundary_lookback,
        }
    }
}

/// 工作区索引器
#[derive(Debug, Clone)]
pub struct WorkspaceIndexer {
    extensions: Vec<String>,
    excluded_dirs: Vec<String>,
    chunking: ChunkConfig,
}

impl Default for WorkspaceIndexer {
    fn default() -> Self {
        Self::new(&WorkspaceConfig::default())
    }
}

impl WorkspaceIndexer {
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            extensions: config.extensions.clone(),
            excluded_dirs: config.excluded_dirs.clone(),
            chunking: ChunkConfig::from(config),
        }
    }

    /// 增量扫描：只读取并切分新增或指纹变化的文件
    pub async fn index_incremental(
        &self,
        root: &Path,
        previous: &FingerprintMap,
    ) -> Result<IndexResult, IndexError> {
        let files = self.discover(root)?;
        let mut result = IndexResult::default();

        for rel in files {
            let abs = root.join(&rel);
            let meta = match tokio::fs::metadata(&abs).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %rel, error = %e, "Failed to stat file");
                    continue;
                }
            };
            let fingerprint = FileFingerprint {
                mtime: meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0),
                size: meta.len(),
            };

            if previous.get(&rel) != Some(&fingerprint) {
                match tokio::fs::read_to_string(&abs).await {
                    Ok(content) => {
                        let chunks = chunk_content(&content, self.chunking);
                        result.changed_documents.push(Document {
                            path: rel.clone(),
                            content,
                            chunks,
                        });
                    }
                    Err(e) => {
                        warn!(path = %rel, error = %e, "Failed to read file, skipping");
                        continue;
                    }
                }
            }
            result.metadata.insert(rel, fingerprint);
        }

        result.deleted_files = previous
            .keys()
            .filter(|path| !result.metadata.contains_key(*path))
            .cloned()
            .collect();
        result.deleted_files.sort();

        info!(
            changed = result.changed_documents.len(),
            deleted = result.deleted_files.len(),
            total = result.metadata.len(),
            "Workspace scan complete"
        );
        Ok(result)
    }

    /// 全量扫描
    pub async fn index_workspace(&self, root: &Path) -> Result<Vec<Document>, IndexError> {
        Ok(self
            .index_incremental(root, &FingerprintMap::new())
            .await?
            .changed_documents)
    }

    /// 发现候选文件，返回排序后的相对路径
    fn discover(&self, root: &Path) -> Result<Vec<String>, IndexError> {
        let mut files: Vec<String> = Vec::new();
        let root_pattern = glob::Pattern::escape(&root.to_string_lossy());

        for ext in &self.extensions {
            let pattern = format!("{root_pattern}/**/*.{ext}");
            let entries = glob(&pattern).map_err(|e| IndexError::Pattern(e.to_string()))?;
            for entry in entries {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        debug!(error = %e, "Skipping unreadable glob entry");
                        continue;
                    }
                };
                if !path.is_file() {
                    continue;
                }
                let Ok(rel) = path.strip_prefix(root) else {
                    continue;
                };
                if self.is_excluded(rel) {
                    continue;
                }
                files.push(to_slash_path(rel));
            }
        }

        files.sort();
        files.dedup();
        Ok(files)
    }

    fn is_excluded(&self, rel: &Path) -> bool {
        rel.components().any(|c| match c {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                self.excluded_dirs.iter().any(|d| d.as_str() == name)
            }
            _ => false,
        })
    }
}

fn to_slash_path(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// 将内容切分为带重叠的 chunk
///
/// 每个 chunk 最多 `max_chunk_size` 个字符。断点优先级：回看窗口内的
/// 语法边界 (声明、标题、空行) → 回看窗口内最近的换行 → 硬切。
pub fn chunk_content(content: &str, config: ChunkConfig) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    let n = chars.len();
    if n == 0 {
        return Vec::new();
    }

    let max = config.max_chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    loop {
        let hard_end = (start + max).min(n);
        let end = if hard_end < n {
            find_break(&chars, start, hard_end, config.lookback)
        } else {
            n
        };

        chunks.push(chars[start..end].iter().collect());
        if end >= n {
            break;
        }

        let next = end.saturating_sub(config.overlap);
        start = if next > start { next } else { end };
    }

    chunks
}

/// 在 (start, hard_end] 的回看窗口内寻找断点；返回值总是 > start
fn find_break(chars: &[char], start: usize, hard_end: usize, lookback: usize) -> usize {
    let floor = hard_end.saturating_sub(lookback).max(start + 1);

    // 语法边界：位于行首且该行以声明 / 标题开头，或前一行为空
    for i in (floor..hard_end).rev() {
        if chars[i - 1] != '\n' {
            continue;
        }
        let blank_before = i >= 2 && chars[i - 2] == '\n';
        if blank_before || line_starts_boundary(&chars[i..]) {
            return i;
        }
    }

    // 最近的换行
    for i in (floor..hard_end).rev() {
        if chars[i - 1] == '\n' {
            return i;
        }
    }

    hard_end
}

fn line_starts_boundary(rest: &[char]) -> bool {
    let line: String = rest
        .iter()
        .take_while(|c| **c != '\n')
        .take(40)
        .collect();
    let trimmed = line.trim_start();
    BOUNDARY_PREFIXES.iter().any(|p| trimmed.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small(max: usize, overlap: usize, lookback: usize) -> ChunkConfig {
        ChunkConfig {
            max_chunk_size: max,
            overlap,
            lookback,
        }
    }

    #[test]
    fn test_empty_content_has_no_chunks() {
        assert!(chunk_content("", ChunkConfig::default()).is_empty());
    }

    #[test]
    fn test_short_content_is_single_chunk() {
        let chunks = chunk_content("fn main() {}\n", ChunkConfig::default());
        assert_eq!(chunks, vec!["fn main() {}\n".to_string()]);
    }

    #[test]
    fn test_hard_cut_with_overlap() {
        let content = "a".repeat(2500);
        let chunks = chunk_content(&content, ChunkConfig::default());
        assert_eq!(chunks[0].len(), 1000);
        assert_eq!(chunks[1].len(), 1000);
        // 每个 chunk 从上一个结束前 100 个字符开始
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 2500 + 100 * (chunks.len() - 1));
        assert!(chunks.iter().all(|c| c.chars().count() <= 1000));
    }

    #[test]
    fn test_prefers_declaration_boundary() {
        let content = format!("{}\nfn second() {{}}\n{}", "x".repeat(30), "y".repeat(30));
        let chunks = chunk_content(&content, small(50, 5, 40));
        assert!(chunks[0].ends_with('\n'));
        assert!(chunks[0].starts_with("xxx"));
        assert!(chunks[1].contains("fn second"));
    }

    #[test]
    fn test_multibyte_content_is_char_safe() {
        let content = "数据".repeat(700);
        let chunks = chunk_content(&content, ChunkConfig::default());
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.chars().count() <= 1000));
    }

    #[test]
    fn test_overlap_larger_than_chunk_still_progresses() {
        let content = "abcdefghij".repeat(10);
        let chunks = chunk_content(&content, small(10, 50, 0));
        assert_eq!(chunks.len(), 10);
    }

    #[tokio::test]
    async fn test_incremental_scan_detects_changes_and_deletions() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(root.join("src/a.ts"), "export const a = 1;\n").unwrap();
        std::fs::write(root.join("src/b.rs"), "fn b() {}\n").unwrap();
        std::fs::write(root.join("node_modules/pkg/index.js"), "module.exports = 1;\n").unwrap();
        std::fs::write(root.join("image.png"), [0u8, 1, 2]).unwrap();

        let indexer = WorkspaceIndexer::default();
        let first = indexer.index_incremental(root, &FingerprintMap::new()).await.unwrap();
        let mut paths: Vec<&str> = first.changed_documents.iter().map(|d| d.path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["src/a.ts", "src/b.rs"]);
        assert!(first.deleted_files.is_empty());

        // 未变化的文件不再返回
        let second = indexer.index_incremental(root, &first.metadata).await.unwrap();
        assert!(second.changed_documents.is_empty());

        std::fs::remove_file(root.join("src/b.rs")).unwrap();
        std::fs::write(root.join("src/a.ts"), "export const a = 2; // changed size\n").unwrap();
        let third = indexer.index_incremental(root, &second.metadata).await.unwrap();
        assert_eq!(third.changed_documents.len(), 1);
        assert_eq!(third.changed_documents[0].path, "src/a.ts");
        assert_eq!(third.deleted_files, vec!["src/b.rs".to_string()]);
        assert!(!third.metadata.contains_key("src/b.rs"));
    }
}
