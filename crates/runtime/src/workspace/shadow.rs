//! Shadow Store - 暂存文件系统
//!
//! 职责：
//! - 写入先暂存到 `<workspace>/.octotask/shadow/<rel>`
//! - 读取按 暂存 → 已提交 → 不存在 的顺序解析
//! - 提交 / 丢弃单个文件或全部暂存
//! - 暂存删除 (tombstone)：隐藏已提交文件，提交时删除
//!
//! 安全约束：
//! - 所有路径必须位于工作区根目录之内，`..` 越界与外部绝对路径被拒绝
//! - 同一路径的提交通过每路径的异步锁串行化

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use octo_core::STATE_DIR;

const SHADOW_DIR: &str = "shadow";
const TOMBSTONE_DIR: &str = "shadow-deleted";

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path escapes workspace root: {0}")]
    PathEscape(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("No staged changes for: {0}")]
    NothingStaged(String),
}

pub type Result<T> = std::result::Result<T, ShadowError>;

/// 暂存变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedKind {
    Write,
    Delete,
}

/// 一条暂存变更
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedChange {
    pub path: String,
    pub kind: StagedKind,
}

/// 提交结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Written,
    Deleted,
}

/// 解析后的路径
#[derive(Debug, Clone)]
struct ResolvedPath {
    rel: String,
    real: PathBuf,
    shadow: PathBuf,
    tombstone: PathBuf,
}

/// 暂存文件系统
#[derive(Debug)]
pub struct ShadowStore {
    root: PathBuf,
    shadow_root: PathBuf,
    tombstone_root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ShadowStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state = root.join(STATE_DIR);
        Self {
            shadow_root: state.join(SHADOW_DIR),
            tombstone_root: state.join(TOMBSTONE_DIR),
            root,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shadow_root(&self) -> &Path {
        &self.shadow_root
    }

    /// 将工作区相对路径规范化为 `/` 分隔形式
    pub fn normalize(&self, path: &str) -> Result<String> {
        let candidate = Path::new(path.trim());
        let relative = if candidate.is_absolute() {
            candidate
                .strip_prefix(&self.root)
                .map_err(|_| ShadowError::PathEscape(path.to_string()))?
        } else {
            candidate
        };

        let mut parts: Vec<String> = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => parts.push(name.to_string_lossy().into_owned()),
                Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(ShadowError::PathEscape(path.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(ShadowError::PathEscape(path.to_string()));
                }
            }
        }

        if parts.is_empty() {
            return Err(ShadowError::InvalidPath(path.to_string()));
        }
        if parts[0] == STATE_DIR {
            return Err(ShadowError::InvalidPath(format!(
                "{path} is inside the {STATE_DIR} state directory"
            )));
        }
        Ok(parts.join("/"))
    }

    fn resolve(&self, path: &str) -> Result<ResolvedPath> {
        let rel = self.normalize(path)?;
        Ok(ResolvedPath {
            real: self.root.join(&rel),
            shadow: self.shadow_root.join(&rel),
            tombstone: self.tombstone_root.join(&rel),
            rel,
        })
    }

    /// 暂存写入
    pub async fn write(&self, path: &str, content: &str) -> Result<String> {
        let p = self.resolve(path)?;
        if let Some(parent) = p.shadow.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&p.shadow, content).await?;
        remove_if_exists(&p.tombstone).await?;
        debug!(path = %p.rel, bytes = content.len(), "Staged write");
        Ok(p.rel)
    }

    /// 有效内容：暂存优先，其次已提交；不存在或已暂存删除时为 None
    pub async fn read(&self, path: &str) -> Result<Option<String>> {
        let p = self.resolve(path)?;
        if exists(&p.tombstone).await {
            return Ok(None);
        }
        if let Some(content) = read_optional(&p.shadow).await? {
            return Ok(Some(content));
        }
        read_optional(&p.real).await
    }

    /// 暂存删除
    pub async fn stage_delete(&self, path: &str) -> Result<String> {
        let p = self.resolve(path)?;
        let staged = is_file(&p.shadow).await;
        let committed = is_file(&p.real).await;
        if exists(&p.tombstone).await || (!staged && !committed) {
            return Err(ShadowError::NotFound(p.rel));
        }

        remove_if_exists(&p.shadow).await?;
        if committed {
            if let Some(parent) = p.tombstone.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&p.tombstone, b"").await?;
        }
        debug!(path = %p.rel, "Staged delete");
        Ok(p.rel)
    }

    async fn path_lock(&self, rel: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(rel.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 不再被持有的路径锁从表中移除
    async fn release_path_lock(&self, rel: &str) {
        let mut locks = self.locks.lock().await;
        if locks.get(rel).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(rel);
        }
    }

    /// 提交单个文件
    pub async fn commit(&self, path: &str) -> Result<CommitOutcome> {
        let p = self.resolve(path)?;
        let lock = self.path_lock(&p.rel).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.commit_locked(&p).await
        };
        drop(lock);
        self.release_path_lock(&p.rel).await;
        outcome
    }

    async fn commit_locked(&self, p: &ResolvedPath) -> Result<CommitOutcome> {
        if exists(&p.tombstone).await {
            remove_if_exists(&p.real).await?;
            remove_if_exists(&p.tombstone).await?;
            info!(path = %p.rel, "Committed delete");
            return Ok(CommitOutcome::Deleted);
        }

        let content = match tokio::fs::read(&p.shadow).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ShadowError::NothingStaged(p.rel.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(parent) = p.real.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = sibling_tmp(&p.real);
        tokio::fs::write(&tmp, &content).await?;
        tokio::fs::rename(&tmp, &p.real).await?;

        if let Err(e) = tokio::fs::remove_file(&p.shadow).await {
            warn!(path = %p.rel, error = %e, "Committed but failed to remove shadow copy");
        }
        info!(path = %p.rel, bytes = content.len(), "Committed");
        Ok(CommitOutcome::Written)
    }

    /// 提交全部暂存，返回已提交的相对路径
    pub async fn commit_all(&self) -> Result<Vec<String>> {
        let mut committed = Vec::new();
        for change in self.staged_changes().await? {
            match self.commit(&change.path).await {
                Ok(_) => committed.push(change.path),
                // 并发提交已处理
                Err(ShadowError::NothingStaged(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(committed)
    }

    /// 丢弃单个文件的暂存；返回是否存在暂存
    pub async fn discard(&self, path: &str) -> Result<bool> {
        let p = self.resolve(path)?;
        let lock = self.path_lock(&p.rel).await;
        let outcome = {
            let _guard = lock.lock().await;
            discard_locked(&p).await
        };
        drop(lock);
        self.release_path_lock(&p.rel).await;
        outcome
    }

    /// 丢弃全部暂存
    pub async fn discard_all(&self) -> Result<usize> {
        let count = self.staged_changes().await?.len();
        for dir in [&self.shadow_root, &self.tombstone_root] {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(count, "Discarded all staged changes");
        Ok(count)
    }

    pub async fn has_staged(&self, path: &str) -> Result<bool> {
        let p = self.resolve(path)?;
        Ok(is_file(&p.shadow).await || exists(&p.tombstone).await)
    }

    /// 全部暂存变更，按路径排序
    pub async fn staged_changes(&self) -> Result<Vec<StagedChange>> {
        let mut changes: Vec<StagedChange> = walk_files(&self.shadow_root)
            .await?
            .into_iter()
            .map(|path| StagedChange {
                path,
                kind: StagedKind::Write,
            })
            .collect();
        for path in walk_files(&self.tombstone_root).await? {
            changes.push(StagedChange {
                path,
                kind: StagedKind::Delete,
            });
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    /// 目录的有效视图：已提交内容合并暂存写入，去掉暂存删除。目录以 `/` 结尾。
    pub async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let (real_dir, shadow_dir, tombstone_dir) = if matches!(path.trim(), "" | "." | "./") {
            (
                self.root.clone(),
                self.shadow_root.clone(),
                self.tombstone_root.clone(),
            )
        } else {
            let p = self.resolve(path)?;
            (p.real, p.shadow, p.tombstone)
        };

        let real = read_dir_names(&real_dir).await?;
        let shadow = read_dir_names(&shadow_dir).await?;
        if real.is_none() && shadow.is_none() {
            return Err(ShadowError::NotFound(path.to_string()));
        }

        let deleted: Vec<String> = read_dir_names(&tombstone_dir)
            .await?
            .unwrap_or_default()
            .into_iter()
            .filter(|n| !n.ends_with('/'))
            .collect();

        let mut names: Vec<String> = real
            .unwrap_or_default()
            .into_iter()
            .filter(|n| n.trim_end_matches('/') != STATE_DIR)
            .filter(|n| !deleted.contains(n))
            .collect();
        for name in shadow.unwrap_or_default() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

fn sibling_tmp(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.octo-tmp"))
}

async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn discard_locked(p: &ResolvedPath) -> Result<bool> {
    let had_write = remove_if_exists(&p.shadow).await?;
    let had_delete = remove_if_exists(&p.tombstone).await?;
    Ok(had_write || had_delete)
}

async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn read_dir_names(dir: &Path) -> Result<Option<Vec<String>>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await?.is_dir() {
            name.push('/');
        }
        names.push(name);
    }
    Ok(Some(names))
}

/// 递归列出目录下全部文件的相对路径
async fn walk_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut stack: Vec<(PathBuf, String)> = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            if entry.file_type().await?.is_dir() {
                stack.push((entry.path(), rel));
            } else {
                files.push(rel);
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ShadowStore) {
        let dir = TempDir::new().unwrap();
        let store = ShadowStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_staged_write_does_not_touch_real_file() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("a.txt"), "committed").unwrap();

        store.write("a.txt", "staged").await.unwrap();
        assert_eq!(store.read("a.txt").await.unwrap().as_deref(), Some("staged"));
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "committed");

        assert_eq!(store.commit("a.txt").await.unwrap(), CommitOutcome::Written);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "staged");
        assert!(!store.has_staged("a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_resolution_order() {
        let (dir, store) = store();
        assert!(store.read("missing.txt").await.unwrap().is_none());

        std::fs::write(dir.path().join("b.txt"), "real").unwrap();
        assert_eq!(store.read("b.txt").await.unwrap().as_deref(), Some("real"));
    }

    #[tokio::test]
    async fn test_discard_restores_committed_view() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("a.txt"), "committed").unwrap();
        store.write("a.txt", "staged").await.unwrap();
        store.write("new/b.txt", "new").await.unwrap();

        assert_eq!(store.discard_all().await.unwrap(), 2);
        assert_eq!(store.read("a.txt").await.unwrap().as_deref(), Some("committed"));
        assert!(store.read("new/b.txt").await.unwrap().is_none());
        assert!(store.staged_changes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_all_returns_committed_paths() {
        let (dir, store) = store();
        store.write("src/lib.rs", "pub fn a() {}").await.unwrap();
        store.write("README.md", "# hi").await.unwrap();

        let committed = store.commit_all().await.unwrap();
        assert_eq!(committed, vec!["README.md".to_string(), "src/lib.rs".to_string()]);
        assert!(dir.path().join("src/lib.rs").exists());
        assert!(store.staged_changes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_paths_outside_root() {
        let (_dir, store) = store();
        assert!(matches!(
            store.write("../escape.txt", "x").await,
            Err(ShadowError::PathEscape(_))
        ));
        assert!(matches!(
            store.read("/etc/passwd").await,
            Err(ShadowError::PathEscape(_))
        ));
        assert!(matches!(
            store.write("a/../../b", "x").await,
            Err(ShadowError::PathEscape(_))
        ));
        assert!(matches!(
            store.write(".octotask/shadow/x", "x").await,
            Err(ShadowError::InvalidPath(_))
        ));
        assert_eq!(store.normalize("./a/./b/../c.rs").unwrap(), "a/c.rs");
    }

    #[tokio::test]
    async fn test_absolute_path_inside_root_is_accepted() {
        let (dir, store) = store();
        let abs = dir.path().join("inside.txt");
        store.write(abs.to_str().unwrap(), "x").await.unwrap();
        assert!(store.has_staged("inside.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_without_staged_content_errors() {
        let (_dir, store) = store();
        assert!(matches!(
            store.commit("nothing.txt").await,
            Err(ShadowError::NothingStaged(_))
        ));
    }

    #[tokio::test]
    async fn test_staged_delete_hides_then_removes_file() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("old.txt"), "bye").unwrap();

        store.stage_delete("old.txt").await.unwrap();
        assert!(store.read("old.txt").await.unwrap().is_none());
        assert!(dir.path().join("old.txt").exists());
        assert!(!store.list_dir(".").await.unwrap().contains(&"old.txt".to_string()));

        assert_eq!(store.commit("old.txt").await.unwrap(), CommitOutcome::Deleted);
        assert!(!dir.path().join("old.txt").exists());
        assert!(matches!(
            store.stage_delete("old.txt").await,
            Err(ShadowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_dir_merges_views() {
        let (dir, store) = store();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.rs"), "").unwrap();
        store.write("src/b.rs", "").await.unwrap();

        assert_eq!(store.list_dir("src").await.unwrap(), vec!["a.rs", "b.rs"]);
        let root = store.list_dir(".").await.unwrap();
        assert!(root.contains(&"src/".to_string()));
        assert!(!root.iter().any(|n| n.starts_with(".octotask")));
    }

    #[tokio::test]
    async fn test_concurrent_commits_of_same_path_serialize() {
        let (dir, store) = store();
        let store = Arc::new(store);
        store.write("race.txt", "value").await.unwrap();

        let a = tokio::spawn({
            let store = store.clone();
            async move { store.commit("race.txt").await }
        });
        let b = tokio::spawn({
            let store = store.clone();
            async move { store.commit("race.txt").await }
        });
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ShadowError::NothingStaged(_)))));
        assert_eq!(std::fs::read_to_string(dir.path().join("race.txt")).unwrap(), "value");
    }

    #[tokio::test]
    async fn test_path_locks_released_after_commit_and_discard() {
        let (_dir, store) = store();
        for i in 0..20 {
            let path = format!("src/file_{i}.rs");
            store.write(&path, "fn f() {}").await.unwrap();
            if i % 2 == 0 {
                store.commit(&path).await.unwrap();
            } else {
                assert!(store.discard(&path).await.unwrap());
            }
        }
        assert!(store.commit("src/file_0.rs").await.is_err());
        assert!(store.locks.lock().await.is_empty());
    }
}
