//! 会话快照存储
//!
//! 每个会话一个 JSON 文件：`<workspace>/.octotask/sessions/<id>.json`。
//! 写入先落到临时文件再重命名；列举时跳过无法解析的文件。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

use octo_core::{FlowEntry, TestResult, STATE_DIR};

use crate::{PersistenceError, Result};

/// 快照格式版本
pub const SNAPSHOT_VERSION: &str = "1.0.0";

/// 默认保留的会话数量
pub const DEFAULT_KEEP_SESSIONS: usize = 10;

/// Token 统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetrics {
    pub input: u64,
    pub output: u64,
    pub pruned: u64,
    pub turns: u64,
}

/// 会话元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_metrics: Option<TokenMetrics>,
}

/// 持久化的会话快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub version: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub goal: String,
    pub flow: Vec<FlowEntry>,
    #[serde(default)]
    pub test_history: Vec<TestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
}

impl SessionSnapshot {
    pub fn new(
        session_id: impl Into<String>,
        goal: impl Into<String>,
        flow: Vec<FlowEntry>,
        test_history: Vec<TestResult>,
        metadata: Option<SessionMetadata>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            goal: goal.into(),
            flow,
            test_history,
            metadata,
        }
    }
}

/// 会话列表项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub goal: String,
}

/// 会话持久化
#[derive(Debug)]
pub struct SessionPersistence {
    storage_path: PathBuf,
    current_session_id: RwLock<Option<String>>,
}

impl SessionPersistence {
    /// 以工作区根目录创建
    pub fn new(workspace_root: &Path) -> Self {
        Self::with_storage_path(workspace_root.join(STATE_DIR).join("sessions"))
    }

    pub fn with_storage_path(storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            current_session_id: RwLock::new(None),
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    fn session_file(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.storage_path.join(format!("{session_id}.json")))
    }

    /// 保存快照，返回文件路径，并记为当前会话
    pub async fn save_session(&self, session: &SessionSnapshot) -> Result<PathBuf> {
        let file = self.session_file(&session.session_id)?;
        tokio::fs::create_dir_all(&self.storage_path).await?;

        let content = serde_json::to_vec_pretty(session)?;
        let tmp = file.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &file).await?;

        self.set_current(&session.session_id);
        debug!(session = %session.session_id, entries = session.flow.len(), "Session saved");
        Ok(file)
    }

    /// 加载快照；不存在时返回 None
    pub async fn load_session(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let file = self.session_file(session_id)?;
        match tokio::fs::read(&file).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 列出会话，最新的在前；无法解析的文件被跳过
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut sessions = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.storage_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(PersistenceError::from)
                .and_then(|bytes| {
                    serde_json::from_slice::<SessionSnapshot>(&bytes).map_err(PersistenceError::from)
                });
            match parsed {
                Ok(session) => sessions.push(SessionSummary {
                    session_id: session.session_id,
                    timestamp: session.timestamp,
                    goal: session.goal,
                }),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session file"),
            }
        }

        sessions.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.session_id.cmp(&a.session_id))
        });
        Ok(sessions)
    }

    /// 删除会话；不存在时返回 false
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let file = self.session_file(session_id)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// 最新的会话
    pub async fn last_session(&self) -> Result<Option<SessionSnapshot>> {
        match self.list_sessions().await?.first() {
            Some(summary) => self.load_session(&summary.session_id).await,
            None => Ok(None),
        }
    }

    /// 由当前状态构造快照并保存
    pub async fn create_snapshot(
        &self,
        session_id: &str,
        goal: &str,
        flow: Vec<FlowEntry>,
        test_history: Vec<TestResult>,
        metadata: Option<SessionMetadata>,
    ) -> Result<PathBuf> {
        let snapshot = SessionSnapshot::new(session_id, goal, flow, test_history, metadata);
        self.save_session(&snapshot).await
    }

    /// 与 `create_snapshot` 相同，但失败只记录日志
    pub async fn auto_save(
        &self,
        session_id: &str,
        goal: &str,
        flow: Vec<FlowEntry>,
        test_history: Vec<TestResult>,
        metadata: Option<SessionMetadata>,
    ) -> bool {
        match self
            .create_snapshot(session_id, goal, flow, test_history, metadata)
            .await
        {
            Ok(path) => {
                info!(session = %session_id, path = %path.display(), "Auto-saved session");
                true
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "Auto-save failed");
                false
            }
        }
    }

    /// 只保留最新的 `keep` 个会话，返回删除数量
    pub async fn cleanup_old_sessions(&self, keep: usize) -> Result<usize> {
        let sessions = self.list_sessions().await?;
        let mut deleted = 0;
        for summary in sessions.iter().skip(keep) {
            match self.delete_session(&summary.session_id).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => warn!(session = %summary.session_id, error = %e, "Failed to delete old session"),
            }
        }
        Ok(deleted)
    }

    /// 导出到任意路径；会话不存在时返回 false
    pub async fn export_session(&self, session_id: &str, export_path: &Path) -> Result<bool> {
        let Some(session) = self.load_session(session_id).await? else {
            return Ok(false);
        };
        if let Some(parent) = export_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(export_path, serde_json::to_vec_pretty(&session)?).await?;
        Ok(true)
    }

    /// 导入快照，以 `<id>_imported_<millis>` 作为新 id 保存
    pub async fn import_session(&self, import_path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(import_path).await?;
        let mut session: SessionSnapshot = serde_json::from_slice(&bytes)?;

        let now = Utc::now();
        session.session_id = format!(
            "{}_imported_{}",
            session.session_id,
            now.timestamp_millis()
        );
        session.timestamp = now;

        self.save_session(&session).await?;
        Ok(session.session_id)
    }

    pub fn current_session_id(&self) -> Option<String> {
        match self.current_session_id.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_current(&self, session_id: &str) {
        let mut guard = match self.current_session_id.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(session_id.to_string());
    }
}

fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !session_id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidSessionId(session_id.to_string()))
    }
}
