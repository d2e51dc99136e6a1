//! Octo Persistence - 持久化层
//!
//! 职责：
//! - 会话快照 (Flow、测试历史、元数据) 的保存与恢复
//! - 会话列举、清理、导入导出
//!
//! 设计原则：
//! - 原子写入 (临时文件 + 重命名)
//! - 损坏的文件被跳过而非中断列举

pub mod session;

use thiserror::Error;

pub use session::{
    SessionMetadata, SessionPersistence, SessionSnapshot, SessionSummary, TokenMetrics,
    DEFAULT_KEEP_SESSIONS, SNAPSHOT_VERSION,
};

/// 持久化错误
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
