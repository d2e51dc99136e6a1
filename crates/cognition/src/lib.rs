//! Octo Cognition - 工作区检索
//!
//! 职责：
//! - 工作区增量扫描与切分 (Indexer)
//! - 向量嵌入与余弦检索 (VectorIndex)
//! - 索引快照与文件指纹的持久化
//!
//! 架构：
//! - indexer: 文件发现、指纹、chunk 切分
//! - vector: Embedder、VectorIndex

pub mod indexer;
pub mod vector;

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

pub use indexer::{
    chunk_content, ChunkConfig, Document, FileFingerprint, FingerprintMap, IndexResult,
    WorkspaceIndexer,
};
pub use vector::{
    cosine_similarity, Embedder, HashingEmbedder, IndexedChunk, SearchResult, VectorIndex,
};

/// 向量快照文件名
pub const VECTOR_STORE_FILE: &str = "vector_store.json";

/// 指纹元数据文件名
pub const METADATA_FILE: &str = "metadata.json";

/// 检索层错误
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid glob pattern: {0}")]
    Pattern(String),

    #[error("Embedding failed: {0}")]
    Embedding(String),
}

/// 读取指纹元数据；缺失或损坏时返回空表
pub async fn load_fingerprints(path: &Path) -> FingerprintMap {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice::<HashMap<String, FileFingerprint>>(&bytes) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt index metadata, rescanning");
                FingerprintMap::new()
            }
        },
        Err(_) => FingerprintMap::new(),
    }
}

/// 写入指纹元数据 (临时文件 + 重命名)
pub async fn save_fingerprints(path: &Path, map: &FingerprintMap) -> Result<(), IndexError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(map)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fingerprint_round_trip_and_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".octotask").join(METADATA_FILE);

        assert!(load_fingerprints(&path).await.is_empty());

        let mut map = FingerprintMap::new();
        map.insert("src/a.rs".into(), FileFingerprint { mtime: 42, size: 7 });
        save_fingerprints(&path, &map).await.unwrap();
        assert_eq!(load_fingerprints(&path).await, map);

        tokio::fs::write(&path, b"[broken").await.unwrap();
        assert!(load_fingerprints(&path).await.is_empty());
    }
}
