//! Vector Index - 语义检索
//!
//! 职责：
//! - 通过 `Embedder` 将 chunk 嵌入为向量
//! - 余弦相似度 top-k 检索
//! - 按文件删除向量
//! - 以带校验和的 JSON 快照持久化
//!
//! 设计原则：
//! - 默认使用确定性的特征哈希嵌入，不依赖模型下载
//! - 快照缺失不是错误；快照损坏记录日志后按空索引处理

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::indexer::Document;
use crate::IndexError;

/// 快照格式版本
const SNAPSHOT_VERSION: u32 = 1;

/// 默认嵌入维度
pub const DEFAULT_DIMENSIONS: usize = 256;

/// 嵌入能力
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError>;
}

/// 特征哈希嵌入
///
/// 词与相邻词对经 FNV-1a 哈希到固定维度，符号位取自哈希高位，结果做 L2 归一化。
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// 分词
    fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|s| s.chars().count() > 1)
            .map(|s| s.to_string())
            .collect()
    }

    fn fnv1a(bytes: &[u8]) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in bytes {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        hash
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = Self::fnv1a(feature.as_bytes());
        let bucket = (hash % self.dimensions as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let tokens = Self::tokenize(text);

        for token in &tokens {
            self.accumulate(&mut vector, token, 1.0);
            // snake_case / 复合词拆分
            if token.contains('_') {
                for part in token.split('_').filter(|p| p.len() > 1) {
                    self.accumulate(&mut vector, part, 0.5);
                }
            }
        }
        for pair in tokens.windows(2) {
            self.accumulate(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        Ok(self.embed_sync(text))
    }
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// 余弦相似度；任一向量为零向量或维度不同时为 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut mag_a = 0.0f32;
    let mut mag_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a.sqrt() * mag_b.sqrt())
}

/// 已嵌入的 chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub path: String,
    pub chunk: String,
    pub embedding: Vec<f32>,
}

/// 检索结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub path: String,
    pub score: f32,
    pub chunk: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexSnapshot {
    version: u32,
    dimensions: usize,
    checksum: String,
    chunks: Vec<IndexedChunk>,
}

fn checksum(chunks: &[IndexedChunk]) -> Result<String, IndexError> {
    let bytes = serde_json::to_vec(chunks)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// 向量索引
pub struct VectorIndex {
    chunks: Vec<IndexedChunk>,
    embedder: Arc<dyn Embedder>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("chunks", &self.chunks.len())
            .field("dimensions", &self.embedder.dimensions())
            .finish()
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new(Arc::new(HashingEmbedder::default()))
    }
}

impl VectorIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            chunks: Vec::new(),
            embedder,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// 嵌入并加入文档的所有 chunk；单个 chunk 失败只记录日志。返回新增数量。
    pub async fn add_documents(&mut self, documents: &[Document]) -> usize {
        let before = self.chunks.len();
        for doc in documents {
            for chunk in &doc.chunks {
                match self.embedder.embed(chunk).await {
                    Ok(embedding) => self.chunks.push(IndexedChunk {
                        path: doc.path.clone(),
                        chunk: chunk.clone(),
                        embedding,
                    }),
                    Err(e) => warn!(path = %doc.path, error = %e, "Failed to embed chunk"),
                }
            }
        }
        let added = self.chunks.len() - before;
        debug!(documents = documents.len(), added, total = self.chunks.len(), "Documents embedded");
        added
    }

    /// 删除某文件的全部向量，返回删除数量
    pub fn remove_documents(&mut self, path: &str) -> usize {
        let before = self.chunks.len();
        self.chunks.retain(|c| c.path != path);
        before - self.chunks.len()
    }

    /// 余弦相似度检索，按分数降序返回至多 k 个结果
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>, IndexError> {
        if k == 0 || self.chunks.is_empty() {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed(query).await?;

        let mut scored: Vec<(f32, &IndexedChunk)> = self
            .chunks
            .iter()
            .map(|c| (cosine_similarity(&query_embedding, &c.embedding), c))
            .collect();
        // 稳定排序：同分时保持插入顺序
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, c)| SearchResult {
                path: c.path.clone(),
                score,
                chunk: c.chunk.clone(),
            })
            .collect())
    }

    /// 持久化为 JSON 快照 (先写临时文件再重命名)
    pub async fn save(&self, path: &Path) -> Result<(), IndexError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let snapshot = IndexSnapshot {
            version: SNAPSHOT_VERSION,
            dimensions: self.embedder.dimensions(),
            checksum: checksum(&self.chunks)?,
            chunks: self.chunks.clone(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), chunks = self.chunks.len(), "Vector index saved");
        Ok(())
    }

    /// 从快照加载，替换当前内容。返回加载的 chunk 数。
    ///
    /// 文件不存在时返回 0；快照损坏、校验失败或维度不匹配时清空索引并返回 0。
    pub async fn load(&mut self, path: &Path) -> Result<usize, IndexError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No vector snapshot");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        self.chunks.clear();
        let snapshot: IndexSnapshot = match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt vector snapshot, starting empty");
                return Ok(0);
            }
        };

        if snapshot.version != SNAPSHOT_VERSION || snapshot.dimensions != self.embedder.dimensions() {
            warn!(
                version = snapshot.version,
                dimensions = snapshot.dimensions,
                "Incompatible vector snapshot, starting empty"
            );
            return Ok(0);
        }
        if checksum(&snapshot.chunks)? != snapshot.checksum {
            warn!(path = %path.display(), "Vector snapshot checksum mismatch, starting empty");
            return Ok(0);
        }

        self.chunks = snapshot.chunks;
        info!(path = %path.display(), chunks = self.chunks.len(), "Vector index loaded");
        Ok(self.chunks.len())
    }

    /// 已索引的文件 (去重、排序)
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.chunks.iter().map(|c| c.path.clone()).collect();
        paths.sort();
        paths.dedup();
        paths
    }
}
