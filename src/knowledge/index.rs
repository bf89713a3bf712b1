//! 相似度索引：文档分块、关键词索引与向量索引
//!
//! 两种索引都实现 [`SimilarityIndex`]：按 scope 过滤后返回得分最高的 k 个段落。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::core::RetrievalError;
use crate::llm::EmbeddingProvider;
use crate::memory::tokenizer::{overlap_score, tokenize_to_set};

/// 检索范围
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "scope", content = "character_id", rename_all = "snake_case")]
pub enum Scope {
    World,
    Character(String),
}

/// 检索结果段落
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub text: String,
    /// 来源文档（文件名或 `character:<id>`）
    pub source: String,
    pub scope: Scope,
    pub score: f32,
}

/// 分块策略
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// 目标块大小（字符数）
    pub chunk_size: usize,
    /// 块之间的重叠（字符数）
    pub chunk_overlap: usize,
    /// 分隔符优先级（从高到低）
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 300,
            chunk_overlap: 50,
            separators: vec![
                "\n\n".to_string(),
                "\n".to_string(),
                "。".to_string(),
                ". ".to_string(),
                "! ".to_string(),
                "? ".to_string(),
                " ".to_string(),
            ],
        }
    }
}

/// 文档分块器
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// 将文档分割为块（UTF-8 安全），优先在分隔符处断开
    pub fn chunk(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let total_chars = chars.len();
        let chunk_size = self.config.chunk_size.max(1);
        let mut chunks = Vec::new();
        let mut current_idx = 0;

        while current_idx < total_chars {
            let target_end = (current_idx + chunk_size).min(total_chars);
            let mut actual_end = target_end;

            if target_end < total_chars {
                let slice: String = chars[current_idx..target_end].iter().collect();
                for sep in &self.config.separators {
                    if let Some(pos) = slice.rfind(sep.as_str()) {
                        let chars_to_sep = slice[..pos].chars().count() + sep.chars().count();
                        if chars_to_sep > 0 {
                            actual_end = current_idx + chars_to_sep;
                            break;
                        }
                    }
                }
            }

            let chunk_text: String = chars[current_idx..actual_end].iter().collect();
            let trimmed = chunk_text.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }

            if actual_end >= total_chars {
                break;
            }

            let overlap = self.config.chunk_overlap.min(actual_end - current_idx);
            let next_start = actual_end.saturating_sub(overlap);
            current_idx = if next_start > current_idx {
                next_start
            } else {
                actual_end
            };
        }

        chunks
    }
}

/// 相似度索引能力
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// 返回 scope 内最多 k 个段落，得分降序
    async fn search(&self, query: &str, scope: &Scope, k: usize) -> Result<Vec<Passage>, RetrievalError>;

    fn name(&self) -> &str;
}

/// 得分降序（稳定）并截断
fn top_k(mut passages: Vec<Passage>, k: usize) -> Vec<Passage> {
    passages.sort_by(|a, b| b.score.total_cmp(&a.score));
    passages.truncate(k);
    passages
}

#[derive(Debug, Clone)]
struct KeywordEntry {
    text: String,
    source: String,
    scope: Scope,
    tokens: HashSet<String>,
}

/// 关键词索引：得分 = 查询词被段落覆盖的比例
#[derive(Debug, Default)]
pub struct KeywordIndex {
    chunker: Chunker,
    entries: RwLock<Vec<KeywordEntry>>,
}

impl KeywordIndex {
    pub fn new(chunker: Chunker) -> Self {
        Self {
            chunker,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// 分块后加入索引，返回块数
    pub async fn add_document(&self, scope: Scope, source: &str, text: &str) -> usize {
        let chunks = self.chunker.chunk(text);
        let count = chunks.len();
        let mut entries = self.entries.write().await;
        for chunk in chunks {
            entries.push(KeywordEntry {
                tokens: tokenize_to_set(&chunk),
                text: chunk,
                source: source.to_string(),
                scope: scope.clone(),
            });
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SimilarityIndex for KeywordIndex {
    async fn search(&self, query: &str, scope: &Scope, k: usize) -> Result<Vec<Passage>, RetrievalError> {
        let query_tokens = tokenize_to_set(query);
        if query_tokens.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let entries = self.entries.read().await;
        let passages = entries
            .iter()
            .filter(|e| &e.scope == scope)
            .filter_map(|e| {
                let score = overlap_score(&query_tokens, &e.tokens) as f32 / query_tokens.len() as f32;
                (score > 0.0).then(|| Passage {
                    text: e.text.clone(),
                    source: e.source.clone(),
                    scope: e.scope.clone(),
                    score,
                })
            })
            .collect();
        Ok(top_k(passages, k))
    }

    fn name(&self) -> &str {
        "keyword"
    }
}

/// 余弦相似度；维度不一致或零向量时为 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

struct VectorEntry {
    passage: Passage,
    embedding: Vec<f32>,
}

/// 向量索引：OpenAI 兼容嵌入 + 余弦相似度
pub struct EmbeddingIndex {
    chunker: Chunker,
    embedder: Arc<dyn EmbeddingProvider>,
    entries: RwLock<Vec<VectorEntry>>,
}

impl EmbeddingIndex {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, chunker: Chunker) -> Self {
        Self {
            chunker,
            embedder,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// 分块后一次批量嵌入并加入索引，返回块数
    pub async fn add_document(&self, scope: Scope, source: &str, text: &str) -> Result<usize, RetrievalError> {
        let chunks = self.chunker.chunk(text);
        if chunks.is_empty() {
            return Ok(0);
        }
        let embeddings = self.embedder.embed_batch(&chunks).await?;
        if embeddings.iter().any(|e| e.is_empty()) {
            return Err(RetrievalError::Unavailable(format!("empty embedding for {}", source)));
        }

        let added: Vec<VectorEntry> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| VectorEntry {
                passage: Passage {
                    text: chunk,
                    source: source.to_string(),
                    scope: scope.clone(),
                    score: 0.0,
                },
                embedding,
            })
            .collect();
        let count = added.len();
        self.entries.write().await.extend(added);
        Ok(count)
    }
}

#[async_trait]
impl SimilarityIndex for EmbeddingIndex {
    async fn search(&self, query: &str, scope: &Scope, k: usize) -> Result<Vec<Passage>, RetrievalError> {
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed(query).await?;

        let entries = self.entries.read().await;
        let passages = entries
            .iter()
            .filter(|e| &e.passage.scope == scope)
            .map(|e| Passage {
                score: cosine_similarity(&query_embedding, &e.embedding),
                ..e.passage.clone()
            })
            .collect();
        Ok(top_k(passages, k))
    }

    fn name(&self) -> &str {
        "embedding"
    }
}
