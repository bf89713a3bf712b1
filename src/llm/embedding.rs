//! 文本嵌入：向量检索索引通过 EmbeddingProvider 把段落与查询编码为向量

use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;
use tracing::debug;

use crate::core::RetrievalError;
use crate::llm::openai::{build_client, resolve_api_key};

/// 嵌入提供方
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 批量编码，返回顺序与输入一致
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| RetrievalError::Unavailable("no embedding returned".to_string()))
    }
}

/// OpenAI 兼容 /embeddings 端点
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(base_url: Option<&str>, model: &str, api_key: String) -> Self {
        Self {
            client: build_client(base_url, api_key),
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let unavailable = |e: String| RetrievalError::Unavailable(format!("embedding {}: {}", self.model, e));

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::StringArray(texts.to_vec()))
            .build()
            .map_err(|e| unavailable(e.to_string()))?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let mut data = response.data;
        if data.len() != texts.len() {
            return Err(unavailable(format!("expected {} vectors, got {}", texts.len(), data.len())));
        }
        data.sort_by_key(|e| e.index);
        Ok(data.into_iter().map(|e| e.embedding).collect())
    }
}

/// 有可用 API key 时创建嵌入提供方，否则返回 None（调用方回退到关键词检索）
pub fn create_embedder_from_config(
    base_url: Option<&str>,
    model: &str,
    api_key: Option<&str>,
) -> Option<Arc<dyn EmbeddingProvider>> {
    let Some(key) = resolve_api_key(api_key) else {
        debug!(model, "no API key for embeddings");
        return None;
    };
    Some(Arc::new(OpenAiEmbedder::new(base_url, model, key)))
}
