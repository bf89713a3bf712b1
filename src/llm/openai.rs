//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::CompletionError;
use crate::llm::{CompletionOptions, CompletionService, Prompt};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// 根据错误信息区分瞬时错误（限流、超时、网关错误）与致命错误
pub fn classify_error(message: String) -> CompletionError {
    let lower = message.to_lowercase();
    let transient = ["rate limit", "timeout", "timed out", "429", "502", "503", "504", "connection", "overloaded"]
        .iter()
        .any(|needle| lower.contains(needle));
    if transient {
        CompletionError::Transient(message)
    } else {
        CompletionError::Fatal(message)
    }
}

/// 未配置 key 时使用的占位值（请求会以鉴权错误失败）
pub(crate) const PLACEHOLDER_KEY: &str = "sk-placeholder";

/// 显式 key 优先，其次 `OPENAI_API_KEY`；空串与占位值视为未配置
pub(crate) fn resolve_api_key(explicit: Option<&str>) -> Option<String> {
    explicit
        .map(String::from)
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .filter(|k| !k.trim().is_empty() && k != PLACEHOLDER_KEY)
}

pub(crate) fn build_client(base_url: Option<&str>, api_key: String) -> Client<OpenAIConfig> {
    let mut config = OpenAIConfig::new().with_api_key(api_key);
    if let Some(url) = base_url {
        config = config.with_api_base(url);
    }
    Client::with_config(config)
}

/// OpenAI 兼容客户端：持有 Client 与 model 名，complete 时把 Prompt 转为 system + user 两条消息并取首条 content
pub struct OpenAiCompletion {
    client: Client<OpenAIConfig>,
    model: String,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiCompletion {
    /// api_key 为 None 时读取 `OPENAI_API_KEY`
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let key = resolve_api_key(api_key).unwrap_or_else(|| PLACEHOLDER_KEY.to_string());
        Self {
            client: build_client(base_url, key),
            model: model.to_string(),
            usage: TokenUsage::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn to_openai_messages(&self, prompt: &Prompt) -> Result<Vec<ChatCompletionRequestMessage>, CompletionError> {
        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(prompt.system.clone())
            .build()
            .map_err(|e| CompletionError::Fatal(e.to_string()))?;
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt.user.clone())
            .build()
            .map_err(|e| CompletionError::Fatal(e.to_string()))?;
        Ok(vec![
            ChatCompletionRequestMessage::System(system),
            ChatCompletionRequestMessage::User(user),
        ])
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    async fn complete(&self, prompt: &Prompt, options: &CompletionOptions) -> Result<String, CompletionError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(self.to_openai_messages(prompt)?)
            .temperature(options.temperature);
        if let Some(max_tokens) = options.max_tokens {
            args.max_completion_tokens(max_tokens);
        }
        let request = args
            .build()
            .map_err(|e| CompletionError::Fatal(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| classify_error(e.to_string()))?;

        // 提取 token 使用统计
        if let Some(usage) = &response.usage {
            self.usage.add(
                usage.prompt_tokens as u64,
                usage.completion_tokens as u64,
            );
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(CompletionError::Transient("empty completion".to_string()));
        }
        Ok(content)
    }

    fn name(&self) -> &str {
        "openai"
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_error() {
        assert!(classify_error("HTTP 429 Too Many Requests".into()).is_transient());
        assert!(classify_error("operation timed out".into()).is_transient());
        assert!(!classify_error("invalid api key".into()).is_transient());
    }

    #[test]
    fn test_resolve_api_key_rejects_placeholder() {
        assert_eq!(resolve_api_key(Some("sk-real")).as_deref(), Some("sk-real"));
        assert_eq!(resolve_api_key(Some(PLACEHOLDER_KEY)), None);
        assert_eq!(resolve_api_key(Some("  ")), None);
    }

    #[test]
    fn test_token_usage_accumulates() {
        let usage = TokenUsage::new();
        usage.add(10, 5);
        usage.add(1, 1);
        assert_eq!(usage.get(), (11, 6, 17));
    }
}
