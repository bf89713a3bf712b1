//! DeepSeek 预设：OpenAI 兼容端点 https://api.deepseek.com，默认模型 deepseek-chat

use crate::llm::openai::{resolve_api_key, PLACEHOLDER_KEY};
use crate::llm::OpenAiCompletion;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 创建 DeepSeek 补全服务
///
/// key 取 `DEEPSEEK_API_KEY`，没有则回退 `OPENAI_API_KEY`；模型依次取参数、`DEEPSEEK_MODEL`、`deepseek-chat`
pub fn create_deepseek_completion(model: Option<&str>) -> OpenAiCompletion {
    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();
    let key = resolve_api_key(deepseek_key.as_deref()).unwrap_or_else(|| PLACEHOLDER_KEY.to_string());

    let model = model
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
        .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());

    OpenAiCompletion::new(Some(DEEPSEEK_BASE_URL), &model, Some(&key))
}
