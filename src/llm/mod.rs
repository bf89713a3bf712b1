//! LLM 层：补全服务抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、嵌入、复杂度分类

pub mod classifier;
pub mod deepseek;
pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

pub use classifier::{
    detect_intent, Complexity, ComplexityClassifier, HeuristicClassifier, Intent, ModelClassifier,
};
pub use deepseek::{create_deepseek_completion, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use embedding::{create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use mock::MockCompletion;
pub use openai::{OpenAiCompletion, TokenUsage};
pub use traits::{summary_prompt, CompletionOptions, CompletionService, Prompt};
