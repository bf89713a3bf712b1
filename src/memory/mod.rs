//! 记忆层：会话消息与摘要、记忆存储（追加 / 压缩 / 读取）、持久化、分词与 token 预算

pub mod async_persistence;
pub mod conversation;
pub mod persistence;
pub mod store;
pub mod token_budget;
pub mod tokenizer;

#[cfg(feature = "async-sqlite")]
pub use async_persistence::SqlitePersistence;
pub use conversation::{MemoryContext, MemoryState, MemoryStats, Role, Summary, Turn};
pub use persistence::{InMemoryPersistence, JsonFilePersistence, MemoryPersistence, SessionRecord};
pub use store::{AppendOutcome, CompactionStatus, MemoryStore, MemoryStoreConfig};
pub use token_budget::{PromptSegment, TokenBudget, TokenEstimator};
pub use tokenizer::{contains_cjk, tokenize, tokenize_to_set};
