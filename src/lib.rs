//! Bard - 持久化角色对话引擎
//!
//! 模块划分：
//! - **character**: 角色设定、秘密透露策略、角色目录与世界观文档
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 单轮编排状态机、会话注册表、上下文组装、错误类型
//! - **knowledge**: 世界 / 角色知识索引与检索
//! - **llm**: 补全服务抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、复杂度分类
//! - **memory**: 会话记忆（窗口 + 滚动摘要）与持久化
//! - **observability**: tracing 初始化
//! - **triggers**: 输入 / 输出触发器定义与匹配

pub mod character;
pub mod config;
pub mod core;
pub mod knowledge;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod triggers;

pub use crate::core::{create_orchestrator, Orchestrator, PlayerData, TurnError, TurnOutcome};
