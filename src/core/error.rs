//! 错误类型
//!
//! 各组件各自一个 thiserror 枚举；编排器对外只暴露 [`TurnError`]，并附带稳定的 `kind()` 字符串，
//! 供 UI / 游戏层按类型分支处理。

use thiserror::Error;

use crate::core::state::TurnDiagnostics;

/// 补全服务错误：调用方可区分瞬时（限流、超时）与致命（鉴权、参数错误）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    #[error("transient completion failure: {0}")]
    Transient(String),

    #[error("fatal completion failure: {0}")]
    Fatal(String),
}

impl CompletionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CompletionError::Transient(_))
    }
}

/// 知识检索错误：索引不可达或超时，编排器将其降级为空检索结果
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetrievalError {
    #[error("retrieval unavailable: {0}")]
    Unavailable(String),
}

/// 持久化层错误（IO / 序列化 / 数据库）
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(String),
}

/// 记忆存储错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// 会话未知或已被驱逐：属于会话生命周期管理的集成错误
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// 摘要失败或超时：原始消息保留，下次满足条件时重试
    #[error("summarization deferred: {0}")]
    SummarizationDeferred(String),
}

/// 角色数据加载错误
#[derive(Error, Debug)]
pub enum CharacterError {
    #[error("unknown character: {0}")]
    NotFound(String),

    #[error("failed to read character data {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid character data {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid character {id}: {reason}")]
    Invalid { id: String, reason: String },
}

/// 单轮对话的对外错误
///
/// 只有 `SessionCreation` 与 `Generation` 会中止一轮对话；两者都不会修改记忆，会话在下一条消息时仍可用。
#[derive(Error, Debug)]
pub enum TurnError {
    #[error("session creation failed: {0}")]
    SessionCreation(String),

    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("generation failed: {message}")]
    Generation {
        message: String,
        /// 补全服务返回的原始错误；超时为 None
        #[source]
        cause: Option<CompletionError>,
        /// 失败前已收集的诊断信息
        diagnostics: Box<TurnDiagnostics>,
    },

    #[error("summarization deferred: {0}")]
    SummarizationDeferred(String),

    #[error("invalid session: {0}")]
    InvalidSession(String),
}

impl TurnError {
    /// 稳定的错误类别标识
    pub fn kind(&self) -> &'static str {
        match self {
            TurnError::SessionCreation(_) => "session_creation",
            TurnError::RetrievalUnavailable(_) => "retrieval_unavailable",
            TurnError::Generation { .. } => "generation",
            TurnError::SummarizationDeferred(_) => "summarization_deferred",
            TurnError::InvalidSession(_) => "invalid_session",
        }
    }

    /// 是否值得稍后重试：生成超时与补全服务的瞬时错误（限流、网络）为 true，鉴权等致命错误为 false
    pub fn is_transient(&self) -> bool {
        match self {
            TurnError::Generation { cause: Some(cause), .. } => cause.is_transient(),
            TurnError::Generation { cause: None, .. } => true,
            TurnError::RetrievalUnavailable(_) | TurnError::SummarizationDeferred(_) => true,
            TurnError::SessionCreation(_) | TurnError::InvalidSession(_) => false,
        }
    }

    /// 生成失败时补全服务的原始错误
    pub fn completion_error(&self) -> Option<&CompletionError> {
        match self {
            TurnError::Generation { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }

    /// 失败时的部分诊断（仅 Generation 携带）
    pub fn diagnostics(&self) -> Option<&TurnDiagnostics> {
        match self {
            TurnError::Generation { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

impl From<MemoryError> for TurnError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::InvalidSession(id) => TurnError::InvalidSession(id),
            MemoryError::SummarizationDeferred(reason) => TurnError::SummarizationDeferred(reason),
        }
    }
}

impl From<RetrievalError> for TurnError {
    fn from(err: RetrievalError) -> Self {
        match err {
            RetrievalError::Unavailable(reason) => TurnError::RetrievalUnavailable(reason),
        }
    }
}

impl From<CharacterError> for TurnError {
    fn from(err: CharacterError) -> Self {
        TurnError::SessionCreation(err.to_string())
    }
}
