//! 核心编排层：错误类型、单轮状态与诊断、上下文组装、会话注册表、对话编排器

pub mod action;
pub mod error;
pub mod orchestrator;
pub mod prompt;
pub mod registry;
pub mod state;

pub use action::{format_actions, parse_actions, ActionParsed};
pub use error::{CharacterError, CompletionError, MemoryError, PersistenceError, RetrievalError, TurnError};
pub use orchestrator::{
    create_classifier_from_config, create_completion_from_config, create_orchestrator,
    create_persistence_from_config, ConversationHistory, Orchestrator, PlayerData, TurnSettings,
};
pub use prompt::{ContextBuilder, ContextInputs};
pub use registry::{new_session_id, SessionHandle, SessionId, SessionRegistry};
pub use state::{PhaseTiming, PhaseTracker, RetrievalReport, TurnDiagnostics, TurnOutcome, TurnPhase};
