//! 单轮状态：阶段、逐阶段计时与诊断信息、对外结果
//!
//! 每轮恰好到达一次终止阶段（Done 或 Failed）；诊断信息在失败时随错误一起返回。

use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::core::action::ActionParsed;
use crate::knowledge::Passage;
use crate::llm::{Complexity, Intent};
use crate::memory::{CompactionStatus, MemoryStats};
use crate::triggers::{RefusedTrigger, TriggerMatch};

/// 编排阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnPhase {
    LoadMemory,
    MatchInputTriggers,
    Classify,
    Retrieve,
    SkipRetrieval,
    BuildContext,
    Generate,
    MatchOutputTriggers,
    UpdateMemory,
    Done,
    Failed,
}

impl TurnPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnPhase::Done | TurnPhase::Failed)
    }
}

/// 单个阶段耗时
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PhaseTiming {
    pub phase: TurnPhase,
    pub elapsed_ms: f64,
}

/// 检索阶段报告
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RetrievalReport {
    pub world_hits: usize,
    pub character_hits: usize,
    /// 降级原因（索引不可用 / 超时）
    pub errors: Vec<String>,
}

/// 单轮诊断信息
#[derive(Clone, Debug, Default, Serialize)]
pub struct TurnDiagnostics {
    pub session_id: String,
    pub character_id: String,
    pub session_created: bool,
    pub phases: Vec<PhaseTiming>,
    pub terminal: Option<TurnPhase>,
    pub total_ms: f64,
    pub intent: Option<Intent>,
    pub classification: Option<Complexity>,
    pub retrieval: Option<RetrievalReport>,
    pub passages: Vec<Passage>,
    pub prompt_tokens_estimate: usize,
    pub user_actions: Vec<String>,
    /// 关键词命中但前置条件不成立的触发器（输入在前）
    pub refused_triggers: Vec<RefusedTrigger>,
    pub response_actions: Vec<String>,
    pub termination_cue: Option<String>,
    pub compactions: Vec<CompactionStatus>,
    pub evicted: bool,
}

/// 成功一轮的结果
#[derive(Clone, Debug, Serialize)]
pub struct TurnOutcome {
    pub session_id: String,
    pub response: String,
    /// 去掉 *动作* 后的回复与动作列表
    pub response_parsed: ActionParsed,
    pub input_triggers: Vec<TriggerMatch>,
    pub output_triggers: Vec<TriggerMatch>,
    pub memory_stats: MemoryStats,
    pub diagnostics: TurnDiagnostics,
}

impl TurnOutcome {
    /// 输入与输出两侧全部命中的触发器
    pub fn fired_triggers(&self) -> impl Iterator<Item = &TriggerMatch> {
        self.input_triggers.iter().chain(self.output_triggers.iter())
    }
}

/// 阶段跟踪器：进入新阶段时结算上一阶段耗时
#[derive(Debug)]
pub struct PhaseTracker {
    started: Instant,
    current: Option<(TurnPhase, Instant)>,
    pub diagnostics: TurnDiagnostics,
}

impl PhaseTracker {
    pub fn new(session_id: &str, character_id: &str) -> Self {
        Self {
            started: Instant::now(),
            current: None,
            diagnostics: TurnDiagnostics {
                session_id: session_id.to_string(),
                character_id: character_id.to_string(),
                ..Default::default()
            },
        }
    }

    fn close_current(&mut self) {
        if let Some((phase, since)) = self.current.take() {
            self.diagnostics.phases.push(PhaseTiming {
                phase,
                elapsed_ms: since.elapsed().as_secs_f64() * 1000.0,
            });
        }
    }

    pub fn enter(&mut self, phase: TurnPhase) {
        self.close_current();
        debug!(session_id = %self.diagnostics.session_id, ?phase, "turn phase");
        self.current = Some((phase, Instant::now()));
    }

    pub fn current(&self) -> Option<TurnPhase> {
        self.current.map(|(phase, _)| phase)
    }

    /// 进入终止阶段并交出诊断信息；消费 self 保证只结束一次
    pub fn finish(mut self, terminal: TurnPhase) -> TurnDiagnostics {
        self.close_current();
        self.diagnostics.terminal = Some(terminal);
        self.diagnostics.total_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_records_phases_in_order() {
        let mut tracker = PhaseTracker::new("s1", "elara");
        tracker.enter(TurnPhase::LoadMemory);
        tracker.enter(TurnPhase::Classify);
        assert_eq!(tracker.current(), Some(TurnPhase::Classify));

        let diag = tracker.finish(TurnPhase::Done);
        let phases: Vec<_> = diag.phases.iter().map(|p| p.phase).collect();
        assert_eq!(phases, vec![TurnPhase::LoadMemory, TurnPhase::Classify]);
        assert_eq!(diag.terminal, Some(TurnPhase::Done));
        assert!(TurnPhase::Failed.is_terminal());
        assert!(!TurnPhase::Generate.is_terminal());
    }

    #[test]
    fn test_phase_serializes_screaming_case() {
        let json = serde_json::to_string(&TurnPhase::MatchInputTriggers).unwrap();
        assert_eq!(json, "\"MATCH_INPUT_TRIGGERS\"");
    }
}
