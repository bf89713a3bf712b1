//! 会话记忆数据模型：Turn / Summary / MemoryState
//!
//! 最近 N 条消息保留在 `recent_turns` 窗口内；滑出窗口的消息进入 `backlog` 等待摘要，
//! 只有在某条 Summary 成功覆盖后才会被丢弃。

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Character,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Character => "character",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "character" => Some(Role::Character),
            _ => None,
        }
    }
}

/// 单条消息，追加后不可变；`seq` 为会话内从 0 开始的原始消息序号，由记忆存储在追加时分配
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub seq: u64,
}

impl Turn {
    pub fn user(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Role::User, session_id, text)
    }

    pub fn character(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Role::Character, session_id, text)
    }

    fn new(role: Role, session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
            session_id: session_id.into(),
            seq: 0,
        }
    }
}

/// 压缩产生的摘要，只会被后续摘要取代，不会被修改
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub session_id: String,
    /// 覆盖的原始消息序号区间（闭区间）
    pub covers_turns: (u64, u64),
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// 压缩时的交换轮数（total_turn_count）
    pub exchange_count: u64,
}

/// 单个会话的记忆状态，由 SessionHandle 独占，只在会话锁内被记忆存储修改
#[derive(Clone, Debug)]
pub struct MemoryState {
    session_id: String,
    character_id: String,
    player_id: String,
    pub(crate) recent_turns: VecDeque<Turn>,
    pub(crate) backlog: Vec<Turn>,
    pub(crate) summaries: Vec<Summary>,
    /// 已完成的交换轮数（一条用户消息 + 一条角色回复 = 1），单调不减
    pub(crate) total_turn_count: u64,
    pub(crate) next_seq: u64,
    pub(crate) exchanges_at_last_summary: u64,
    /// 最近一次压缩被推迟时的交换轮数；同一轮内不再重试
    pub(crate) deferred_at_exchange: Option<u64>,
    pub(crate) closed: bool,
}

impl MemoryState {
    pub fn new(
        session_id: impl Into<String>,
        character_id: impl Into<String>,
        player_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            character_id: character_id.into(),
            player_id: player_id.into(),
            recent_turns: VecDeque::new(),
            backlog: Vec::new(),
            summaries: Vec::new(),
            total_turn_count: 0,
            next_seq: 0,
            exchanges_at_last_summary: 0,
            deferred_at_exchange: None,
            closed: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn character_id(&self) -> &str {
        &self.character_id
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    pub fn recent_turns(&self) -> impl Iterator<Item = &Turn> {
        self.recent_turns.iter()
    }

    pub fn recent_len(&self) -> usize {
        self.recent_turns.len()
    }

    /// 已滑出窗口、等待摘要的消息
    pub fn backlog(&self) -> &[Turn] {
        &self.backlog
    }

    pub fn summaries(&self) -> &[Summary] {
        &self.summaries
    }

    pub fn total_turn_count(&self) -> u64 {
        self.total_turn_count
    }

    pub fn exchanges_since_summary(&self) -> u64 {
        self.total_turn_count
            .saturating_sub(self.exchanges_at_last_summary)
    }

    /// 会话已被驱逐：之后的 append 一律返回 InvalidSession
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    /// 将超出窗口的最旧消息移入 backlog，保证 recent_turns ≤ window
    pub(crate) fn spill_over(&mut self, window: usize) {
        while self.recent_turns.len() > window {
            if let Some(oldest) = self.recent_turns.pop_front() {
                self.backlog.push(oldest);
            }
        }
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_turn_count: self.total_turn_count,
            recent_turns: self.recent_turns.len(),
            pending_turns: self.backlog.len(),
            summaries: self.summaries.len(),
        }
    }
}

/// 记忆统计，随每轮结果返回
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub total_turn_count: u64,
    pub recent_turns: usize,
    pub pending_turns: usize,
    pub summaries: usize,
}

/// read_context 的结果：最近的摘要（新→旧）+ 窗口内消息（按时间顺序）
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MemoryContext {
    pub summaries: Vec<Summary>,
    pub turns: Vec<Turn>,
}

impl MemoryContext {
    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty() && self.turns.is_empty()
    }

    /// 渲染为提示词片段
    pub fn render_summaries(&self) -> String {
        self.summaries
            .iter()
            .map(|s| format!("- {}", s.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn render_turns(&self, character_name: &str) -> String {
        self.turns
            .iter()
            .map(|t| match t.role {
                Role::User => format!("Joueur: {}", t.text),
                Role::Character => format!("{}: {}", character_name, t.text),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
