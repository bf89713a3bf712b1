//! 触发器：角色数据中声明的关键词规则，命中后把效果描述交给游戏层执行
//!
//! 匹配是纯函数，不执行任何效果；效果以带标签的枚举返回，由调用方解释（如修改游戏状态、揭示秘密）。
//! 关键词达到阈值的触发器还要通过自身的前置条件（玩家 / 角色数据），不满足时记为拒绝。

pub mod condition;
pub mod matcher;

use serde::{Deserialize, Serialize};

pub use condition::{ConditionOp, TriggerCondition};
pub use matcher::{match_triggers, OverlapScorer, TriggerEvaluation, TriggerScorer};

/// 触发方向：作用于玩家输入还是角色输出
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

/// 触发效果（不透明描述，由游戏层解释）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerEffect {
    /// 叙事事件
    Narrative { event: String },
    /// 游戏状态变更
    GameState { key: String, value: serde_json::Value },
    /// 允许角色透露某个秘密
    RevealSecret { secret_id: String },
    /// 角色情绪变化
    Emotion { emotion: String },
    Custom { payload: serde_json::Value },
}

/// 触发器定义（静态，从角色 JSON 加载后不再修改）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub id: String,
    pub direction: Direction,
    pub match_terms: Vec<String>,
    /// 置信度阈值，取值 [0, 1]
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// 前置条件，全部成立才触发
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<TriggerCondition>,
    pub effect: TriggerEffect,
}

fn default_threshold() -> f32 {
    0.5
}

/// 一次命中（每轮临时产生）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerMatch {
    pub trigger_id: String,
    pub confidence: f32,
    pub direction: Direction,
    pub effect: TriggerEffect,
}

/// 关键词达到阈值但前置条件不成立的触发器
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefusedTrigger {
    pub trigger_id: String,
    pub confidence: f32,
    pub direction: Direction,
    pub reason: String,
}
