//! 角色数据：身份、性格、说话风格、触发器、秘密与专属知识
//!
//! 加载后以 `Arc<CharacterContext>` 在所有会话间共享，进程生命周期内只读。

pub mod catalog;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::CharacterError;
use crate::triggers::{Direction, TriggerDefinition, TriggerEffect, TriggerMatch};

pub use catalog::{load_world_documents, CharacterCatalog, CharacterSource};

/// 秘密的透露策略
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RevealPolicy {
    #[default]
    Never,
    Always,
    /// 指定触发器命中（或触发器效果点名此秘密）时才可透露
    OnTrigger { trigger_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub reveal: RevealPolicy,
}

/// 角色上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterContext {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub speech_style: String,
    /// 性格特征 → 强度 [0, 1]
    #[serde(default)]
    pub personality: BTreeMap<String, f32>,
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
    #[serde(default)]
    pub secrets: Vec<Secret>,
    /// 角色专属知识（进入 Character 检索范围）
    #[serde(default)]
    pub knowledge: Vec<String>,
}

impl CharacterContext {
    /// 基本校验：id / name 非空，触发器阈值在 [0, 1]，触发器 id 唯一，条件路径以 player. / character. 开头
    pub fn validate(&self) -> Result<(), CharacterError> {
        let invalid = |reason: String| CharacterError::Invalid {
            id: self.id.clone(),
            reason,
        };
        if self.id.trim().is_empty() || self.name.trim().is_empty() {
            return Err(invalid("id and name must not be empty".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for trigger in &self.triggers {
            if !(0.0..=1.0).contains(&trigger.threshold) {
                return Err(invalid(format!(
                    "trigger {} threshold {} outside [0, 1]",
                    trigger.id, trigger.threshold
                )));
            }
            if !seen.insert(trigger.id.as_str()) {
                return Err(invalid(format!("duplicate trigger id {}", trigger.id)));
            }
            if let Some(cond) = trigger
                .conditions
                .iter()
                .find(|c| !(c.key.starts_with("player.") || c.key.starts_with("character.")))
            {
                return Err(invalid(format!(
                    "trigger {} condition key {} must start with player. or character.",
                    trigger.id, cond.key
                )));
            }
        }
        Ok(())
    }

    pub fn triggers_for(&self, direction: Direction) -> impl Iterator<Item = &TriggerDefinition> {
        self.triggers.iter().filter(move |t| t.direction == direction)
    }

    /// 把数值特征转成描述：> 0.7 为「élevé」，< 0.3 为「faible」，其余不提
    pub fn personality_summary(&self) -> String {
        if self.personality.is_empty() {
            return "Personnalité standard".to_string();
        }
        let traits: Vec<String> = self
            .personality
            .iter()
            .filter_map(|(name, value)| {
                if *value > 0.7 {
                    Some(format!("{} élevé", name))
                } else if *value < 0.3 {
                    Some(format!("{} faible", name))
                } else {
                    None
                }
            })
            .collect();
        if traits.is_empty() {
            "Équilibré".to_string()
        } else {
            traits.join(", ")
        }
    }

    /// 本轮可透露的秘密（按声明顺序）
    pub fn revealable_secrets(&self, fired: &[TriggerMatch]) -> Vec<&Secret> {
        self.secrets
            .iter()
            .filter(|secret| match &secret.reveal {
                RevealPolicy::Never => false,
                RevealPolicy::Always => true,
                RevealPolicy::OnTrigger { trigger_id } => fired.iter().any(|m| {
                    &m.trigger_id == trigger_id
                        || matches!(&m.effect, TriggerEffect::RevealSecret { secret_id } if secret_id == &secret.id)
                }),
            })
            .collect()
    }
}
