//! 补全服务抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 CompletionService：complete（生成角色回复）、
//! summarize（记忆压缩）。两者都可能返回可区分的瞬时 / 致命错误。

use async_trait::async_trait;
use serde::Serialize;

use crate::core::CompletionError;
use crate::memory::{Role, Turn};

/// 一次生成调用的完整输入
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Prompt {
    /// 角色名（用于日志与 Mock 回复）
    pub character: String,
    /// 系统提示：角色设定、记忆、检索段落、触发器
    pub system: String,
    /// 玩家原始消息
    pub user: String,
}

impl Prompt {
    /// 渲染为单段文本（用于日志、诊断与不区分角色的后端）
    pub fn render(&self) -> String {
        format!("{}\n\nJoueur: {}\n{}:", self.system, self.user, self.character)
    }
}

/// 生成参数
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

/// 将一组消息整理为摘要请求
pub fn summary_prompt(turns: &[Turn]) -> Prompt {
    let transcript = turns
        .iter()
        .map(|t| match t.role {
            Role::User => format!("Joueur: {}", t.text),
            Role::Character => format!("Personnage: {}", t.text),
        })
        .collect::<Vec<_>>()
        .join("\n");

    Prompt {
        character: "Résumé".to_string(),
        system: "Résume la conversation suivante en quelques phrases. Conserve les faits importants, \
                 les promesses, les informations révélées et l'état émotionnel des personnages."
            .to_string(),
        user: transcript,
    }
}

/// 补全服务 trait
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// 生成一次回复；调用方保证每轮只调用一次
    async fn complete(&self, prompt: &Prompt, options: &CompletionOptions) -> Result<String, CompletionError>;

    /// 将若干消息压缩为一段摘要，默认复用 complete
    async fn summarize(&self, turns: &[Turn]) -> Result<String, CompletionError> {
        let options = CompletionOptions {
            temperature: 0.3,
            max_tokens: Some(300),
        };
        self.complete(&summary_prompt(turns), &options).await
    }

    fn name(&self) -> &str {
        "completion"
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_prompt_transcript() {
        let turns = vec![Turn::user("s", "Bonjour"), Turn::character("s", "Salut, voyageur")];
        let prompt = summary_prompt(&turns);
        assert_eq!(prompt.user, "Joueur: Bonjour\nPersonnage: Salut, voyageur");
    }

    #[test]
    fn test_prompt_render_ends_with_character_cue() {
        let prompt = Prompt {
            character: "Elara".into(),
            system: "Tu es Elara.".into(),
            user: "Bonjour".into(),
        };
        assert!(prompt.render().ends_with("Joueur: Bonjour\nElara:"));
    }
}
