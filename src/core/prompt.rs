//! 生成上下文组装
//!
//! 由角色设定、记忆（read_context）、检索段落、已触发的输入触发器与玩家消息拼出一次生成的 Prompt。
//! 组装是纯函数：相同输入得到逐字节相同的输出。

use crate::character::{CharacterContext, Secret};
use crate::knowledge::{Passage, Scope};
use crate::llm::Prompt;
use crate::memory::{MemoryContext, PromptSegment, TokenBudget, TokenEstimator};
use crate::triggers::{TriggerEffect, TriggerMatch};

/// 组装一次生成所需的全部输入
pub struct ContextInputs<'a> {
    pub character: &'a CharacterContext,
    pub memory: &'a MemoryContext,
    pub passages: &'a [Passage],
    pub input_triggers: &'a [TriggerMatch],
    pub secrets: &'a [&'a Secret],
    /// 玩家显示名（未知时省略）
    pub player_name: Option<&'a str>,
    pub user_message: &'a str,
}

/// 上下文构建器
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    budget: TokenBudget,
}

impl ContextBuilder {
    pub fn new(token_budget: usize) -> Self {
        Self {
            budget: TokenBudget::new(token_budget),
        }
    }

    pub fn with_budget(mut self, budget: TokenBudget) -> Self {
        self.budget = budget;
        self
    }

    fn identity_section(character: &CharacterContext, player_name: Option<&str>) -> String {
        let mut out = format!("Tu es {}.", character.name);
        if !character.description.is_empty() {
            out.push('\n');
            out.push_str(&character.description);
        }
        out.push_str(&format!("\nPERSONNALITÉ: {}", character.personality_summary()));
        if !character.speech_style.is_empty() {
            out.push_str(&format!("\nSTYLE: {}", character.speech_style));
        }
        if let Some(player) = player_name.filter(|p| !p.is_empty()) {
            out.push_str(&format!("\nTu parles avec {}.", player));
        }
        out
    }

    fn secrets_section(secrets: &[&Secret]) -> String {
        if secrets.is_empty() {
            return String::new();
        }
        let items: Vec<String> = secrets.iter().map(|s| format!("- {}", s.content)).collect();
        format!("CE QUE TU PEUX RÉVÉLER:\n{}", items.join("\n"))
    }

    fn knowledge_section(passages: &[Passage]) -> String {
        if passages.is_empty() {
            return String::new();
        }
        let items: Vec<String> = passages
            .iter()
            .map(|p| {
                let origin = match &p.scope {
                    Scope::World => "monde",
                    Scope::Character(_) => "personnel",
                };
                format!("- [{}] {} (pertinence: {:.2})", origin, p.text, p.score)
            })
            .collect();
        format!("CONNAISSANCES PERTINENTES:\n{}", items.join("\n"))
    }

    fn summaries_section(memory: &MemoryContext) -> String {
        if memory.summaries.is_empty() {
            return String::new();
        }
        format!("RÉSUMÉ DES ÉCHANGES PRÉCÉDENTS:\n{}", memory.render_summaries())
    }

    fn history_section(memory: &MemoryContext, character_name: &str) -> String {
        if memory.turns.is_empty() {
            return String::new();
        }
        format!("HISTORIQUE RÉCENT:\n{}", memory.render_turns(character_name))
    }

    fn triggers_section(triggers: &[TriggerMatch]) -> String {
        let items: Vec<String> = triggers
            .iter()
            .filter_map(|t| match &t.effect {
                TriggerEffect::Narrative { event } => Some(format!("- Événement: {}", event)),
                TriggerEffect::Emotion { emotion } => Some(format!("- Ton émotion change: {}", emotion)),
                TriggerEffect::RevealSecret { secret_id } => Some(format!("- Tu peux évoquer: {}", secret_id)),
                TriggerEffect::GameState { .. } | TriggerEffect::Custom { .. } => None,
            })
            .collect();
        if items.is_empty() {
            return String::new();
        }
        format!("CE QUI SE PASSE:\n{}", items.join("\n"))
    }

    fn instructions_section(character_name: &str) -> String {
        format!(
            "INSTRUCTIONS:\n\
             1. Reste parfaitement en personnage comme {name}.\n\
             2. Utilise ta personnalité et ton style de parole.\n\
             3. Intègre naturellement les connaissances pertinentes, sans les réciter.\n\
             4. Tiens compte de l'historique pour rester cohérent.\n\
             5. Ne révèle jamais un secret qui n'est pas listé ci-dessus.\n\
             6. Réponds en 2-3 phrases; mets les actions physiques entre *astérisques*.",
            name = character_name
        )
    }

    /// 组装 Prompt，并返回系统提示的 token 估算
    pub fn build(&self, inputs: &ContextInputs<'_>) -> (Prompt, usize) {
        let name = inputs.character.name.as_str();
        let segments = vec![
            (PromptSegment::Identity, Self::identity_section(inputs.character, inputs.player_name)),
            (PromptSegment::Secrets, Self::secrets_section(inputs.secrets)),
            (PromptSegment::Knowledge, Self::knowledge_section(inputs.passages)),
            (PromptSegment::Summaries, Self::summaries_section(inputs.memory)),
            (PromptSegment::History, Self::history_section(inputs.memory, name)),
            (PromptSegment::Triggers, Self::triggers_section(inputs.input_triggers)),
            (PromptSegment::Instructions, Self::instructions_section(name)),
        ];

        let system = self
            .budget
            .allocate(&segments)
            .into_iter()
            .map(|(_, content)| content)
            .collect::<Vec<_>>()
            .join("\n\n");
        let tokens = TokenEstimator::estimate(&system);

        (
            Prompt {
                character: name.to_string(),
                system,
                user: inputs.user_message.to_string(),
            },
            tokens,
        )
    }
}
