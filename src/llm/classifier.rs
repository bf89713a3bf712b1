//! 复杂度分类：判断一条消息是否需要检索增强
//!
//! 误判为 NeedsKnowledge 只增加延迟；误判为 Simple 只少带一些背景，两者都不会改动会话状态。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::llm::{CompletionOptions, CompletionService, Prompt};
use crate::memory::tokenizer::{contains_phrase, normalize_phrase};
use crate::memory::MemoryContext;

/// 分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    NeedsKnowledge,
}

/// 玩家意图（按声明顺序匹配，先命中者胜出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    Farewell,
    Question,
    Request,
    Transaction,
    Emotional,
    GameAction,
    SmallTalk,
    General,
}

const INTENT_PATTERNS: &[(Intent, &[&str])] = &[
    (Intent::Greeting, &["bonjour", "salut", "hey", "hello", "bonsoir", "hi"]),
    (Intent::Farewell, &["au revoir", "bye", "goodbye", "à bientôt", "adieu"]),
    (
        Intent::Question,
        &["pourquoi", "comment", "quoi", "qui", "où", "quand", "why", "how", "what", "who", "where", "when"],
    ),
    (Intent::Request, &["peux tu", "pourrais tu", "donne moi", "montre moi", "can you", "could you"]),
    (Intent::Transaction, &["acheter", "vendre", "échanger", "troquer", "prix", "buy", "sell", "trade"]),
    (Intent::Emotional, &["triste", "heureux", "en colère", "content", "désolé", "sad", "happy", "sorry"]),
    (Intent::GameAction, &["prendre", "utiliser", "aller", "parler", "donner", "take", "use", "give"]),
    (Intent::SmallTalk, &["comment ça va", "quoi de neuf", "ça va", "météo"]),
];

/// 检测玩家意图；问号视为提问
pub fn detect_intent(text: &str) -> Intent {
    let normalized = normalize_phrase(text);
    for (intent, patterns) in INTENT_PATTERNS {
        if *intent == Intent::Question && text.contains('?') {
            return Intent::Question;
        }
        if patterns.iter().any(|p| contains_phrase(&normalized, p)) {
            return *intent;
        }
    }
    Intent::General
}

/// 复杂度分类 trait
#[async_trait]
pub trait ComplexityClassifier: Send + Sync {
    /// 对相同 (text, memory_context) 与固定配置必须给出相同结果
    async fn classify(&self, text: &str, memory_context: &MemoryContext) -> Complexity;

    fn name(&self) -> &str;
}

/// 关键词启发式分类器（默认）
#[derive(Debug, Clone)]
pub struct HeuristicClassifier {
    knowledge_keywords: Vec<String>,
    simple_keywords: Vec<String>,
    memory_keywords: Vec<String>,
}

impl Default for HeuristicClassifier {
    fn default() -> Self {
        let owned = |words: &[&str]| words.iter().map(|w| w.to_string()).collect::<Vec<_>>();
        Self {
            knowledge_keywords: owned(&[
                "histoire", "passé", "avant", "autrefois", "jadis",
                "secret", "mystère", "caché", "confidentiel",
                "relation", "ami", "ennemi", "famille",
                "événement", "incident", "accident", "guerre",
                "souvenir", "mémoire", "rappelle",
                "pourquoi", "comment", "raison", "cause",
                "qui est", "qu est ce que", "où se trouve",
                "origine", "création", "fondation",
                "tradition", "coutume", "rituel",
                "raconte", "explique",
                "history", "past", "secret", "legend", "why", "how", "explain", "tell me",
            ]),
            simple_keywords: owned(&[
                "bonjour", "salut", "hey", "hello",
                "au revoir", "bye", "à bientôt",
                "merci", "de rien", "ok", "d accord",
                "oui", "non", "peut être",
                "ça va", "comment ça va",
                "thanks", "yes", "no",
            ]),
            memory_keywords: owned(&[
                "tout à l heure", "tu m as dit", "on a parlé", "la dernière fois", "earlier", "remember",
                "souviens",
            ]),
        }
    }
}

impl HeuristicClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// (knowledge_score, simple_score)
    pub fn scores(&self, text: &str, memory_context: &MemoryContext) -> (i32, i32) {
        let normalized = normalize_phrase(text);
        let count = |keywords: &[String]| {
            keywords
                .iter()
                .filter(|k| contains_phrase(&normalized, k))
                .count() as i32
        };

        let mut knowledge = count(&self.knowledge_keywords);
        let mut simple = count(&self.simple_keywords);

        match detect_intent(text) {
            Intent::Question | Intent::Request => knowledge += 1,
            Intent::Greeting | Intent::Farewell | Intent::SmallTalk => simple += 2,
            _ => {}
        }

        let word_count = text.split_whitespace().count();
        if word_count > 10 {
            knowledge += 1;
        } else if word_count <= 3 {
            simple += 1;
        }

        // 玩家提到先前的对话，而更早的内容只剩摘要
        if !memory_context.summaries.is_empty() && count(&self.memory_keywords) > 0 {
            knowledge += 1;
        }

        (knowledge, simple)
    }

    pub fn classify_sync(&self, text: &str, memory_context: &MemoryContext) -> Complexity {
        let (knowledge, simple) = self.scores(text, memory_context);
        if knowledge > simple && knowledge > 0 {
            Complexity::NeedsKnowledge
        } else {
            Complexity::Simple
        }
    }
}

#[async_trait]
impl ComplexityClassifier for HeuristicClassifier {
    async fn classify(&self, text: &str, memory_context: &MemoryContext) -> Complexity {
        self.classify_sync(text, memory_context)
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

#[derive(Deserialize)]
struct Verdict {
    needs_knowledge: bool,
}

/// 模型分类器：让补全服务给出 JSON 判断，任何失败都回退到启发式
pub struct ModelClassifier {
    completion: Arc<dyn CompletionService>,
    fallback: HeuristicClassifier,
    timeout: Duration,
}

impl ModelClassifier {
    pub fn new(completion: Arc<dyn CompletionService>, timeout: Duration) -> Self {
        Self {
            completion,
            fallback: HeuristicClassifier::default(),
            timeout,
        }
    }

    fn prompt(text: &str, memory_context: &MemoryContext) -> Prompt {
        let mut system = String::from(
            "Tu détermines si un message de joueur nécessite une recherche dans la base de connaissances \
             (histoire du monde, passé du personnage, secrets, relations). \
             Réponds uniquement en JSON: {\"needs_knowledge\": true} ou {\"needs_knowledge\": false}.",
        );
        if !memory_context.summaries.is_empty() {
            system.push_str("\n\nRésumé de la conversation:\n");
            system.push_str(&memory_context.render_summaries());
        }
        Prompt {
            character: "Classifieur".to_string(),
            system,
            user: text.to_string(),
        }
    }

    /// 去掉 ```json 代码块包裹后解析
    fn parse_verdict(raw: &str) -> Option<bool> {
        let trimmed = raw.trim();
        let body = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .map(|s| s.trim_end().trim_end_matches("```"))
            .unwrap_or(trimmed)
            .trim();
        serde_json::from_str::<Verdict>(body).ok().map(|v| v.needs_knowledge)
    }
}

#[async_trait]
impl ComplexityClassifier for ModelClassifier {
    async fn classify(&self, text: &str, memory_context: &MemoryContext) -> Complexity {
        let options = CompletionOptions {
            temperature: 0.0,
            max_tokens: Some(20),
        };
        let prompt = Self::prompt(text, memory_context);
        let result = tokio::time::timeout(self.timeout, self.completion.complete(&prompt, &options)).await;

        match result {
            Ok(Ok(raw)) => match Self::parse_verdict(&raw) {
                Some(true) => Complexity::NeedsKnowledge,
                Some(false) => Complexity::Simple,
                None => {
                    debug!(raw = %raw, "unparseable classifier verdict, using heuristic");
                    self.fallback.classify_sync(text, memory_context)
                }
            },
            Ok(Err(e)) => {
                warn!(error = %e, "model classifier failed, using heuristic");
                self.fallback.classify_sync(text, memory_context)
            }
            Err(_) => {
                warn!("model classifier timed out, using heuristic");
                self.fallback.classify_sync(text, memory_context)
            }
        }
    }

    fn name(&self) -> &str {
        "model"
    }
}
