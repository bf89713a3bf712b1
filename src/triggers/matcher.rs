//! 触发器匹配
//!
//! 置信度 = 命中词数 / min(文本词数, 触发词数)，上限 1.0。多词短语要求其全部词都出现；
//! 含 CJK 的触发词按子串匹配。达到阈值后再检查前置条件。

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use crate::memory::tokenizer::{contains_cjk, tokenize, tokenize_to_set};
use crate::triggers::condition::check_all;
use crate::triggers::{Direction, RefusedTrigger, TriggerDefinition, TriggerMatch};

/// 置信度打分器：可替换为语义相似度实现，匹配契约不变
pub trait TriggerScorer: Send + Sync {
    /// 返回 [0, 1] 的置信度
    fn score(&self, text: &str, terms: &[String]) -> f32;
}

/// 词重叠打分（默认）
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlapScorer;

impl OverlapScorer {
    fn term_matches(term: &str, lowered_text: &str, text_tokens: &HashSet<String>) -> bool {
        if contains_cjk(term) {
            return lowered_text.contains(&term.to_lowercase());
        }
        let term_tokens = tokenize(term);
        !term_tokens.is_empty() && term_tokens.iter().all(|t| text_tokens.contains(t))
    }
}

impl TriggerScorer for OverlapScorer {
    fn score(&self, text: &str, terms: &[String]) -> f32 {
        let text_tokens = tokenize_to_set(text);
        if text_tokens.is_empty() || terms.is_empty() {
            return 0.0;
        }
        let lowered = text.to_lowercase();
        let matched = terms
            .iter()
            .filter(|term| Self::term_matches(term, &lowered, &text_tokens))
            .count();
        let denom = text_tokens.len().min(terms.len());
        (matched as f32 / denom as f32).min(1.0)
    }
}

/// 一个方向的匹配结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TriggerEvaluation {
    /// 置信度降序，相同置信度保持声明顺序
    pub matched: Vec<TriggerMatch>,
    /// 声明顺序
    pub refused: Vec<RefusedTrigger>,
}

/// 对某一方向的全部定义打分；达到阈值的定义再用 `facts` 检查前置条件
pub fn match_triggers(
    scorer: &dyn TriggerScorer,
    text: &str,
    definitions: &[TriggerDefinition],
    direction: Direction,
    facts: &Value,
) -> TriggerEvaluation {
    let mut evaluation = TriggerEvaluation::default();

    for def in definitions.iter().filter(|def| def.direction == direction) {
        let confidence = scorer.score(text, &def.match_terms);
        if confidence <= 0.0 || confidence < def.threshold {
            continue;
        }
        match check_all(&def.conditions, facts) {
            Ok(()) => evaluation.matched.push(TriggerMatch {
                trigger_id: def.id.clone(),
                confidence,
                direction,
                effect: def.effect.clone(),
            }),
            Err(reason) => evaluation.refused.push(RefusedTrigger {
                trigger_id: def.id.clone(),
                confidence,
                direction,
                reason,
            }),
        }
    }

    // sort_by 是稳定排序
    evaluation
        .matched
        .sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    evaluation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::{ConditionOp, TriggerCondition, TriggerEffect};
    use serde_json::json;

    fn def(id: &str, direction: Direction, terms: &[&str], threshold: f32) -> TriggerDefinition {
        TriggerDefinition {
            id: id.to_string(),
            direction,
            match_terms: terms.iter().map(|t| t.to_string()).collect(),
            threshold,
            conditions: vec![],
            effect: TriggerEffect::Narrative {
                event: format!("{}_event", id),
            },
        }
    }

    #[test]
    fn test_single_word_full_confidence() {
        let score = OverlapScorer.score("Bonjour !", &["bonjour".into(), "salut".into()]);
        assert!((score - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_multi_word_term_needs_all_tokens() {
        let terms = vec!["vieux phare".to_string()];
        assert_eq!(OverlapScorer.score("Le phare est neuf", &terms), 0.0);
        assert!(OverlapScorer.score("Parle-moi du vieux phare", &terms) > 0.0);
    }

    #[test]
    fn test_cjk_term_substring() {
        let terms = vec!["灯塔".to_string()];
        assert!(OverlapScorer.score("那座灯塔很古老", &terms) > 0.0);
    }

    #[test]
    fn test_empty_inputs_score_zero() {
        assert_eq!(OverlapScorer.score("", &["phare".into()]), 0.0);
        assert_eq!(OverlapScorer.score("phare", &[]), 0.0);
    }

    #[test]
    fn test_threshold_and_direction_filter() {
        let defs = vec![
            def("greet", Direction::Input, &["bonjour"], 0.5),
            def("strict", Direction::Input, &["bonjour", "phare", "secret", "nuit"], 1.0),
            def("reply", Direction::Output, &["bonjour"], 0.1),
        ];
        let text = "bonjour à toi, gardien du phare";
        let matches = match_triggers(&OverlapScorer, text, &defs, Direction::Input, &Value::Null).matched;
        let ids: Vec<_> = matches.iter().map(|m| m.trigger_id.as_str()).collect();
        assert_eq!(ids, vec!["greet"]);
        assert!(matches.iter().all(|m| m.direction == Direction::Input));
    }

    #[test]
    fn test_ordering_confidence_desc_then_declaration() {
        let defs = vec![
            def("low", Direction::Input, &["phare", "tempête", "nuit"], 0.1),
            def("tie_a", Direction::Input, &["phare"], 0.1),
            def("tie_b", Direction::Input, &["gardien"], 0.1),
        ];
        let text = "le gardien du phare";
        let first = match_triggers(&OverlapScorer, text, &defs, Direction::Input, &Value::Null);
        let ids: Vec<_> = first.matched.iter().map(|m| m.trigger_id.as_str()).collect();
        assert_eq!(ids, vec!["tie_a", "tie_b", "low"]);

        for _ in 0..10 {
            assert_eq!(match_triggers(&OverlapScorer, text, &defs, Direction::Input, &Value::Null), first);
        }
    }

    #[test]
    fn test_unmet_condition_refuses_with_reason() {
        let mut gated = def("lanterne", Direction::Input, &["lanterne"], 0.5);
        gated.conditions = vec![TriggerCondition {
            key: "player.reputation.elara".into(),
            op: ConditionOp::Gte,
            value: json!(2),
        }];
        let defs = vec![gated, def("greet", Direction::Input, &["bonjour"], 0.5)];
        let text = "bonjour, voici une lanterne";

        let stranger = json!({"player": {"reputation": {"elara": 0}}});
        let eval = match_triggers(&OverlapScorer, text, &defs, Direction::Input, &stranger);
        assert_eq!(eval.matched.iter().map(|m| m.trigger_id.as_str()).collect::<Vec<_>>(), vec!["greet"]);
        assert_eq!(eval.refused.len(), 1);
        assert_eq!(eval.refused[0].trigger_id, "lanterne");
        assert!(eval.refused[0].reason.contains("player.reputation.elara"));

        let friend = json!({"player": {"reputation": {"elara": 5}}});
        let eval = match_triggers(&OverlapScorer, text, &defs, Direction::Input, &friend);
        assert_eq!(eval.matched.len(), 2);
        assert!(eval.refused.is_empty());
    }

    #[test]
    fn test_conditions_not_checked_below_threshold() {
        let mut gated = def("lanterne", Direction::Input, &["lanterne"], 0.5);
        gated.conditions = vec![TriggerCondition {
            key: "player.missing".into(),
            op: ConditionOp::Exists,
            value: Value::Null,
        }];
        let eval = match_triggers(&OverlapScorer, "il fait beau", &[gated], Direction::Input, &Value::Null);
        assert!(eval.matched.is_empty());
        assert!(eval.refused.is_empty());
    }
}
