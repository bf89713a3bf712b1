//! Token 预算控制
//!
//! 为系统提示设置 token 预算，各提示段按优先级竞争；输出仍按固定版面顺序排列，保证相同输入得到相同提示。

use std::collections::HashMap;

/// Token 估算：ASCII 约 4 字符 / token，重音字母与 CJK 约 1.5 字符 / token
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn estimate(text: &str) -> usize {
        let (ascii, other) = text
            .chars()
            .fold((0usize, 0usize), |(a, o), c| if c.is_ascii() { (a + 1, o) } else { (a, o + 1) });
        (ascii.div_ceil(4) + (other * 2).div_ceil(3)).max(1)
    }
}

/// 提示段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PromptSegment {
    /// 角色身份、性格、说话风格
    Identity,
    /// 可透露的秘密
    Secrets,
    /// 检索到的知识段落
    Knowledge,
    /// 历史摘要
    Summaries,
    /// 最近对话
    History,
    /// 本轮触发的输入触发器
    Triggers,
    /// 扮演规则
    Instructions,
}

impl PromptSegment {
    /// 获取优先级（数字越小越先分配预算）
    pub fn priority(&self) -> u8 {
        match self {
            PromptSegment::Identity => 0,
            PromptSegment::Instructions => 1,
            PromptSegment::Triggers => 2,
            PromptSegment::History => 3,
            PromptSegment::Summaries => 4,
            PromptSegment::Secrets => 5,
            PromptSegment::Knowledge => 6,
        }
    }

    /// 超预算时保留结尾（最近对话）而不是开头
    fn keeps_tail(&self) -> bool {
        matches!(self, PromptSegment::History)
    }
}

/// 系统提示的 token 预算
#[derive(Debug, Clone)]
pub struct TokenBudget {
    total_budget: usize,
    /// 单段上限（未设置的段只受剩余预算约束）
    segment_limits: HashMap<PromptSegment, usize>,
}

impl TokenBudget {
    pub fn new(total_budget: usize) -> Self {
        Self {
            total_budget,
            segment_limits: HashMap::new(),
        }
    }

    /// 设置某段落的最大 token 数
    pub fn with_segment_limit(mut self, segment: PromptSegment, limit: usize) -> Self {
        self.segment_limits.insert(segment, limit);
        self
    }

    pub fn total_budget(&self) -> usize {
        self.total_budget
    }

    /// 按优先级分配 token，返回截断后的段落，按版面顺序（枚举声明顺序）排列；空段落被跳过
    pub fn allocate(&self, segments: &[(PromptSegment, String)]) -> Vec<(PromptSegment, String)> {
        let mut result = Vec::new();
        let mut remaining = self.total_budget;

        let mut sorted: Vec<_> = segments.iter().filter(|(_, c)| !c.is_empty()).collect();
        sorted.sort_by_key(|(seg, _)| seg.priority());

        for (segment, content) in sorted {
            let estimated_tokens = TokenEstimator::estimate(content);
            let segment_limit = self.segment_limits.get(segment).copied().unwrap_or(remaining);
            let allowed = remaining.min(segment_limit);

            if estimated_tokens <= allowed {
                result.push((*segment, content.clone()));
                remaining = remaining.saturating_sub(estimated_tokens);
            } else if allowed > 0 {
                let truncated = Self::truncate_to_tokens(content, allowed, segment.keeps_tail());
                let truncated_tokens = TokenEstimator::estimate(&truncated);
                result.push((*segment, truncated));
                remaining = remaining.saturating_sub(truncated_tokens);
            }
        }

        result.sort_by_key(|(seg, _)| *seg);
        result
    }

    /// 将文本截断到指定 token 数（保留开头或结尾，按行边界对齐）
    fn truncate_to_tokens(text: &str, max_tokens: usize, keep_tail: bool) -> String {
        let estimated = TokenEstimator::estimate(text);
        if estimated <= max_tokens {
            return text.to_string();
        }

        // 按比例截断，留 10% 余量
        let ratio = max_tokens as f64 / estimated as f64;
        let total_chars = text.chars().count();
        let target_chars = (total_chars as f64 * ratio * 0.9) as usize;

        if keep_tail {
            let tail: String = text.chars().skip(total_chars - target_chars).collect();
            // 丢弃被截断的半行
            let tail = match tail.find('\n') {
                Some(pos) if pos + 1 < tail.len() => &tail[pos + 1..],
                _ => tail.as_str(),
            };
            format!("[...]\n{}", tail.trim_start())
        } else {
            let head: String = text.chars().take(target_chars).collect();
            format!("{}...", head.trim_end())
        }
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(4000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimator() {
        assert_eq!(TokenEstimator::estimate(""), 1);
        assert_eq!(TokenEstimator::estimate("abcdefgh"), 2);
        // 3 个非 ASCII 字符 ≈ 2 token
        assert_eq!(TokenEstimator::estimate("éèà"), 2);
        assert!(TokenEstimator::estimate("灯塔守护者") > TokenEstimator::estimate("phare"));
    }

    #[test]
    fn test_allocation_layout_order() {
        let budget = TokenBudget::new(1000);
        let segments = vec![
            (PromptSegment::Instructions, "rules".to_string()),
            (PromptSegment::Knowledge, "lore".to_string()),
            (PromptSegment::Identity, "Tu es Elara.".to_string()),
            (PromptSegment::Secrets, String::new()),
        ];

        let allocated = budget.allocate(&segments);
        let order: Vec<_> = allocated.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            order,
            vec![PromptSegment::Identity, PromptSegment::Knowledge, PromptSegment::Instructions]
        );
    }

    #[test]
    fn test_low_priority_segment_is_cut_first() {
        let budget = TokenBudget::new(30);
        let identity = "Tu es Elara, gardienne du phare.".to_string();
        let knowledge = "Le phare fut construit il y a trois siècles par les moines. ".repeat(20);
        let allocated = budget.allocate(&[
            (PromptSegment::Knowledge, knowledge.clone()),
            (PromptSegment::Identity, identity.clone()),
        ]);

        assert_eq!(allocated[0].1, identity);
        if let Some((_, kept)) = allocated.iter().find(|(s, _)| *s == PromptSegment::Knowledge) {
            assert!(kept.len() < knowledge.len());
        }
    }

    #[test]
    fn test_history_keeps_most_recent_lines() {
        let history = (0..200)
            .map(|i| format!("Joueur: message numéro {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let allocated = TokenBudget::new(50).allocate(&[(PromptSegment::History, history)]);
        let kept = &allocated[0].1;
        assert!(kept.starts_with("[...]"));
        assert!(kept.ends_with("message numéro 199"));
        assert!(!kept.contains("message numéro 0\n"));
    }
}
