//! 分词模块
//!
//! 提供中英法混合分词能力，用于触发器匹配与知识检索。
//! 含 CJK 字符时使用 jieba-rs 分词，其余按 Unicode 字母数字边界切分（撇号也视为边界，`l'île` → `île`）。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

/// 全局 Jieba 实例（延迟初始化）
static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

/// 判断字符是否为 CJK（中日韩）字符
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |   // CJK Unified Ideographs
        '\u{3400}'..='\u{4DBF}' |   // CJK Unified Ideographs Extension A
        '\u{F900}'..='\u{FAFF}' |   // CJK Compatibility Ideographs
        '\u{3040}'..='\u{309F}' |   // Hiragana
        '\u{30A0}'..='\u{30FF}'     // Katakana
    )
}

/// 判断文本是否包含 CJK 字符
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// 按非字母数字字符切分并转小写；单个拉丁字母（如法语的 `l`、`d`）被丢弃
fn split_words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1 || w.chars().any(is_cjk))
}

/// 智能分词：根据文本内容自动选择分词策略
/// - 包含 CJK 字符时使用 jieba 分词（搜索引擎模式）
/// - 其他文本按字母数字边界切分
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .flat_map(split_words)
            .collect()
    } else {
        split_words(text).collect()
    }
}

/// 分词并返回词集合（用于相似度计算）
pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// 计算两个词集合的重叠分数（交集大小）
pub fn overlap_score(set1: &HashSet<String>, set2: &HashSet<String>) -> usize {
    set1.intersection(set2).count()
}

/// 短语归一化：小写、非字母数字替换为空格并压缩，便于整词短语匹配
pub fn normalize_phrase(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// 判断已归一化的文本是否以整词方式包含短语（"bye" 不会命中 "maybe"）
pub fn contains_phrase(normalized_text: &str, phrase: &str) -> bool {
    let phrase = normalize_phrase(phrase);
    if phrase.is_empty() {
        return false;
    }
    if contains_cjk(&phrase) {
        return normalized_text.contains(&phrase);
    }
    format!(" {} ", normalized_text).contains(&format!(" {} ", phrase))
}
