//! 肢体动作解析：`*soupire*` 形式的动作从台词中分离出来

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

static ACTION_RE: OnceLock<Regex> = OnceLock::new();
static SPACES_RE: OnceLock<Regex> = OnceLock::new();

fn action_re() -> &'static Regex {
    ACTION_RE.get_or_init(|| Regex::new(r"\*([^*]+)\*").expect("valid action regex"))
}

fn spaces_re() -> &'static Regex {
    SPACES_RE.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"))
}

/// 解析结果
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ActionParsed {
    /// 去掉动作后的台词
    pub text: String,
    pub actions: Vec<String>,
}

impl ActionParsed {
    pub fn has_actions(&self) -> bool {
        !self.actions.is_empty()
    }
}

pub fn parse_actions(message: &str) -> ActionParsed {
    let actions = action_re()
        .captures_iter(message)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();
    let stripped = action_re().replace_all(message, "");
    let text = spaces_re().replace_all(stripped.trim(), " ").into_owned();
    ActionParsed { text, actions }
}

/// 重新格式化为 `*a* *b*`
pub fn format_actions(actions: &[String]) -> String {
    actions
        .iter()
        .map(|a| format!("*{}*", a))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_actions() {
        let parsed = parse_actions("*soupire* Encore toi ?   *croise les bras*");
        assert_eq!(parsed.actions, vec!["soupire", "croise les bras"]);
        assert_eq!(parsed.text, "Encore toi ?");
        assert!(parsed.has_actions());
    }

    #[test]
    fn test_no_actions_and_unbalanced() {
        let parsed = parse_actions("Bonjour *");
        assert!(parsed.actions.is_empty());
        assert_eq!(parsed.text, "Bonjour *");
    }

    #[test]
    fn test_format_actions() {
        assert_eq!(format_actions(&["sourit".into(), "hoche la tête".into()]), "*sourit* *hoche la tête*");
        assert_eq!(format_actions(&[]), "");
    }
}
