//! 触发条件
//!
//! 关键词命中之后再检查的前置条件，针对玩家与角色数据求值。数据以 JSON 对象提供：
//! `{"player": {...}, "character": {...}}`，条件的 `key` 用点分路径定位，例如
//! `player.reputation.elara`、`character.personality.confiance`。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 比较符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// 数组含有该值 / 字符串含有该子串 / 对象含有该键
    Contains,
    /// 路径存在且不为 null（忽略 value）
    Exists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub key: String,
    pub op: ConditionOp,
    #[serde(default)]
    pub value: Value,
}

impl TriggerCondition {
    /// 条件成立返回 Ok，否则返回拒绝原因
    pub fn check(&self, facts: &Value) -> Result<(), String> {
        let actual = lookup(facts, &self.key);
        let holds = match (self.op, actual) {
            (ConditionOp::Exists, found) => found.is_some_and(|v| !v.is_null()),
            (_, None) => return Err(format!("{} is missing", self.key)),
            (ConditionOp::Eq, Some(v)) => values_equal(v, &self.value),
            (ConditionOp::Ne, Some(v)) => !values_equal(v, &self.value),
            (ConditionOp::Gt, Some(v)) => compare(v, &self.value).is_some_and(|o| o.is_gt()),
            (ConditionOp::Gte, Some(v)) => compare(v, &self.value).is_some_and(|o| o.is_ge()),
            (ConditionOp::Lt, Some(v)) => compare(v, &self.value).is_some_and(|o| o.is_lt()),
            (ConditionOp::Lte, Some(v)) => compare(v, &self.value).is_some_and(|o| o.is_le()),
            (ConditionOp::Contains, Some(v)) => contains(v, &self.value),
        };

        if holds {
            Ok(())
        } else {
            Err(match actual {
                Some(v) => format!("{} {:?} {} failed (actual {})", self.key, self.op, self.value, v),
                None => format!("{} does not exist", self.key),
            })
        }
    }
}

/// 全部条件成立返回 Ok；否则返回第一个不成立条件的原因
pub fn check_all(conditions: &[TriggerCondition], facts: &Value) -> Result<(), String> {
    conditions.iter().try_for_each(|c| c.check(facts))
}

fn lookup<'a>(facts: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.').try_fold(facts, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Object(map) => needle.as_str().is_some_and(|n| map.contains_key(n)),
        _ => false,
    }
}
