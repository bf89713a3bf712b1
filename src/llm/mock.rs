//! Mock 补全服务（用于测试与离线运行，无需 API）
//!
//! 回复确定性：未设置固定回复时回显玩家消息。可注入延迟与失败，便于测试超时、并发与失败路径。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::CompletionError;
use crate::llm::{CompletionOptions, CompletionService, Prompt};
use crate::memory::Turn;

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockCompletion {
    reply: Option<String>,
    delay: Option<Duration>,
    summary_delay: Option<Duration>,
    generation_error: Mutex<Option<CompletionError>>,
    fail_summarization: AtomicBool,
    complete_calls: AtomicUsize,
    summarize_calls: AtomicUsize,
}

impl MockCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// 固定回复
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// 每次生成前等待
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 每次摘要前等待
    pub fn with_summary_delay(mut self, delay: Duration) -> Self {
        self.summary_delay = Some(delay);
        self
    }

    /// 生成以瞬时错误失败
    pub fn set_fail_generation(&self, fail: bool) {
        let error = fail.then(|| CompletionError::Transient("mock generation failure".to_string()));
        self.fail_generation_with(error);
    }

    /// 生成以指定错误失败；None 恢复正常
    pub fn fail_generation_with(&self, error: Option<CompletionError>) {
        if let Ok(mut slot) = self.generation_error.lock() {
            *slot = error;
        }
    }

    pub fn set_fail_summarization(&self, fail: bool) {
        self.fail_summarization.store(fail, Ordering::SeqCst);
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn summarize_calls(&self) -> usize {
        self.summarize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionService for MockCompletion {
    async fn complete(&self, prompt: &Prompt, _options: &CompletionOptions) -> Result<String, CompletionError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let injected = self.generation_error.lock().ok().and_then(|slot| slot.clone());
        if let Some(error) = injected {
            return Err(error);
        }

        Ok(self
            .reply
            .clone()
            .unwrap_or_else(|| format!("Réponse à: {}", prompt.user)))
    }

    async fn summarize(&self, turns: &[Turn]) -> Result<String, CompletionError> {
        self.summarize_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.summary_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_summarization.load(Ordering::SeqCst) {
            return Err(CompletionError::Transient("mock summarization failure".to_string()));
        }

        let first = turns.first().map(|t| t.text.as_str()).unwrap_or("");
        Ok(format!("Résumé de {} messages, depuis « {} »", turns.len(), first))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_echo_and_failure_toggle() {
        let mock = MockCompletion::new();
        let prompt = Prompt {
            user: "Bonjour".into(),
            ..Default::default()
        };
        let reply = mock.complete(&prompt, &CompletionOptions::default()).await.unwrap();
        assert_eq!(reply, "Réponse à: Bonjour");

        mock.set_fail_generation(true);
        let err = mock.complete(&prompt, &CompletionOptions::default()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(mock.complete_calls(), 2);

        mock.fail_generation_with(Some(CompletionError::Fatal("401".into())));
        let err = mock.complete(&prompt, &CompletionOptions::default()).await.unwrap_err();
        assert_eq!(err, CompletionError::Fatal("401".into()));
    }

    #[tokio::test]
    async fn test_mock_summary() {
        let mock = MockCompletion::new();
        let turns = vec![Turn::user("s", "Bonjour"), Turn::character("s", "Salut")];
        let summary = mock.summarize(&turns).await.unwrap();
        assert!(summary.starts_with("Résumé de 2 messages"));
        assert_eq!(mock.summarize_calls(), 1);
    }
}
