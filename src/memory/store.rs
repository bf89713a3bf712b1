//! 记忆存储：追加、压缩、读取上下文、从持久化恢复
//!
//! 所有操作都要求调用方已持有会话锁（`&mut MemoryState` 即独占证明）。
//! 持久化写失败只记录 warn，不影响进程内状态。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::core::MemoryError;
use crate::llm::CompletionService;
use crate::memory::tokenizer::{contains_phrase, normalize_phrase};
use crate::memory::{MemoryContext, MemoryPersistence, MemoryState, Role, SessionRecord, Summary, Turn};

/// 记忆存储参数
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    pub keep_recent_messages: usize,
    pub max_messages_without_summary: u64,
    pub termination_cues: Vec<String>,
    pub summarization_timeout: Duration,
}

impl MemoryStoreConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            keep_recent_messages: config.memory.keep_recent_messages,
            max_messages_without_summary: config.memory.max_messages_without_summary.max(1),
            termination_cues: config.memory.termination_cues.clone(),
            summarization_timeout: config.llm.summarization_timeout(),
        }
    }
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

/// 一次压缩尝试的结果
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompactionStatus {
    /// 没有可压缩的消息
    NothingEligible,
    Compacted { start_seq: u64, end_seq: u64 },
    /// 摘要失败或超时，原始消息保留
    Deferred { reason: String },
}

/// append 的附带结果
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AppendOutcome {
    pub seq: u64,
    /// 命中的会话结束语
    pub termination_cue: Option<String>,
    pub compaction: Option<CompactionStatus>,
}

/// 记忆存储
pub struct MemoryStore {
    config: MemoryStoreConfig,
    completion: Arc<dyn CompletionService>,
    persistence: Arc<dyn MemoryPersistence>,
}

impl MemoryStore {
    pub fn new(
        config: MemoryStoreConfig,
        completion: Arc<dyn CompletionService>,
        persistence: Arc<dyn MemoryPersistence>,
    ) -> Self {
        Self {
            config,
            completion,
            persistence,
        }
    }

    pub fn config(&self) -> &MemoryStoreConfig {
        &self.config
    }

    /// 返回文本命中的第一个会话结束语（整词匹配，忽略大小写与标点）
    pub fn match_termination_cue(&self, text: &str) -> Option<String> {
        let normalized = normalize_phrase(text);
        self.config
            .termination_cues
            .iter()
            .find(|cue| contains_phrase(&normalized, cue))
            .cloned()
    }

    fn ensure_session(state: &MemoryState, session_id: &str) -> Result<(), MemoryError> {
        if state.is_closed() || state.session_id() != session_id {
            return Err(MemoryError::InvalidSession(session_id.to_string()));
        }
        Ok(())
    }

    /// 追加一条消息；角色回复使交换轮数 +1。达到压缩阈值或命中结束语时同步压缩后再返回。
    /// 压缩被推迟后，在下一次交换完成前不再重试，每轮最多等待一次摘要。
    pub async fn append(&self, state: &mut MemoryState, mut turn: Turn) -> Result<AppendOutcome, MemoryError> {
        Self::ensure_session(state, &turn.session_id)?;

        turn.seq = state.next_seq;
        state.next_seq += 1;
        if turn.role == Role::Character {
            state.total_turn_count += 1;
        }

        if let Err(e) = self.persistence.append_turn(&turn).await {
            warn!(session_id = %turn.session_id, seq = turn.seq, error = %e, "failed to persist turn");
        }

        let seq = turn.seq;
        let termination_cue = self.match_termination_cue(&turn.text);
        state.recent_turns.push_back(turn);
        state.spill_over(self.config.keep_recent_messages);

        let due = state.exchanges_since_summary() >= self.config.max_messages_without_summary;
        let deferred_this_exchange = state.deferred_at_exchange == Some(state.total_turn_count);
        let compaction = if (due || termination_cue.is_some()) && !deferred_this_exchange {
            debug!(
                session_id = %state.session_id(),
                due,
                cue = ?termination_cue,
                "compaction triggered"
            );
            Some(match self.compact(state).await {
                Ok(Some(summary)) => CompactionStatus::Compacted {
                    start_seq: summary.covers_turns.0,
                    end_seq: summary.covers_turns.1,
                },
                Ok(None) => CompactionStatus::NothingEligible,
                Err(MemoryError::SummarizationDeferred(reason)) => {
                    state.deferred_at_exchange = Some(state.total_turn_count);
                    CompactionStatus::Deferred { reason }
                }
                Err(e) => return Err(e),
            })
        } else {
            None
        };

        self.persist_record(state).await;

        Ok(AppendOutcome {
            seq,
            termination_cue,
            compaction,
        })
    }

    /// 将窗口之外的全部消息压缩为一条摘要。没有可压缩内容时为 no-op（返回 None）。
    pub async fn compact(&self, state: &mut MemoryState) -> Result<Option<Summary>, MemoryError> {
        if state.is_closed() {
            return Err(MemoryError::InvalidSession(state.session_id().to_string()));
        }
        state.spill_over(self.config.keep_recent_messages);
        let (start_seq, end_seq) = match (state.backlog.first(), state.backlog.last()) {
            (Some(first), Some(last)) => (first.seq, last.seq),
            _ => return Ok(None),
        };

        let result = tokio::time::timeout(
            self.config.summarization_timeout,
            self.completion.summarize(&state.backlog),
        )
        .await;

        let text = match result {
            Ok(Ok(text)) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(Ok(_)) => return Err(self.defer(state, "empty summary".to_string())),
            Ok(Err(e)) => return Err(self.defer(state, e.to_string())),
            Err(_) => return Err(self.defer(state, "summarization timed out".to_string())),
        };

        let summary = Summary {
            session_id: state.session_id().to_string(),
            covers_turns: (start_seq, end_seq),
            text,
            created_at: Utc::now(),
            exchange_count: state.total_turn_count,
        };

        state.summaries.push(summary.clone());
        state.backlog.clear();
        state.exchanges_at_last_summary = state.total_turn_count;
        state.deferred_at_exchange = None;

        if let Err(e) = self.persistence.save_summary(&summary).await {
            warn!(session_id = %summary.session_id, error = %e, "failed to persist summary");
        }
        self.persist_record(state).await;

        info!(
            session_id = %summary.session_id,
            start_seq,
            end_seq,
            summaries = state.summaries.len(),
            "memory compacted"
        );
        Ok(Some(summary))
    }

    fn defer(&self, state: &MemoryState, reason: String) -> MemoryError {
        warn!(
            session_id = %state.session_id(),
            pending = state.backlog.len(),
            reason = %reason,
            "compaction deferred"
        );
        MemoryError::SummarizationDeferred(reason)
    }

    /// 最近 `max_summaries` 条摘要（新→旧）+ 窗口内全部消息；只读
    pub fn read_context(&self, state: &MemoryState, max_summaries: usize) -> MemoryContext {
        MemoryContext {
            summaries: state
                .summaries
                .iter()
                .rev()
                .take(max_summaries)
                .cloned()
                .collect(),
            turns: state.recent_turns.iter().cloned().collect(),
        }
    }

    /// 从持久化恢复会话；无记录时返回空状态。记录属于其他会话或其他角色时返回 InvalidSession，
    /// 混入的其他会话消息与摘要被丢弃。
    pub async fn restore(
        &self,
        session_id: &str,
        character_id: &str,
        player_id: &str,
    ) -> Result<MemoryState, MemoryError> {
        let mut state = MemoryState::new(session_id, character_id, player_id);

        let record = match self.persistence.load_record(session_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(state),
            Err(e) => {
                warn!(session_id, error = %e, "failed to load session record, starting empty");
                return Ok(state);
            }
        };

        if record.session_id != session_id {
            warn!(session_id, stored = %record.session_id, "persisted record belongs to another session");
            return Err(MemoryError::InvalidSession(format!(
                "persisted record for {} belongs to {}",
                session_id, record.session_id
            )));
        }

        if record.character_id != character_id {
            return Err(MemoryError::InvalidSession(format!(
                "{} belongs to character {}",
                session_id, record.character_id
            )));
        }

        state.total_turn_count = record.total_turn_count;
        state.next_seq = record.next_seq;
        state.exchanges_at_last_summary = record.exchanges_at_last_summary;

        let mut summaries = self.persistence.load_summaries(session_id).await.unwrap_or_else(|e| {
            warn!(session_id, error = %e, "failed to load summaries");
            Vec::new()
        });
        Self::drop_foreign(session_id, &mut summaries, |s| &s.session_id);
        state.summaries = summaries;

        let from_seq = state
            .summaries
            .last()
            .map(|s| s.covers_turns.1 + 1)
            .unwrap_or(0);
        let mut turns = self
            .persistence
            .load_turns(session_id, from_seq)
            .await
            .unwrap_or_else(|e| {
                warn!(session_id, error = %e, "failed to load turns");
                Vec::new()
            });
        Self::drop_foreign(session_id, &mut turns, |t| &t.session_id);

        if let Some(last) = turns.last() {
            state.next_seq = state.next_seq.max(last.seq + 1);
        }
        state.recent_turns = turns.into_iter().collect();
        state.spill_over(self.config.keep_recent_messages);

        info!(
            session_id,
            total_turn_count = state.total_turn_count,
            summaries = state.summaries.len(),
            recent = state.recent_len(),
            pending = state.backlog.len(),
            "session restored from {}",
            self.persistence.name()
        );
        Ok(state)
    }

    /// 丢弃不属于本会话的持久化条目
    fn drop_foreign<T>(session_id: &str, items: &mut Vec<T>, owner: impl Fn(&T) -> &String) {
        let before = items.len();
        items.retain(|item| owner(item) == session_id);
        if items.len() < before {
            warn!(session_id, dropped = before - items.len(), "ignored persisted entries of another session");
        }
    }

    /// 清空原始消息；`keep_summaries` 为 false 时一并清空摘要。交换轮数保持不变。
    pub async fn clear(&self, state: &mut MemoryState, keep_summaries: bool) -> Result<(), MemoryError> {
        if state.is_closed() {
            return Err(MemoryError::InvalidSession(state.session_id().to_string()));
        }
        state.recent_turns.clear();
        state.backlog.clear();
        if !keep_summaries {
            state.summaries.clear();
        }
        state.exchanges_at_last_summary = state.total_turn_count;

        if let Err(e) = self.persistence.clear(state.session_id(), keep_summaries).await {
            warn!(session_id = %state.session_id(), error = %e, "failed to clear persisted turns");
        }
        self.persist_record(state).await;
        info!(session_id = %state.session_id(), keep_summaries, "memory cleared");
        Ok(())
    }

    async fn persist_record(&self, state: &MemoryState) {
        if let Err(e) = self.persistence.save_record(&SessionRecord::from_state(state)).await {
            warn!(session_id = %state.session_id(), error = %e, "failed to persist session record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockCompletion;
    use crate::memory::InMemoryPersistence;

    fn store_with(mock: Arc<MockCompletion>, persistence: Arc<InMemoryPersistence>) -> MemoryStore {
        let config = MemoryStoreConfig {
            keep_recent_messages: 4,
            max_messages_without_summary: 3,
            termination_cues: vec!["bye".into(), "au revoir".into()],
            summarization_timeout: Duration::from_millis(200),
        };
        MemoryStore::new(config, mock, persistence)
    }

    async fn exchange(store: &MemoryStore, state: &mut MemoryState, text: &str) -> AppendOutcome {
        let sid = state.session_id().to_string();
        store.append(state, Turn::user(&sid, text)).await.unwrap();
        store
            .append(state, Turn::character(&sid, format!("re: {}", text)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_window_is_bounded_and_count_is_exchanges() {
        let store = store_with(Arc::new(MockCompletion::new()), Arc::new(InMemoryPersistence::new()));
        let mut state = MemoryState::new("s1", "elara", "p1");
        exchange(&store, &mut state, "un").await;
        assert_eq!(state.total_turn_count(), 1);
        assert_eq!(state.recent_len(), 2);

        exchange(&store, &mut state, "deux").await;
        exchange(&store, &mut state, "trois").await;
        assert!(state.recent_len() <= 4);
        assert_eq!(state.total_turn_count(), 3);
    }

    #[tokio::test]
    async fn test_threshold_compacts_backlog_once() {
        let mock = Arc::new(MockCompletion::new());
        let store = store_with(mock.clone(), Arc::new(InMemoryPersistence::new()));
        let mut state = MemoryState::new("s1", "elara", "p1");

        exchange(&store, &mut state, "un").await;
        exchange(&store, &mut state, "deux").await;
        let outcome = exchange(&store, &mut state, "trois").await;

        assert_eq!(
            outcome.compaction,
            Some(CompactionStatus::Compacted { start_seq: 0, end_seq: 1 })
        );
        assert_eq!(state.summaries().len(), 1);
        assert!(state.backlog().is_empty());
        assert_eq!(state.total_turn_count(), 3);
        assert_eq!(mock.summarize_calls(), 1);
    }

    #[tokio::test]
    async fn test_compact_twice_is_noop() {
        let store = store_with(Arc::new(MockCompletion::new()), Arc::new(InMemoryPersistence::new()));
        let mut state = MemoryState::new("s1", "elara", "p1");
        exchange(&store, &mut state, "un").await;
        exchange(&store, &mut state, "deux").await;
        exchange(&store, &mut state, "trois").await;

        let before = state.summaries().len();
        assert!(store.compact(&mut state).await.unwrap().is_none());
        assert_eq!(state.summaries().len(), before);
    }

    #[tokio::test]
    async fn test_summarization_failure_keeps_turns() {
        let mock = Arc::new(MockCompletion::new());
        mock.set_fail_summarization(true);
        let store = store_with(mock.clone(), Arc::new(InMemoryPersistence::new()));
        let mut state = MemoryState::new("s1", "elara", "p1");

        exchange(&store, &mut state, "un").await;
        exchange(&store, &mut state, "deux").await;
        let outcome = exchange(&store, &mut state, "trois").await;

        assert!(matches!(outcome.compaction, Some(CompactionStatus::Deferred { .. })));
        assert_eq!(state.backlog().len(), 2);
        assert!(state.summaries().is_empty());

        assert_eq!(mock.summarize_calls(), 1);

        // 下一次交换完成时重试，用户消息那一步不重试
        mock.set_fail_summarization(false);
        let sid = state.session_id().to_string();
        let user_outcome = store.append(&mut state, Turn::user(&sid, "quatre")).await.unwrap();
        assert_eq!(user_outcome.compaction, None);
        assert_eq!(mock.summarize_calls(), 1);

        store.append(&mut state, Turn::character(&sid, "re: quatre")).await.unwrap();
        assert_eq!(mock.summarize_calls(), 2);
        assert_eq!(state.summaries().len(), 1);
        assert_eq!(state.summaries()[0].covers_turns, (0, 3));
        assert!(state.backlog().is_empty());
        assert_eq!(state.total_turn_count(), 4);
    }

    #[tokio::test]
    async fn test_summarization_timeout_is_deferred() {
        let mock = Arc::new(MockCompletion::new().with_summary_delay(Duration::from_secs(2)));
        let store = store_with(mock, Arc::new(InMemoryPersistence::new()));
        let mut state = MemoryState::new("s1", "elara", "p1");
        exchange(&store, &mut state, "un").await;
        exchange(&store, &mut state, "deux").await;
        exchange(&store, &mut state, "trois").await;

        let err = store.compact(&mut state).await.unwrap_err();
        assert!(matches!(err, MemoryError::SummarizationDeferred(_)));
        assert_eq!(state.backlog().len(), 2);
    }

    #[tokio::test]
    async fn test_slow_summarizer_waited_on_once_per_exchange() {
        let mock = Arc::new(MockCompletion::new().with_summary_delay(Duration::from_secs(2)));
        let store = store_with(mock.clone(), Arc::new(InMemoryPersistence::new()));
        let mut state = MemoryState::new("s1", "elara", "p1");
        for word in ["un", "deux", "trois"] {
            exchange(&store, &mut state, word).await;
        }
        assert_eq!(mock.summarize_calls(), 1);

        for (i, word) in ["quatre", "cinq"].into_iter().enumerate() {
            let started = std::time::Instant::now();
            let outcome = exchange(&store, &mut state, word).await;
            assert!(matches!(outcome.compaction, Some(CompactionStatus::Deferred { .. })));
            assert_eq!(mock.summarize_calls(), 2 + i);
            assert!(started.elapsed() < Duration::from_millis(400));
        }
    }

    #[tokio::test]
    async fn test_termination_cue_forces_compaction() {
        let store = store_with(Arc::new(MockCompletion::new()), Arc::new(InMemoryPersistence::new()));
        let mut state = MemoryState::new("s1", "elara", "p1");
        exchange(&store, &mut state, "un").await;
        exchange(&store, &mut state, "deux").await;

        let outcome = store.append(&mut state, Turn::user("s1", "Bon, au revoir !")).await.unwrap();
        assert_eq!(outcome.termination_cue.as_deref(), Some("au revoir"));
        assert!(matches!(outcome.compaction, Some(CompactionStatus::Compacted { .. })));
        assert!(store.match_termination_cue("maybe later").is_none());
    }

    #[tokio::test]
    async fn test_append_rejects_foreign_or_closed_session() {
        let store = store_with(Arc::new(MockCompletion::new()), Arc::new(InMemoryPersistence::new()));
        let mut state = MemoryState::new("s1", "elara", "p1");
        let err = store.append(&mut state, Turn::user("other", "hi")).await.unwrap_err();
        assert_eq!(err, MemoryError::InvalidSession("other".into()));

        state.close();
        assert!(store.append(&mut state, Turn::user("s1", "hi")).await.is_err());
        assert_eq!(state.total_turn_count(), 0);
    }

    #[tokio::test]
    async fn test_read_context_most_recent_first() {
        let store = store_with(Arc::new(MockCompletion::new()), Arc::new(InMemoryPersistence::new()));
        let mut state = MemoryState::new("s1", "elara", "p1");
        for word in ["un", "deux", "trois", "quatre", "cinq", "six"] {
            exchange(&store, &mut state, word).await;
        }
        assert_eq!(state.summaries().len(), 2);

        let ctx = store.read_context(&state, 1);
        assert_eq!(ctx.summaries.len(), 1);
        assert_eq!(ctx.summaries[0], state.summaries()[1]);
        assert_eq!(ctx.turns.len(), state.recent_len());
    }

    #[tokio::test]
    async fn test_restore_after_restart() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let store = store_with(Arc::new(MockCompletion::new()), persistence.clone());
        let mut state = MemoryState::new("s1", "elara", "p1");
        for word in ["un", "deux", "trois", "quatre"] {
            exchange(&store, &mut state, word).await;
        }

        let restored = store.restore("s1", "elara", "p1").await.unwrap();
        assert_eq!(restored.total_turn_count(), state.total_turn_count());
        assert_eq!(restored.summaries(), state.summaries());
        assert_eq!(
            restored.recent_turns().map(|t| t.seq).collect::<Vec<_>>(),
            state.recent_turns().map(|t| t.seq).collect::<Vec<_>>()
        );
        assert_eq!(restored.backlog().len(), state.backlog().len());

        let err = store.restore("s1", "mordred", "p1").await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidSession(_)));
    }

    /// 所有会话共用一个存储位置的后端
    #[derive(Default)]
    struct SharedSlotPersistence {
        record: std::sync::Mutex<Option<SessionRecord>>,
        turns: std::sync::Mutex<Vec<Turn>>,
        summaries: std::sync::Mutex<Vec<Summary>>,
    }

    #[async_trait::async_trait]
    impl MemoryPersistence for SharedSlotPersistence {
        async fn save_record(&self, record: &SessionRecord) -> Result<(), crate::core::PersistenceError> {
            *self.record.lock().unwrap() = Some(record.clone());
            Ok(())
        }

        async fn load_record(&self, _session_id: &str) -> Result<Option<SessionRecord>, crate::core::PersistenceError> {
            Ok(self.record.lock().unwrap().clone())
        }

        async fn append_turn(&self, turn: &Turn) -> Result<(), crate::core::PersistenceError> {
            self.turns.lock().unwrap().push(turn.clone());
            Ok(())
        }

        async fn load_turns(&self, _session_id: &str, from_seq: u64) -> Result<Vec<Turn>, crate::core::PersistenceError> {
            Ok(self.turns.lock().unwrap().iter().filter(|t| t.seq >= from_seq).cloned().collect())
        }

        async fn save_summary(&self, summary: &Summary) -> Result<(), crate::core::PersistenceError> {
            self.summaries.lock().unwrap().push(summary.clone());
            Ok(())
        }

        async fn load_summaries(&self, _session_id: &str) -> Result<Vec<Summary>, crate::core::PersistenceError> {
            Ok(self.summaries.lock().unwrap().clone())
        }

        async fn clear(&self, _session_id: &str, _keep_summaries: bool) -> Result<(), crate::core::PersistenceError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_restore_rejects_record_of_other_session() {
        let persistence = Arc::new(SharedSlotPersistence::default());
        let store = MemoryStore::new(
            MemoryStoreConfig {
                keep_recent_messages: 4,
                max_messages_without_summary: 10,
                termination_cues: vec![],
                summarization_timeout: Duration::from_millis(200),
            },
            Arc::new(MockCompletion::new()),
            persistence.clone(),
        );
        let mut alice = MemoryState::new("player.1", "elara", "alice");
        exchange(&store, &mut alice, "Mon secret: le code est 1234").await;

        let err = store.restore("player_1", "elara", "bob").await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidSession(_)));

        // 元数据属于本会话时，混入的其他会话消息被丢弃
        let own = SessionRecord::from_state(&MemoryState::new("player_1", "elara", "bob"));
        *persistence.record.lock().unwrap() = Some(own);
        let fresh = store.restore("player_1", "elara", "bob").await.unwrap();
        assert_eq!(fresh.total_turn_count(), 0);
        assert_eq!(fresh.recent_len(), 0);
        assert!(fresh.backlog().is_empty());
    }

    #[tokio::test]
    async fn test_clear_keeps_count_and_optional_summaries() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let store = store_with(Arc::new(MockCompletion::new()), persistence.clone());
        let mut state = MemoryState::new("s1", "elara", "p1");
        for word in ["un", "deux", "trois"] {
            exchange(&store, &mut state, word).await;
        }

        store.clear(&mut state, true).await.unwrap();
        assert_eq!(state.recent_len(), 0);
        assert_eq!(state.summaries().len(), 1);
        assert_eq!(state.total_turn_count(), 3);

        let restored = store.restore("s1", "elara", "p1").await.unwrap();
        assert_eq!(restored.recent_len(), 0);
        assert_eq!(restored.summaries().len(), 1);
    }
}
