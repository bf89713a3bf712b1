//! 会话持久化
//!
//! 以 session_id 为键持久化 Turn、Summary 与会话元数据，支持追加与按序号范围读取，
//! 进程重启后据此恢复 MemoryState。提供内存与 JSON 文件（元数据 + JSONL 消息日志）两种后端；SQLite 后端见 `async_persistence`。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::core::PersistenceError;
use crate::memory::{MemoryState, Summary, Turn};

/// 会话元数据
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub character_id: String,
    pub player_id: String,
    pub total_turn_count: u64,
    pub next_seq: u64,
    pub exchanges_at_last_summary: u64,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn from_state(state: &MemoryState) -> Self {
        Self {
            session_id: state.session_id().to_string(),
            character_id: state.character_id().to_string(),
            player_id: state.player_id().to_string(),
            total_turn_count: state.total_turn_count,
            next_seq: state.next_seq,
            exchanges_at_last_summary: state.exchanges_at_last_summary,
            updated_at: Utc::now(),
        }
    }
}

/// 持久化能力：记忆存储只依赖此 trait，具体存储格式由实现决定
#[async_trait]
pub trait MemoryPersistence: Send + Sync {
    async fn save_record(&self, record: &SessionRecord) -> Result<(), PersistenceError>;

    async fn load_record(&self, session_id: &str) -> Result<Option<SessionRecord>, PersistenceError>;

    async fn append_turn(&self, turn: &Turn) -> Result<(), PersistenceError>;

    /// 读取 seq >= from_seq 的消息，按 seq 升序
    async fn load_turns(&self, session_id: &str, from_seq: u64) -> Result<Vec<Turn>, PersistenceError>;

    async fn save_summary(&self, summary: &Summary) -> Result<(), PersistenceError>;

    /// 按创建顺序返回全部摘要
    async fn load_summaries(&self, session_id: &str) -> Result<Vec<Summary>, PersistenceError>;

    /// 删除原始消息；`keep_summaries` 为 false 时一并删除摘要
    async fn clear(&self, session_id: &str, keep_summaries: bool) -> Result<(), PersistenceError>;

    fn name(&self) -> &str {
        "persistence"
    }
}

/// 单个会话的完整持久化内容
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct SessionFile {
    record: Option<SessionRecord>,
    turns: Vec<Turn>,
    summaries: Vec<Summary>,
}

impl SessionFile {
    fn turns_from(&self, from_seq: u64) -> Vec<Turn> {
        let mut turns: Vec<Turn> = self
            .turns
            .iter()
            .filter(|t| t.seq >= from_seq)
            .cloned()
            .collect();
        turns.sort_by_key(|t| t.seq);
        turns
    }

    fn clear(&mut self, keep_summaries: bool) {
        self.turns.clear();
        if !keep_summaries {
            self.summaries.clear();
        }
    }
}

/// 进程内持久化（测试与 `backend = "memory"`）
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    sessions: RwLock<HashMap<String, SessionFile>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryPersistence for InMemoryPersistence {
    async fn save_record(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        let mut sessions = self.sessions.write().await;
        sessions.entry(record.session_id.clone()).or_default().record = Some(record.clone());
        Ok(())
    }

    async fn load_record(&self, session_id: &str) -> Result<Option<SessionRecord>, PersistenceError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).and_then(|f| f.record.clone()))
    }

    async fn append_turn(&self, turn: &Turn) -> Result<(), PersistenceError> {
        let mut sessions = self.sessions.write().await;
        sessions.entry(turn.session_id.clone()).or_default().turns.push(turn.clone());
        Ok(())
    }

    async fn load_turns(&self, session_id: &str, from_seq: u64) -> Result<Vec<Turn>, PersistenceError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session_id)
            .map(|f| f.turns_from(from_seq))
            .unwrap_or_default())
    }

    async fn save_summary(&self, summary: &Summary) -> Result<(), PersistenceError> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(summary.session_id.clone())
            .or_default()
            .summaries
            .push(summary.clone());
        Ok(())
    }

    async fn load_summaries(&self, session_id: &str) -> Result<Vec<Summary>, PersistenceError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session_id)
            .map(|f| f.summaries.clone())
            .unwrap_or_default())
    }

    async fn clear(&self, session_id: &str, keep_summaries: bool) -> Result<(), PersistenceError> {
        let mut sessions = self.sessions.write().await;
        if let Some(file) = sessions.get_mut(session_id) {
            file.clear(keep_summaries);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// JSON 文件持久化
///
/// 每个会话两个文件：`<key>.json` 保存元数据与摘要，`<key>.turns.jsonl` 逐行追加原始消息。
/// `<key>` 是 session_id 的 URL-safe base64 编码，不同 ID 不会落到同一文件。
/// 写操作按会话加锁，不同会话互不阻塞。
#[derive(Debug)]
pub struct JsonFilePersistence {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// `<key>.json` 的内容
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct SessionMeta {
    record: Option<SessionRecord>,
    summaries: Vec<Summary>,
}

impl JsonFilePersistence {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            locks: DashMap::new(),
        }
    }

    fn file_key(session_id: &str) -> String {
        URL_SAFE_NO_PAD.encode(session_id.as_bytes())
    }

    fn meta_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::file_key(session_id)))
    }

    fn turns_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.turns.jsonl", Self::file_key(session_id)))
    }

    async fn lock(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(session_id.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    /// 文件不存在时返回空内容
    async fn read_meta(&self, session_id: &str) -> Result<SessionMeta, PersistenceError> {
        match tokio::fs::read_to_string(self.meta_path(session_id)).await {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SessionMeta::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_meta<F>(&self, session_id: &str, f: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&mut SessionMeta) + Send,
    {
        let _guard = self.lock(session_id).await;
        let mut meta = self.read_meta(session_id).await?;
        f(&mut meta);
        tokio::fs::create_dir_all(&self.dir).await?;
        let data = serde_json::to_string_pretty(&meta)?;
        tokio::fs::write(self.meta_path(session_id), data).await?;
        Ok(())
    }

    async fn remove_if_exists(path: &Path) -> Result<(), PersistenceError> {
        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl MemoryPersistence for JsonFilePersistence {
    async fn save_record(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        let record = record.clone();
        let session_id = record.session_id.clone();
        self.update_meta(&session_id, move |m| m.record = Some(record)).await
    }

    async fn load_record(&self, session_id: &str) -> Result<Option<SessionRecord>, PersistenceError> {
        Ok(self.read_meta(session_id).await?.record)
    }

    async fn append_turn(&self, turn: &Turn) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_string(turn)?;
        line.push('\n');

        let _guard = self.lock(&turn.session_id).await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.turns_path(&turn.session_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_turns(&self, session_id: &str, from_seq: u64) -> Result<Vec<Turn>, PersistenceError> {
        let data = match tokio::fs::read_to_string(self.turns_path(session_id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut turns = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            let turn: Turn = serde_json::from_str(line)?;
            if turn.seq >= from_seq {
                turns.push(turn);
            }
        }
        turns.sort_by_key(|t| t.seq);
        Ok(turns)
    }

    async fn save_summary(&self, summary: &Summary) -> Result<(), PersistenceError> {
        let summary = summary.clone();
        let session_id = summary.session_id.clone();
        self.update_meta(&session_id, move |m| m.summaries.push(summary)).await
    }

    async fn load_summaries(&self, session_id: &str) -> Result<Vec<Summary>, PersistenceError> {
        Ok(self.read_meta(session_id).await?.summaries)
    }

    async fn clear(&self, session_id: &str, keep_summaries: bool) -> Result<(), PersistenceError> {
        {
            let _guard = self.lock(session_id).await;
            Self::remove_if_exists(&self.turns_path(session_id)).await?;
        }
        if !keep_summaries {
            self.update_meta(session_id, |m| m.summaries.clear()).await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(seq: u64, text: &str) -> Turn {
        let mut t = Turn::user("sess-1", text);
        t.seq = seq;
        t
    }

    #[tokio::test]
    async fn test_in_memory_range_read() {
        let store = InMemoryPersistence::new();
        for i in 0..4 {
            store.append_turn(&turn(i, "hello")).await.unwrap();
        }
        let turns = store.load_turns("sess-1", 2).await.unwrap();
        assert_eq!(turns.iter().map(|t| t.seq).collect::<Vec<_>>(), vec![2, 3]);
        assert!(store.load_turns("missing", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFilePersistence::new(dir.path().join("sessions"));

        let state = MemoryState::new("sess-1", "elara", "p1");
        store.save_record(&SessionRecord::from_state(&state)).await.unwrap();
        store.append_turn(&turn(0, "Bonjour")).await.unwrap();
        store.append_turn(&turn(1, "Salut")).await.unwrap();
        store
            .save_summary(&Summary {
                session_id: "sess-1".into(),
                covers_turns: (0, 0),
                text: "Le joueur a salué Elara.".into(),
                created_at: Utc::now(),
                exchange_count: 1,
            })
            .await
            .unwrap();

        let reopened = JsonFilePersistence::new(dir.path().join("sessions"));
        let record = reopened.load_record("sess-1").await.unwrap().unwrap();
        assert_eq!(record.character_id, "elara");
        assert_eq!(reopened.load_turns("sess-1", 1).await.unwrap().len(), 1);
        assert_eq!(reopened.load_summaries("sess-1").await.unwrap().len(), 1);

        reopened.clear("sess-1", true).await.unwrap();
        assert!(reopened.load_turns("sess-1", 0).await.unwrap().is_empty());
        assert_eq!(reopened.load_summaries("sess-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_json_file_missing_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFilePersistence::new(dir.path());
        assert!(store.load_record("nope").await.unwrap().is_none());
        assert!(store.load_summaries("nope").await.unwrap().is_empty());
    }

    #[test]
    fn test_file_names_are_distinct_and_reversible() {
        let store = JsonFilePersistence::new("/tmp/bard");
        let ids = ["player.1", "player_1", "joueur é", "../etc/passwd"];
        let paths: Vec<PathBuf> = ids.iter().map(|id| store.meta_path(id)).collect();

        for (id, path) in ids.iter().zip(&paths) {
            assert_eq!(path.parent(), Some(Path::new("/tmp/bard")));
            let key = path.file_name().unwrap().to_str().unwrap().strip_suffix(".json").unwrap();
            assert_eq!(URL_SAFE_NO_PAD.decode(key).unwrap(), id.as_bytes());
        }
        let unique: std::collections::HashSet<_> = paths.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[tokio::test]
    async fn test_json_sessions_with_similar_ids_stay_apart() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFilePersistence::new(dir.path());
        store.append_turn(&Turn::user("player.1", "Mon secret: 1234")).await.unwrap();
        store.append_turn(&Turn::user("player_1", "Bonjour")).await.unwrap();

        let turns = store.load_turns("player_1", 0).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].text, "Bonjour");
        assert!(store.load_record("player.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_concurrent_appends_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFilePersistence::new(dir.path()));
        let mut tasks = Vec::new();
        for i in 0..20u64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let session = if i % 2 == 0 { "a" } else { "b" };
                let mut t = Turn::user(session, format!("message {}", i));
                t.seq = i;
                store.append_turn(&t).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.load_turns("a", 0).await.unwrap().len(), 10);
        assert_eq!(store.load_turns("b", 0).await.unwrap().len(), 10);
    }
}
