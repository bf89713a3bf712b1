//! 会话注册表
//!
//! 进程内 session_id → SessionHandle 映射，是唯一真正共享的可变状态。映射锁只在查找 / 插入时短暂持有，
//! 不跨越一轮对话；每个会话的记忆由自己的异步互斥锁保护（FIFO，同一会话的消息按到达顺序串行）。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::memory::MemoryState;

/// 会话 ID
pub type SessionId = String;

/// 生成新的会话 ID
pub fn new_session_id() -> SessionId {
    format!("session_{}", uuid::Uuid::new_v4())
}

/// 单个会话
///
/// `memory` 为 None 表示尚未从持久化恢复（首轮在锁内加载）。
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub character_id: String,
    pub player_id: String,
    pub created_at: DateTime<Utc>,
    started: Instant,
    /// 最后活跃时间（相对 started 的毫秒数）
    last_activity_ms: AtomicU64,
    closed: AtomicBool,
    memory: Arc<Mutex<Option<MemoryState>>>,
}

impl SessionHandle {
    fn new(session_id: &str, character_id: &str, player_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            character_id: character_id.to_string(),
            player_id: player_id.to_string(),
            created_at: Utc::now(),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            memory: Arc::new(Mutex::new(None)),
        }
    }

    /// 取得会话锁；持有期间独占 MemoryState。guard 不借用 handle，可跨越整轮对话持有
    pub async fn lock(&self) -> OwnedMutexGuard<Option<MemoryState>> {
        self.memory.clone().lock_owned().await
    }

    /// 更新最后活跃时间
    pub fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.idle_for() > ttl
    }

    /// 已被驱逐：持有者应重新向注册表获取
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 在持有会话锁时关闭
    fn close_locked(&self, guard: &mut Option<MemoryState>) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(state) = guard.as_mut() {
            state.close();
        }
    }
}

/// 会话注册表（显式注入，生命周期：new → sweep / spawn_sweeper → shutdown）
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取或创建会话；同一 id 并发首次调用只会构造一个 handle。返回 (handle, 是否新建)
    pub async fn get_or_create(
        &self,
        session_id: &str,
        character_id: &str,
        player_id: &str,
    ) -> (Arc<SessionHandle>, bool) {
        if let Some(handle) = self.sessions.read().await.get(session_id) {
            if !handle.is_closed() {
                handle.touch();
                return (handle.clone(), false);
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(session_id) {
            if !handle.is_closed() {
                handle.touch();
                return (handle.clone(), false);
            }
        }

        let handle = Arc::new(SessionHandle::new(session_id, character_id, player_id));
        sessions.insert(session_id.to_string(), handle.clone());
        info!(session_id, character_id, player_id, "session created");
        (handle, true)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// 驱逐会话：等待进行中的一轮结束后关闭并移除。返回是否存在该会话
    pub async fn evict(&self, session_id: &str) -> bool {
        let Some(handle) = self.sessions.read().await.get(session_id).cloned() else {
            return false;
        };

        {
            let mut guard = handle.lock().await;
            handle.close_locked(&mut guard);
        }
        self.remove_if_same(&handle).await;
        info!(session_id, "session evicted");
        true
    }

    async fn remove_if_same(&self, handle: &Arc<SessionHandle>) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&handle.session_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            sessions.remove(&handle.session_id);
        }
    }

    /// 清理超过 ttl 未活跃的会话，返回清理数量；正在处理消息的会话跳过
    pub async fn sweep(&self, ttl: Duration) -> usize {
        let candidates: Vec<Arc<SessionHandle>> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|h| h.is_expired(ttl))
            .cloned()
            .collect();

        let mut evicted = 0;
        for handle in candidates {
            let Ok(mut guard) = handle.memory.try_lock() else {
                debug!(session_id = %handle.session_id, "session busy, skipping sweep");
                continue;
            };
            // 拿到锁之后再确认一次（可能刚被使用）
            if !handle.is_expired(ttl) || handle.is_closed() {
                continue;
            }
            handle.close_locked(&mut guard);
            drop(guard);
            self.remove_if_same(&handle).await;
            evicted += 1;
        }

        if evicted > 0 {
            let remaining = self.len().await;
            info!(evicted, remaining, "expired sessions swept");
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 关闭全部会话（等待进行中的轮次结束），返回关闭数量
    pub async fn shutdown(&self) -> usize {
        let handles: Vec<Arc<SessionHandle>> = self.sessions.write().await.drain().map(|(_, h)| h).collect();
        for handle in &handles {
            let mut guard = handle.lock().await;
            handle.close_locked(&mut guard);
        }
        info!(closed = handles.len(), "session registry shut down");
        handles.len()
    }

    /// 启动后台清理任务，cancel 触发时退出
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, ttl: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即返回
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("session sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep(ttl).await;
                    }
                }
            }
        })
    }
}
