//! 异步 SQLite 持久化
//!
//! 使用 sqlx 提供完全异步的数据库操作，避免在 async 上下文中阻塞。
//! 需要启用 `async-sqlite` feature。

#[cfg(feature = "async-sqlite")]
mod sqlx_impl {
    use std::path::Path;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
    use sqlx::Row;

    use crate::core::PersistenceError;
    use crate::memory::{MemoryPersistence, Role, SessionRecord, Summary, Turn};

    fn db_err(e: sqlx::Error) -> PersistenceError {
        PersistenceError::Database(e.to_string())
    }

    fn parse_time(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }

    /// 异步 SQLite 持久化
    pub struct SqlitePersistence {
        pool: SqlitePool,
    }

    impl SqlitePersistence {
        /// 打开（或创建）数据库文件并初始化表
        pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
            if let Some(parent) = db_path.as_ref().parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&db_url)
                .await
                .map_err(db_err)?;

            let persistence = Self { pool };
            persistence.init_tables().await.map_err(db_err)?;

            Ok(persistence)
        }

        /// 从连接池创建
        pub fn from_pool(pool: SqlitePool) -> Self {
            Self { pool }
        }

        /// 初始化数据库表
        async fn init_tables(&self) -> Result<(), sqlx::Error> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    character_id TEXT NOT NULL,
                    player_id TEXT NOT NULL,
                    total_turn_count INTEGER NOT NULL,
                    next_seq INTEGER NOT NULL,
                    exchanges_at_last_summary INTEGER NOT NULL,
                    updated_at TEXT NOT NULL
                )",
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS turns (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    role TEXT NOT NULL,
                    text TEXT NOT NULL,
                    created_at TEXT NOT NULL
                )",
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS summaries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    start_seq INTEGER NOT NULL,
                    end_seq INTEGER NOT NULL,
                    text TEXT NOT NULL,
                    exchange_count INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                )",
            )
            .execute(&self.pool)
            .await?;

            sqlx::query("CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id, seq)")
                .execute(&self.pool)
                .await?;

            sqlx::query("CREATE INDEX IF NOT EXISTS idx_summaries_session ON summaries(session_id)")
                .execute(&self.pool)
                .await?;

            Ok(())
        }

        fn turn_from_row(row: &SqliteRow) -> Turn {
            let role: String = row.get("role");
            let seq: i64 = row.get("seq");
            let created_at: String = row.get("created_at");
            Turn {
                role: Role::parse(&role).unwrap_or(Role::User),
                text: row.get("text"),
                timestamp: parse_time(&created_at),
                session_id: row.get("session_id"),
                seq: seq as u64,
            }
        }
    }

    #[async_trait]
    impl MemoryPersistence for SqlitePersistence {
        async fn save_record(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
            sqlx::query(
                "INSERT OR REPLACE INTO sessions
                    (id, character_id, player_id, total_turn_count, next_seq, exchanges_at_last_summary, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.session_id)
            .bind(&record.character_id)
            .bind(&record.player_id)
            .bind(record.total_turn_count as i64)
            .bind(record.next_seq as i64)
            .bind(record.exchanges_at_last_summary as i64)
            .bind(record.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            Ok(())
        }

        async fn load_record(&self, session_id: &str) -> Result<Option<SessionRecord>, PersistenceError> {
            let row = sqlx::query(
                "SELECT id, character_id, player_id, total_turn_count, next_seq, exchanges_at_last_summary, updated_at
                 FROM sessions WHERE id = ?",
            )
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            Ok(row.map(|row| {
                let total: i64 = row.get("total_turn_count");
                let next_seq: i64 = row.get("next_seq");
                let at_summary: i64 = row.get("exchanges_at_last_summary");
                let updated_at: String = row.get("updated_at");
                SessionRecord {
                    session_id: row.get("id"),
                    character_id: row.get("character_id"),
                    player_id: row.get("player_id"),
                    total_turn_count: total as u64,
                    next_seq: next_seq as u64,
                    exchanges_at_last_summary: at_summary as u64,
                    updated_at: parse_time(&updated_at),
                }
            }))
        }

        async fn append_turn(&self, turn: &Turn) -> Result<(), PersistenceError> {
            sqlx::query(
                "INSERT INTO turns (session_id, seq, role, text, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&turn.session_id)
            .bind(turn.seq as i64)
            .bind(turn.role.as_str())
            .bind(&turn.text)
            .bind(turn.timestamp.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            Ok(())
        }

        async fn load_turns(&self, session_id: &str, from_seq: u64) -> Result<Vec<Turn>, PersistenceError> {
            let rows = sqlx::query(
                "SELECT session_id, seq, role, text, created_at FROM turns
                 WHERE session_id = ? AND seq >= ? ORDER BY seq ASC",
            )
            .bind(session_id)
            .bind(from_seq as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            Ok(rows.iter().map(Self::turn_from_row).collect())
        }

        async fn save_summary(&self, summary: &Summary) -> Result<(), PersistenceError> {
            sqlx::query(
                "INSERT INTO summaries (session_id, start_seq, end_seq, text, exchange_count, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&summary.session_id)
            .bind(summary.covers_turns.0 as i64)
            .bind(summary.covers_turns.1 as i64)
            .bind(&summary.text)
            .bind(summary.exchange_count as i64)
            .bind(summary.created_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            Ok(())
        }

        async fn load_summaries(&self, session_id: &str) -> Result<Vec<Summary>, PersistenceError> {
            let rows = sqlx::query(
                "SELECT session_id, start_seq, end_seq, text, exchange_count, created_at
                 FROM summaries WHERE session_id = ? ORDER BY id ASC",
            )
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            Ok(rows
                .into_iter()
                .map(|row| {
                    let start: i64 = row.get("start_seq");
                    let end: i64 = row.get("end_seq");
                    let exchanges: i64 = row.get("exchange_count");
                    let created_at: String = row.get("created_at");
                    Summary {
                        session_id: row.get("session_id"),
                        covers_turns: (start as u64, end as u64),
                        text: row.get("text"),
                        created_at: parse_time(&created_at),
                        exchange_count: exchanges as u64,
                    }
                })
                .collect())
        }

        async fn clear(&self, session_id: &str, keep_summaries: bool) -> Result<(), PersistenceError> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;

            sqlx::query("DELETE FROM turns WHERE session_id = ?")
                .bind(session_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

            if !keep_summaries {
                sqlx::query("DELETE FROM summaries WHERE session_id = ?")
                    .bind(session_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }

            tx.commit().await.map_err(db_err)?;
            Ok(())
        }

        fn name(&self) -> &str {
            "sqlite"
        }
    }

}

#[cfg(feature = "async-sqlite")]
pub use sqlx_impl::SqlitePersistence;
