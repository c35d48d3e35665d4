//! SQLite 检查点存储（需开启 async-sqlite feature）
//!
//! 每个版本一行，(thread_id, seq) 为主键；seq 在事务内分配。

#![cfg(feature = "async-sqlite")]

use std::path::Path;

use async_trait::async_trait;
use sqlx::Row;

use super::{validate, Checkpoint, CheckpointStore, StoreError};
use crate::core::SessionState;

pub struct SqliteCheckpointStore {
    pool: sqlx::sqlite::SqlitePool,
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl SqliteCheckpointStore {
    /// 打开（必要时创建）数据库文件
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        Self::connect(&url, 5).await
    }

    /// 进程内数据库（测试用）
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(backend)?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                format_version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                state TEXT NOT NULL,
                PRIMARY KEY (thread_id, seq)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    fn row_to_checkpoint(row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint, StoreError> {
        let thread_id: String = row.get("thread_id");
        let seq: i64 = row.get("seq");
        let format_version: i64 = row.get("format_version");
        let created_at: String = row.get("created_at");
        let state: String = row.get("state");
        let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| StoreError::Backend(format!("bad created_at: {}", e)))?
            .with_timezone(&chrono::Utc);
        Checkpoint {
            format_version: format_version as u32,
            thread_id,
            seq: seq as u64,
            created_at,
            state: serde_json::from_str(&state)?,
        }
        .check_version()
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, thread_id: &str, state: &SessionState) -> Result<Checkpoint, StoreError> {
        validate(thread_id, state)?;
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints WHERE thread_id = ?",
        )
        .bind(thread_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;

        let checkpoint = Checkpoint::new(thread_id, next as u64, state.clone());
        sqlx::query(
            "INSERT INTO checkpoints (thread_id, seq, format_version, created_at, state)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(thread_id)
        .bind(next)
        .bind(checkpoint.format_version as i64)
        .bind(checkpoint.created_at.to_rfc3339())
        .bind(serde_json::to_string(&checkpoint.state)?)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(checkpoint)
    }

    async fn latest(&self, thread_id: &str) -> Result<Checkpoint, StoreError> {
        let row = sqlx::query(
            "SELECT thread_id, seq, format_version, created_at, state
             FROM checkpoints WHERE thread_id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        match row {
            Some(row) => Self::row_to_checkpoint(&row),
            None => Err(StoreError::NotFound(thread_id.to_string())),
        }
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let rows = sqlx::query(
            "SELECT thread_id, seq, format_version, created_at, state
             FROM checkpoints WHERE thread_id = ? ORDER BY seq ASC",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(Self::row_to_checkpoint).collect()
    }

    async fn list_threads(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT thread_id FROM checkpoints ORDER BY thread_id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.iter().map(|r| r.get::<String, _>("thread_id")).collect())
    }
}
