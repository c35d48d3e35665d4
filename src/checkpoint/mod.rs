//! 检查点存储抽象层
//!
//! 每次可被外部观察的阶段转换都保存一个新版本（seq 单调递增），旧版本从不原地修改。
//! 内存实现（测试）、文件实现与 SQLite 实现（持久化）满足同一契约。

pub mod file;
pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CheckpointSection;
use crate::core::SessionState;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteCheckpointStore;

/// 检查点格式版本；读取到未知版本视为存储错误
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no checkpoint for thread '{0}'")]
    NotFound(String),

    /// 拒绝保存处于中间态的状态（如 AWAITING_APPROVAL 却没有待审批批次）
    #[error("refusing to save invalid state for thread '{thread_id}': {reason}")]
    Invalid { thread_id: String, reason: String },

    #[error("unsupported checkpoint format version {0}")]
    UnsupportedVersion(u32),

    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("checkpoint backend error: {0}")]
    Backend(String),
}

/// 不可变的会话快照
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub thread_id: String,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
}

impl Checkpoint {
    pub(crate) fn new(thread_id: &str, seq: u64, state: SessionState) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            thread_id: thread_id.to_string(),
            seq,
            created_at: Utc::now(),
            state,
        }
    }

    pub(crate) fn check_version(self) -> Result<Self, StoreError> {
        if self.format_version == CHECKPOINT_FORMAT_VERSION {
            Ok(self)
        } else {
            Err(StoreError::UnsupportedVersion(self.format_version))
        }
    }
}

/// 检查点存储接口
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 保存一个新版本并返回它
    async fn save(&self, thread_id: &str, state: &SessionState) -> Result<Checkpoint, StoreError>;

    /// 最新版本
    async fn latest(&self, thread_id: &str) -> Result<Checkpoint, StoreError>;

    /// 最新状态
    async fn load(&self, thread_id: &str) -> Result<SessionState, StoreError> {
        Ok(self.latest(thread_id).await?.state)
    }

    /// 全部版本，按 seq 升序
    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, StoreError>;

    /// 已有检查点的线程 ID（排序）
    async fn list_threads(&self) -> Result<Vec<String>, StoreError>;
}

/// 保存前的统一校验：thread_id 一致、phase 与 pending_batch 一致
pub(crate) fn validate(thread_id: &str, state: &SessionState) -> Result<(), StoreError> {
    if state.thread_id != thread_id {
        return Err(StoreError::Invalid {
            thread_id: thread_id.to_string(),
            reason: format!("state belongs to thread '{}'", state.thread_id),
        });
    }
    if !state.is_consistent() {
        return Err(StoreError::Invalid {
            thread_id: thread_id.to_string(),
            reason: format!("phase {} does not match pending batch", state.phase),
        });
    }
    Ok(())
}

/// 按配置创建检查点存储
///
/// backend 为 file / sqlite 且能打开时使用持久化存储；否则回退到内存存储并记录警告
pub async fn create_checkpoint_store(cfg: &CheckpointSection) -> Arc<dyn CheckpointStore> {
    match cfg.backend.to_lowercase().as_str() {
        "file" => match FileCheckpointStore::open(&cfg.path).await {
            Ok(store) => {
                tracing::info!("Using file checkpoint store: {:?}", cfg.path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open file checkpoint store, falling back to memory: {}", e);
            }
        },
        #[cfg(feature = "async-sqlite")]
        "sqlite" => match SqliteCheckpointStore::open(&cfg.path).await {
            Ok(store) => {
                tracing::info!("Using sqlite checkpoint store: {:?}", cfg.path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open sqlite checkpoint store, falling back to memory: {}", e);
            }
        },
        #[cfg(not(feature = "async-sqlite"))]
        "sqlite" => {
            tracing::warn!("sqlite checkpoint store requested but async-sqlite feature not enabled, using memory store");
        }
        "memory" => {}
        other => {
            tracing::warn!("Unknown checkpoint backend '{}', using memory store", other);
        }
    }

    tracing::info!("Using in-memory checkpoint store");
    Arc::new(MemoryCheckpointStore::new())
}

/// 各实现共用的契约测试
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use crate::core::{PendingBatch, Phase};
    use crate::memory::{Message, ToolCallRequest};

    fn awaiting(thread_id: &str) -> SessionState {
        let call = ToolCallRequest::new("c1", "scale_k8s_deployment", serde_json::json!({"replicas": 3}));
        let mut state = SessionState::new(thread_id);
        state.messages.push(Message::user("scale up checkout"));
        state
            .messages
            .push(Message::assistant_with_calls("", vec![call.clone()]));
        state.phase = Phase::AwaitingApproval;
        state.pending_batch = Some(PendingBatch::new(vec![call]));
        state
    }

    pub async fn round_trip(store: &dyn CheckpointStore) {
        let state = awaiting("thread/α 1");
        let cp = store.save("thread/α 1", &state).await.unwrap();
        assert_eq!(cp.seq, 1);
        let loaded = store.load("thread/α 1").await.unwrap();
        assert_eq!(loaded, state);
    }

    pub async fn versions_are_append_only(store: &dyn CheckpointStore) {
        let mut state = SessionState::new("t1");
        state.messages.push(Message::user("hi"));
        let first = store.save("t1", &state).await.unwrap();
        state.messages.push(Message::assistant("hello"));
        state.phase = Phase::Done;
        let second = store.save("t1", &state).await.unwrap();
        assert!(second.seq > first.seq);

        let history = store.history("t1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].state.messages.len(), 1);
        assert_eq!(history[1].state.phase, Phase::Done);
        assert_eq!(store.latest("t1").await.unwrap().seq, second.seq);
    }

    pub async fn missing_thread(store: &dyn CheckpointStore) {
        assert!(matches!(store.load("ghost").await, Err(StoreError::NotFound(_))));
        assert!(store.history("ghost").await.unwrap().is_empty());
    }

    pub async fn rejects_inconsistent_state(store: &dyn CheckpointStore) {
        let mut state = awaiting("bad");
        state.pending_batch = None;
        assert!(matches!(
            store.save("bad", &state).await,
            Err(StoreError::Invalid { .. })
        ));
        assert!(matches!(
            store.save("other", &awaiting("bad")).await,
            Err(StoreError::Invalid { .. })
        ));
        assert!(matches!(store.load("bad").await, Err(StoreError::NotFound(_))));
    }

    pub async fn lists_threads(store: &dyn CheckpointStore) {
        store.save("b", &SessionState::new("b")).await.unwrap();
        store.save("a", &SessionState::new("a")).await.unwrap();
        store.save("a", &SessionState::new("a")).await.unwrap();
        assert_eq!(store.list_threads().await.unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
