//! 内存检查点存储：每个线程一个只追加的版本列表

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{validate, Checkpoint, CheckpointStore, StoreError};
use crate::core::SessionState;

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    threads: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, thread_id: &str, state: &SessionState) -> Result<Checkpoint, StoreError> {
        validate(thread_id, state)?;
        let mut threads = self.threads.write().await;
        let versions = threads.entry(thread_id.to_string()).or_default();
        let seq = versions.last().map(|c| c.seq + 1).unwrap_or(1);
        let checkpoint = Checkpoint::new(thread_id, seq, state.clone());
        versions.push(checkpoint.clone());
        Ok(checkpoint)
    }

    async fn latest(&self, thread_id: &str) -> Result<Checkpoint, StoreError> {
        self.threads
            .read()
            .await
            .get(thread_id)
            .and_then(|v| v.last().cloned())
            .ok_or_else(|| StoreError::NotFound(thread_id.to_string()))
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_threads(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.threads.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::contract;

    #[tokio::test]
    async fn test_memory_store_contract() {
        contract::round_trip(&MemoryCheckpointStore::new()).await;
        contract::versions_are_append_only(&MemoryCheckpointStore::new()).await;
        contract::missing_thread(&MemoryCheckpointStore::new()).await;
        contract::rejects_inconsistent_state(&MemoryCheckpointStore::new()).await;
        contract::lists_threads(&MemoryCheckpointStore::new()).await;
    }
}
