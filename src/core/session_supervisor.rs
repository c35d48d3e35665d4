//! 会话监管：按线程串行化与取消
//!
//! 每个 thread_id 一把 tokio Mutex，同一线程的操作（用户输入、审批决定、继续）依次进行，不同线程互不阻塞。
//! 每个线程一个 CancellationToken，cancel 后当前在途推理立即返回，已持久化的检查点保持有效。
//! 挂起等待审批时不持有锁：操作直接返回。
//! 操作结束后调用 release，空闲线程的槽位被移除，槽位数只随在途线程数增长。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct ThreadSlot {
    lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

/// 线程级生命周期管理
#[derive(Debug, Default)]
pub struct SessionSupervisor {
    slots: RwLock<HashMap<String, ThreadSlot>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_handle(&self, thread_id: &str) -> Arc<Mutex<()>> {
        if let Some(slot) = self.slots.read().await.get(thread_id) {
            return slot.lock.clone();
        }
        self.slots
            .write()
            .await
            .entry(thread_id.to_string())
            .or_default()
            .lock
            .clone()
    }

    /// 获取线程的独占权；guard 释放前同线程的其它操作等待
    pub async fn lock(&self, thread_id: &str) -> OwnedMutexGuard<()> {
        self.lock_handle(thread_id).await.lock_owned().await
    }

    /// 为新操作取一个新的取消令牌（上一次 cancel 不影响之后的操作）
    pub async fn new_cancel_token(&self, thread_id: &str) -> CancellationToken {
        let mut slots = self.slots.write().await;
        let slot = slots.entry(thread_id.to_string()).or_default();
        if slot.cancel.is_cancelled() {
            slot.cancel = CancellationToken::new();
        }
        slot.cancel.clone()
    }

    /// 取消线程当前在途的操作；返回是否存在该线程
    pub async fn cancel(&self, thread_id: &str) -> bool {
        match self.slots.read().await.get(thread_id) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// 没有操作持有或等待该线程的锁时移除槽位；返回是否移除
    pub async fn release(&self, thread_id: &str) -> bool {
        let mut slots = self.slots.write().await;
        // map 自身持有一份 Arc；多出来的都是在途或排队的操作
        let idle = slots
            .get(thread_id)
            .is_some_and(|slot| Arc::strong_count(&slot.lock) == 1);
        if idle {
            slots.remove(thread_id);
            tracing::debug!(thread_id, "thread slot released");
        }
        idle
    }

    /// 当前持有槽位的线程数
    pub async fn thread_count(&self) -> usize {
        self.slots.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_thread_is_serialized() {
        let sup = Arc::new(SessionSupervisor::new());
        let guard = sup.lock("t").await;

        let sup2 = sup.clone();
        let waiter = tokio::spawn(async move {
            let _g = sup2.lock("t").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // 其它线程不受影响
        let _other = tokio::time::timeout(Duration::from_millis(100), sup.lock("u"))
            .await
            .expect("other thread should not block");

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_then_fresh_token() {
        let sup = SessionSupervisor::new();
        let token = sup.new_cancel_token("t").await;
        assert!(sup.cancel("t").await);
        assert!(token.is_cancelled());
        assert!(!sup.new_cancel_token("t").await.is_cancelled());
        assert!(!sup.cancel("missing").await);
    }

    #[tokio::test]
    async fn test_release_keeps_busy_slots() {
        let sup = SessionSupervisor::new();
        let guard = sup.lock("t").await;
        let _token = sup.new_cancel_token("t").await;
        assert!(!sup.release("t").await);
        assert_eq!(sup.thread_count().await, 1);

        drop(guard);
        assert!(sup.release("t").await);
        assert_eq!(sup.thread_count().await, 0);
        assert!(!sup.release("t").await);
        assert!(!sup.cancel("t").await);
    }
}
