//! 离线变更队列
//!
//! 离线期间记录的 create/update/delete 按 sequence_id 追加，
//! 恢复连接后由同步引擎按 sequence_id 升序逐条回放。
//! 条目只有在对应的远端调用成功后才会被删除。

use std::collections::BTreeMap;
use std::fmt::Debug;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{FragmentsSDKError, Result};
use crate::storage::entities::{MutationAction, PendingMutation};
use crate::storage::kv::{self, trees, KvStore};

#[async_trait::async_trait]
pub trait OfflineQueue: Debug + Send + Sync {
    /// 追加一条变更，返回分配的 sequence_id
    ///
    /// 持久化失败时返回 `Storage` 错误，绝不静默丢弃。
    async fn enqueue(&self, action: MutationAction) -> Result<u64>;
    /// 读取全部条目（不删除），按 sequence_id 升序
    async fn drain(&self) -> Result<Vec<PendingMutation>>;
    async fn remove(&self, sequence_id: u64) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn count(&self) -> Result<usize>;
    /// 记录一次回放失败，返回累计失败次数
    async fn record_failure(&self, sequence_id: u64, error: &str) -> Result<u32>;
    /// 把排队中指向 `old_id` 的 update/delete 改为指向 `new_id`，返回修改条数
    async fn retarget(&self, old_id: &str, new_id: &str) -> Result<usize>;
    /// 原样写回一批条目（恢复备份用），保留原 sequence_id
    async fn restore(&self, entries: &[PendingMutation]) -> Result<()>;
}

/// 基于内存的队列实现
#[derive(Debug, Default)]
pub struct MemoryMutationQueue {
    inner: Mutex<MemoryQueueInner>,
}

#[derive(Debug, Default)]
struct MemoryQueueInner {
    next_sequence: u64,
    entries: BTreeMap<u64, PendingMutation>,
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl OfflineQueue for MemoryMutationQueue {
    async fn enqueue(&self, action: MutationAction) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.next_sequence += 1;
        let sequence_id = inner.next_sequence;
        inner.entries.insert(sequence_id, PendingMutation::new(sequence_id, action));
        debug!("变更已加入内存队列: seq={}, 当前队列大小: {}", sequence_id, inner.entries.len());
        Ok(sequence_id)
    }

    async fn drain(&self) -> Result<Vec<PendingMutation>> {
        Ok(self.inner.lock().entries.values().cloned().collect())
    }

    async fn remove(&self, sequence_id: u64) -> Result<()> {
        self.inner.lock().entries.remove(&sequence_id);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.inner.lock().entries.clear();
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.inner.lock().entries.len())
    }

    async fn record_failure(&self, sequence_id: u64, error: &str) -> Result<u32> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(&sequence_id)
            .ok_or_else(|| FragmentsSDKError::NotFound(format!("队列条目不存在: {}", sequence_id)))?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        Ok(entry.attempts)
    }

    async fn retarget(&self, old_id: &str, new_id: &str) -> Result<usize> {
        let mut inner = self.inner.lock();
        let mut changed = 0usize;
        for entry in inner.entries.values_mut() {
            if entry.action.retarget(old_id, new_id) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn restore(&self, entries: &[PendingMutation]) -> Result<()> {
        let mut inner = self.inner.lock();
        for entry in entries {
            inner.next_sequence = inner.next_sequence.max(entry.sequence_id);
            inner.entries.insert(entry.sequence_id, entry.clone());
        }
        Ok(())
    }
}

/// 持久化队列实现
///
/// key 为 sequence_id 的大端字节，sled 按字节序遍历即为 sequence_id 升序；
/// sequence_id 来自 sled 的单调 ID 生成器，重启后仍然递增。
#[derive(Debug)]
pub struct PersistentMutationQueue {
    kv: KvStore,
    tree: sled::Tree,
    /// 分配 sequence_id 和写入必须一起完成
    append_lock: Mutex<()>,
}

impl PersistentMutationQueue {
    pub fn new(kv: KvStore) -> Result<Self> {
        let tree = kv.tree(trees::OFFLINE_QUEUE)?;
        Ok(Self {
            kv,
            tree,
            append_lock: Mutex::new(()),
        })
    }

    fn key(sequence_id: u64) -> [u8; 8] {
        sequence_id.to_be_bytes()
    }

    fn decode_key(key: &[u8]) -> Result<u64> {
        let raw: [u8; 8] = key
            .try_into()
            .map_err(|_| FragmentsSDKError::Storage(format!("队列 key 长度异常: {}", key.len())))?;
        Ok(u64::from_be_bytes(raw))
    }

    fn load(&self, sequence_id: u64) -> Result<PendingMutation> {
        kv::get_bin(&self.tree, Self::key(sequence_id))?
            .ok_or_else(|| FragmentsSDKError::NotFound(format!("队列条目不存在: {}", sequence_id)))
    }

    async fn persist(&self, entry: &PendingMutation) -> Result<()> {
        kv::set_bin(&self.tree, Self::key(entry.sequence_id), entry)
            .map_err(|e| FragmentsSDKError::Storage(format!("持久化离线变更失败: {}", e)))?;
        self.kv.flush().await
    }
}

#[async_trait::async_trait]
impl OfflineQueue for PersistentMutationQueue {
    async fn enqueue(&self, action: MutationAction) -> Result<u64> {
        let entry = {
            let _guard = self.append_lock.lock();
            // sled 的 ID 从 0 开始，这里统一 +1；恢复备份后还要排在已有最大值之后
            let generated = self.kv.generate_id()? + 1;
            let sequence_id = match self.tree.last()? {
                Some((key, _)) => generated.max(Self::decode_key(&key)? + 1),
                None => generated,
            };
            let entry = PendingMutation::new(sequence_id, action);
            kv::set_bin(&self.tree, Self::key(sequence_id), &entry)
                .map_err(|e| FragmentsSDKError::Storage(format!("持久化离线变更失败: {}", e)))?;
            entry
        };
        if let Err(e) = self.kv.flush().await {
            // 调用方会收到失败，条目不能留到下次回放
            warn!("离线变更刷盘失败，撤销入队: seq={}, error={}", entry.sequence_id, e);
            self.tree.remove(Self::key(entry.sequence_id))?;
            return Err(e);
        }
        info!("离线变更已入队: seq={}, action={}", entry.sequence_id, entry.kind());
        Ok(entry.sequence_id)
    }

    async fn drain(&self) -> Result<Vec<PendingMutation>> {
        let mut entries: Vec<PendingMutation> = kv::scan_bin::<PendingMutation>(&self.tree)?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect();
        // 大端 key 已经有序，这里再排一次，不依赖存储层遍历顺序
        entries.sort_by_key(|entry| entry.sequence_id);
        Ok(entries)
    }

    async fn remove(&self, sequence_id: u64) -> Result<()> {
        self.tree.remove(Self::key(sequence_id))?;
        self.kv.flush().await
    }

    async fn clear(&self) -> Result<()> {
        self.tree.clear()?;
        self.kv.flush().await?;
        info!("离线队列已清空");
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.tree.len())
    }

    async fn record_failure(&self, sequence_id: u64, error: &str) -> Result<u32> {
        let mut entry = self.load(sequence_id)?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        self.persist(&entry).await?;
        Ok(entry.attempts)
    }

    async fn retarget(&self, old_id: &str, new_id: &str) -> Result<usize> {
        let mut changed = 0usize;
        for mut entry in self.drain().await? {
            if entry.action.retarget(old_id, new_id) {
                kv::set_bin(&self.tree, Self::key(entry.sequence_id), &entry)?;
                changed += 1;
            }
        }
        if changed > 0 {
            self.kv.flush().await?;
            debug!("队列中 {} 条变更已改指向 {} -> {}", changed, old_id, new_id);
        }
        Ok(changed)
    }

    async fn restore(&self, entries: &[PendingMutation]) -> Result<()> {
        for entry in entries {
            kv::set_bin(&self.tree, Self::key(entry.sequence_id), entry)?;
        }
        self.kv.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn create(content: &str) -> MutationAction {
        MutationAction::Create {
            local_id: crate::storage::entities::new_local_id(),
            content_type: "text/plain".to_string(),
            content: content.as_bytes().to_vec(),
        }
    }

    fn delete(id: &str) -> MutationAction {
        MutationAction::Delete {
            fragment_id: id.to_string(),
        }
    }

    async fn persistent(dir: &TempDir) -> PersistentMutationQueue {
        PersistentMutationQueue::new(KvStore::open(dir.path()).await.unwrap()).unwrap()
    }

    async fn exercise_ordering(queue: Arc<dyn OfflineQueue>) {
        let mut issued = Vec::new();
        for i in 0..20 {
            let action = if i % 3 == 0 { delete(&format!("f{}", i)) } else { create(&i.to_string()) };
            issued.push(queue.enqueue(action).await.unwrap());
        }
        assert!(issued.windows(2).all(|w| w[0] < w[1]));

        // 删掉中间若干条后顺序不变
        queue.remove(issued[4]).await.unwrap();
        queue.remove(issued[11]).await.unwrap();

        let drained = queue.drain().await.unwrap();
        assert_eq!(drained.len(), 18);
        assert!(drained.windows(2).all(|w| w[0].sequence_id < w[1].sequence_id));
        // drain 只读不删
        assert_eq!(queue.count().await.unwrap(), 18);

        queue.clear().await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_queue_drain_order() {
        exercise_ordering(Arc::new(MemoryMutationQueue::new())).await;
    }

    #[tokio::test]
    async fn test_persistent_queue_drain_order() {
        let dir = TempDir::new().unwrap();
        exercise_ordering(Arc::new(persistent(&dir).await)).await;
    }

    #[tokio::test]
    async fn test_drain_sorts_restored_entries() {
        let queue = MemoryMutationQueue::new();
        let entries: Vec<PendingMutation> = [30u64, 10, 20]
            .iter()
            .map(|&seq| PendingMutation::new(seq, delete(&format!("f{}", seq))))
            .collect();
        queue.restore(&entries).await.unwrap();

        let seqs: Vec<u64> = queue.drain().await.unwrap().iter().map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![10, 20, 30]);
        // 新条目排在恢复条目之后
        assert!(queue.enqueue(delete("x")).await.unwrap() > 30);
    }

    #[tokio::test]
    async fn test_persistent_queue_survives_restart() {
        let dir = TempDir::new().unwrap();
        let (first, second) = {
            let queue = persistent(&dir).await;
            let a = queue.enqueue(create("a")).await.unwrap();
            let b = queue.enqueue(delete("X")).await.unwrap();
            (a, b)
        };

        let queue = persistent(&dir).await;
        let drained = queue.drain().await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].sequence_id, first);
        assert_eq!(drained[1].sequence_id, second);
        assert!(matches!(drained[1].action, MutationAction::Delete { .. }));

        let third = queue.enqueue(create("c")).await.unwrap();
        assert!(third > second);
    }

    #[tokio::test]
    async fn test_record_failure_and_retarget() {
        let dir = TempDir::new().unwrap();
        let queue = persistent(&dir).await;
        let seq = queue
            .enqueue(MutationAction::Update {
                fragment_id: "local-1".to_string(),
                content: b"new".to_vec(),
                target_type: "text/plain".to_string(),
            })
            .await
            .unwrap();
        queue.enqueue(delete("local-1")).await.unwrap();
        queue.enqueue(delete("other")).await.unwrap();

        assert_eq!(queue.record_failure(seq, "timeout").await.unwrap(), 1);
        assert_eq!(queue.record_failure(seq, "timeout again").await.unwrap(), 2);

        assert_eq!(queue.retarget("local-1", "srv-9").await.unwrap(), 2);
        let drained = queue.drain().await.unwrap();
        assert_eq!(drained[0].action.fragment_id(), "srv-9");
        assert_eq!(drained[0].attempts, 2);
        assert_eq!(drained[0].last_error.as_deref(), Some("timeout again"));
        assert_eq!(drained[1].action.fragment_id(), "srv-9");
        assert_eq!(drained[2].action.fragment_id(), "other");

        assert!(queue.record_failure(9999, "missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failed_flush_does_not_leave_entry_behind() {
        let dir = TempDir::new().unwrap();
        let kv = KvStore::open(dir.path()).await.unwrap();
        let queue = PersistentMutationQueue::new(kv.clone()).unwrap();

        kv.fail_flushes(true);
        let err = assert_err!(queue.enqueue(create("lost")).await);
        assert!(matches!(err, FragmentsSDKError::Storage(_)));
        assert_eq!(assert_ok!(queue.count().await), 0);
        assert!(assert_ok!(queue.drain().await).is_empty());

        kv.fail_flushes(false);
        let seq = assert_ok!(queue.enqueue(create("kept")).await);
        let drained = assert_ok!(queue.drain().await);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].sequence_id, seq);
    }

    #[tokio::test]
    async fn test_memory_queue_retarget() {
        let queue = MemoryMutationQueue::new();
        queue.enqueue(delete("local-1")).await.unwrap();
        queue.enqueue(create("a")).await.unwrap();
        queue.enqueue(delete("other")).await.unwrap();

        assert_eq!(queue.retarget("local-1", "srv-1").await.unwrap(), 1);
        let ids: Vec<String> = queue
            .drain()
            .await
            .unwrap()
            .iter()
            .map(|entry| entry.action.fragment_id().to_string())
            .collect();
        assert_eq!(ids[0], "srv-1");
        assert_eq!(ids[2], "other");
        assert_eq!(queue.retarget("local-1", "srv-1").await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enqueue_assigns_unique_sequence_ids() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(persistent(&dir).await);
        // 先恢复一条大序号的条目，新条目都要排在它后面
        assert_ok!(queue.restore(&[PendingMutation::new(500, delete("restored"))]).await);

        let tasks = (0..16).map(|i| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(delete(&format!("f{}", i))).await })
        });
        let mut seqs = Vec::new();
        for joined in join_all(tasks).await {
            seqs.push(assert_ok!(joined.unwrap()));
        }
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), 16);
        assert!(seqs[0] > 500);
        assert_eq!(assert_ok!(queue.count().await), 17);
        assert_err!(queue.record_failure(1, "missing").await);
    }
}
