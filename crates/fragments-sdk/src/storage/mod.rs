//! 存储模块 - 离线缓存的数据持久化层
//!
//! 分层：
//! - KvStore: sled 数据库，按逻辑表划分 Tree
//! - LocalFragmentStore: fragment 元数据和内容缓存
//! - OfflineQueue: 离线期间记录的变更队列
//! - StorageManager: 打开数据库并组装以上组件，提供备份/恢复和统计

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

pub mod entities;
pub mod fragment_store;
pub mod kv;
pub mod queue;

pub use entities::*;
pub use fragment_store::{LocalFragmentStore, MemoryFragmentStore, PersistentFragmentStore};
pub use kv::{KvStats, KvStore};
pub use queue::{MemoryMutationQueue, OfflineQueue, PersistentMutationQueue};

/// 本地缓存统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub fragment_count: usize,
    pub content_count: usize,
    pub pending_mutations: usize,
    /// sled 占用的磁盘空间（字节），内存模式为 0
    pub storage_size: u64,
}

/// 存储管理器
///
/// 持有缓存和队列的共享句柄，同步引擎和 SDK 门面拿到的是同一组 `Arc`。
#[derive(Debug, Clone)]
pub struct StorageManager {
    base_path: Option<PathBuf>,
    kv: Option<KvStore>,
    fragments: Arc<dyn LocalFragmentStore>,
    queue: Arc<dyn OfflineQueue>,
}

impl StorageManager {
    /// 在 `base_path` 下打开持久化存储
    pub async fn open(base_path: &Path) -> Result<Self> {
        let kv = KvStore::open(base_path).await?;
        let fragments = PersistentFragmentStore::new(kv.clone())?;
        let queue = PersistentMutationQueue::new(kv.clone())?;
        info!("✅ 本地存储已打开: {}", base_path.display());
        Ok(Self {
            base_path: Some(base_path.to_path_buf()),
            kv: Some(kv),
            fragments: Arc::new(fragments),
            queue: Arc::new(queue),
        })
    }

    /// 纯内存存储，进程退出即丢失
    pub fn in_memory() -> Self {
        Self::with_backends(Arc::new(MemoryFragmentStore::new()), Arc::new(MemoryMutationQueue::new()))
    }

    /// 使用外部提供的缓存和队列实现
    pub fn with_backends(fragments: Arc<dyn LocalFragmentStore>, queue: Arc<dyn OfflineQueue>) -> Self {
        Self {
            base_path: None,
            kv: None,
            fragments,
            queue,
        }
    }

    pub fn base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }

    pub fn fragments(&self) -> Arc<dyn LocalFragmentStore> {
        self.fragments.clone()
    }

    pub fn queue(&self) -> Arc<dyn OfflineQueue> {
        self.queue.clone()
    }

    /// 导出缓存和队列的完整快照
    pub async fn export_snapshot(&self) -> Result<CacheSnapshot> {
        let (fragments, fragment_data) = self.fragments.export_entries().await?;
        let offline_queue = self.queue.drain().await?;
        Ok(CacheSnapshot {
            fragments,
            fragment_data,
            offline_queue,
        })
    }

    /// 导入快照：替换现有缓存和队列，队列条目保留原 sequence_id
    pub async fn import_snapshot(&self, snapshot: &CacheSnapshot) -> Result<()> {
        self.fragments
            .import_entries(&snapshot.fragments, &snapshot.fragment_data)
            .await?;
        self.queue.clear().await?;
        self.queue.restore(&snapshot.offline_queue).await?;
        info!(
            "快照已导入: {} 条元数据, {} 条内容, {} 条离线变更",
            snapshot.fragments.len(),
            snapshot.fragment_data.len(),
            snapshot.offline_queue.len()
        );
        Ok(())
    }

    /// 清空缓存和离线队列
    pub async fn clear_all(&self) -> Result<()> {
        self.fragments.clear().await?;
        self.queue.clear().await?;
        info!("本地缓存和离线队列已全部清空");
        Ok(())
    }

    /// 删除缓存时间早于 `retention` 的内容，返回删除条数
    pub async fn prune(&self, retention: Duration) -> Result<usize> {
        let removed = self.fragments.prune_content(retention).await?;
        if removed > 0 {
            info!("已清理 {} 条过期内容缓存", removed);
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let storage_size = match &self.kv {
            Some(kv) => kv.stats()?.storage_size,
            None => 0,
        };
        Ok(CacheStats {
            fragment_count: self.fragments.count().await?,
            content_count: self.fragments.content_count().await?,
            pending_mutations: self.queue.count().await?,
            storage_size,
        })
    }
}
