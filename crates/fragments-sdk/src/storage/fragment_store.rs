//! 本地 Fragment 缓存
//!
//! 元数据和内容分两张表存放，列表只读元数据，不会加载大块内容。
//! 只是服务器数据的读穿缓存，不是权威源，也不访问网络。

use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::time::Duration;

use chrono::Utc;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{FragmentsSDKError, Result};
use crate::storage::entities::{CachedContent, FragmentData, FragmentMetadata};
use crate::storage::kv::{self, trees, KvStore};

/// 本地 Fragment 存储契约
///
/// 所有写操作幂等：同一 id 重复 `put` 直接覆盖。
#[async_trait::async_trait]
pub trait LocalFragmentStore: Debug + Send + Sync {
    async fn put(&self, fragment: &FragmentMetadata) -> Result<()>;
    async fn put_content(&self, id: &str, data: &FragmentData) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<FragmentMetadata>>;
    async fn get_content(&self, id: &str) -> Result<Option<FragmentData>>;
    /// 列出缓存的元数据，可按 owner 过滤
    async fn list(&self, owner_filter: Option<&str>) -> Result<Vec<FragmentMetadata>>;
    /// 同时删除元数据和内容
    async fn remove(&self, id: &str) -> Result<()>;
    /// 原子替换全部元数据；不在新集合中的 id 对应的内容一并删除
    async fn replace_all(&self, fragments: &[FragmentMetadata]) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn count(&self) -> Result<usize>;
    async fn content_count(&self) -> Result<usize>;
    /// 删除缓存时间早于 `older_than` 之前的内容，返回删除条数
    async fn prune_content(&self, older_than: Duration) -> Result<usize>;
    async fn export_entries(&self) -> Result<(Vec<FragmentMetadata>, Vec<(String, CachedContent)>)>;
    /// 清空后导入，读者看不到中间状态
    async fn import_entries(
        &self,
        fragments: &[FragmentMetadata],
        contents: &[(String, CachedContent)],
    ) -> Result<()>;
}

fn cutoff_millis(older_than: Duration) -> i64 {
    let older_than = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
    Utc::now().timestamp_millis().saturating_sub(older_than)
}

fn owner_matches(fragment: &FragmentMetadata, owner_filter: Option<&str>) -> bool {
    owner_filter.map_or(true, |owner| fragment.owner_id == owner)
}

/// 基于 sled 的持久化实现
#[derive(Debug)]
pub struct PersistentFragmentStore {
    kv: KvStore,
    fragments: sled::Tree,
    fragment_data: sled::Tree,
}

impl PersistentFragmentStore {
    pub fn new(kv: KvStore) -> Result<Self> {
        let fragments = kv.tree(trees::FRAGMENTS)?;
        let fragment_data = kv.tree(trees::FRAGMENT_DATA)?;
        Ok(Self {
            kv,
            fragments,
            fragment_data,
        })
    }

    async fn flush(&self) -> Result<()> {
        self.kv.flush().await
    }

    fn encode_json<V: serde::Serialize>(value: &V) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| FragmentsSDKError::Serialization(format!("序列化元数据失败: {}", e)))
    }

    /// 在两张表上执行同一个事务
    fn transact<F>(&self, f: F) -> Result<()>
    where
        F: Fn(
            &sled::transaction::TransactionalTree,
            &sled::transaction::TransactionalTree,
        ) -> std::result::Result<(), ConflictableTransactionError<FragmentsSDKError>>,
    {
        (&self.fragments, &self.fragment_data)
            .transaction(|(meta, data)| f(meta, data))
            .map_err(|e| match e {
                TransactionError::Abort(inner) => inner,
                TransactionError::Storage(inner) => FragmentsSDKError::Storage(inner.to_string()),
            })
    }
}

#[async_trait::async_trait]
impl LocalFragmentStore for PersistentFragmentStore {
    async fn put(&self, fragment: &FragmentMetadata) -> Result<()> {
        kv::set_json(&self.fragments, fragment.id.as_bytes(), fragment)?;
        self.flush().await
    }

    async fn put_content(&self, id: &str, data: &FragmentData) -> Result<()> {
        kv::set_bin(&self.fragment_data, id.as_bytes(), &CachedContent::from_data(data))?;
        self.flush().await
    }

    async fn get(&self, id: &str) -> Result<Option<FragmentMetadata>> {
        kv::get_json(&self.fragments, id.as_bytes())
    }

    async fn get_content(&self, id: &str) -> Result<Option<FragmentData>> {
        let cached: Option<CachedContent> = kv::get_bin(&self.fragment_data, id.as_bytes())?;
        Ok(cached.map(CachedContent::into_data))
    }

    async fn list(&self, owner_filter: Option<&str>) -> Result<Vec<FragmentMetadata>> {
        Ok(kv::scan_json::<FragmentMetadata>(&self.fragments)?
            .into_iter()
            .map(|(_, fragment)| fragment)
            .filter(|fragment| owner_matches(fragment, owner_filter))
            .collect())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let key = id.as_bytes().to_vec();
        self.transact(|meta, data| {
            meta.remove(key.as_slice())?;
            data.remove(key.as_slice())?;
            Ok(())
        })?;
        self.flush().await
    }

    async fn replace_all(&self, fragments: &[FragmentMetadata]) -> Result<()> {
        // 事务里不能遍历，先在外面收集现有 key；单写者前提下不会和其他写入交错
        let keep: HashSet<&[u8]> = fragments.iter().map(|f| f.id.as_bytes()).collect();
        let mut stale_meta = Vec::new();
        for key in self.fragments.iter().keys() {
            let key = key?;
            if !keep.contains(&key[..]) {
                stale_meta.push(key);
            }
        }
        let mut stale_data = Vec::new();
        for key in self.fragment_data.iter().keys() {
            let key = key?;
            if !keep.contains(&key[..]) {
                stale_data.push(key);
            }
        }
        let encoded = fragments
            .iter()
            .map(|f| Ok((f.id.as_bytes().to_vec(), Self::encode_json(f)?)))
            .collect::<Result<Vec<_>>>()?;

        self.transact(|meta, data| {
            for key in &stale_meta {
                meta.remove(key.clone())?;
            }
            for key in &stale_data {
                data.remove(key.clone())?;
            }
            for (key, value) in &encoded {
                meta.insert(key.as_slice(), value.as_slice())?;
            }
            Ok(())
        })?;
        self.flush().await?;

        debug!(
            "本地缓存已替换: {} 条元数据，移除 {} 条过期元数据 / {} 条内容",
            fragments.len(),
            stale_meta.len(),
            stale_data.len()
        );
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.fragments.clear()?;
        self.fragment_data.clear()?;
        self.flush().await
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.fragments.len())
    }

    async fn content_count(&self) -> Result<usize> {
        Ok(self.fragment_data.len())
    }

    async fn prune_content(&self, older_than: Duration) -> Result<usize> {
        let cutoff = cutoff_millis(older_than);
        let mut removed = 0usize;
        for (key, cached) in kv::scan_bin::<CachedContent>(&self.fragment_data)? {
            if cached.cached_at < cutoff {
                self.fragment_data.remove(key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            self.flush().await?;
            info!("已清理 {} 条过期的 fragment 内容缓存", removed);
        }
        Ok(removed)
    }

    async fn export_entries(&self) -> Result<(Vec<FragmentMetadata>, Vec<(String, CachedContent)>)> {
        let fragments = self.list(None).await?;
        let contents = kv::scan_bin::<CachedContent>(&self.fragment_data)?
            .into_iter()
            .map(|(key, cached)| (String::from_utf8_lossy(&key).into_owned(), cached))
            .collect();
        Ok((fragments, contents))
    }

    async fn import_entries(
        &self,
        fragments: &[FragmentMetadata],
        contents: &[(String, CachedContent)],
    ) -> Result<()> {
        let old_meta = self.fragments.iter().keys().collect::<std::result::Result<Vec<_>, _>>()?;
        let old_data = self.fragment_data.iter().keys().collect::<std::result::Result<Vec<_>, _>>()?;
        let new_meta = fragments
            .iter()
            .map(|f| Ok((f.id.as_bytes().to_vec(), Self::encode_json(f)?)))
            .collect::<Result<Vec<_>>>()?;
        let new_data = contents
            .iter()
            .map(|(id, cached)| Ok((id.as_bytes().to_vec(), bincode::serialize(cached)?)))
            .collect::<Result<Vec<_>>>()?;

        self.transact(|meta, data| {
            for key in &old_meta {
                meta.remove(key.clone())?;
            }
            for key in &old_data {
                data.remove(key.clone())?;
            }
            for (key, value) in &new_meta {
                meta.insert(key.as_slice(), value.as_slice())?;
            }
            for (key, value) in &new_data {
                data.insert(key.as_slice(), value.as_slice())?;
            }
            Ok(())
        })?;
        self.flush().await
    }
}

#[derive(Debug, Default)]
struct MemoryTables {
    fragments: BTreeMap<String, FragmentMetadata>,
    fragment_data: BTreeMap<String, CachedContent>,
}

/// 基于内存的实现（测试和临时会话用，进程退出即丢失）
#[derive(Debug, Default)]
pub struct MemoryFragmentStore {
    tables: RwLock<MemoryTables>,
}

impl MemoryFragmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl LocalFragmentStore for MemoryFragmentStore {
    async fn put(&self, fragment: &FragmentMetadata) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.fragments.insert(fragment.id.clone(), fragment.clone());
        Ok(())
    }

    async fn put_content(&self, id: &str, data: &FragmentData) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.fragment_data.insert(id.to_string(), CachedContent::from_data(data));
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<FragmentMetadata>> {
        Ok(self.tables.read().await.fragments.get(id).cloned())
    }

    async fn get_content(&self, id: &str) -> Result<Option<FragmentData>> {
        Ok(self
            .tables
            .read()
            .await
            .fragment_data
            .get(id)
            .cloned()
            .map(CachedContent::into_data))
    }

    async fn list(&self, owner_filter: Option<&str>) -> Result<Vec<FragmentMetadata>> {
        Ok(self
            .tables
            .read()
            .await
            .fragments
            .values()
            .filter(|fragment| owner_matches(fragment, owner_filter))
            .cloned()
            .collect())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.fragments.remove(id);
        tables.fragment_data.remove(id);
        Ok(())
    }

    async fn replace_all(&self, fragments: &[FragmentMetadata]) -> Result<()> {
        let mut tables = self.tables.write().await;
        let keep: HashSet<&str> = fragments.iter().map(|f| f.id.as_str()).collect();
        tables.fragment_data.retain(|id, _| keep.contains(id.as_str()));
        tables.fragments = fragments
            .iter()
            .map(|f| (f.id.clone(), f.clone()))
            .collect();
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.fragments.clear();
        tables.fragment_data.clear();
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.tables.read().await.fragments.len())
    }

    async fn content_count(&self) -> Result<usize> {
        Ok(self.tables.read().await.fragment_data.len())
    }

    async fn prune_content(&self, older_than: Duration) -> Result<usize> {
        let cutoff = cutoff_millis(older_than);
        let mut tables = self.tables.write().await;
        let before = tables.fragment_data.len();
        tables.fragment_data.retain(|_, cached| cached.cached_at >= cutoff);
        Ok(before - tables.fragment_data.len())
    }

    async fn export_entries(&self) -> Result<(Vec<FragmentMetadata>, Vec<(String, CachedContent)>)> {
        let tables = self.tables.read().await;
        Ok((
            tables.fragments.values().cloned().collect(),
            tables
                .fragment_data
                .iter()
                .map(|(id, cached)| (id.clone(), cached.clone()))
                .collect(),
        ))
    }

    async fn import_entries(
        &self,
        fragments: &[FragmentMetadata],
        contents: &[(String, CachedContent)],
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.fragments = fragments.iter().map(|f| (f.id.clone(), f.clone())).collect();
        tables.fragment_data = contents.iter().cloned().collect();
        Ok(())
    }
}
