//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 本模块提供：
//! - 数据库打开（带锁冲突退避重试）
//! - 按逻辑表划分的 Tree
//! - JSON / bincode 两种值编码
//! - 单调递增 ID 生成

use std::path::{Path, PathBuf};
use serde::{Serialize, Deserialize};
use sled::{Db, Tree};
use crate::error::{FragmentsSDKError, Result};

/// KV 存储统计信息
#[derive(Debug, Clone, Default)]
pub struct KvStats {
    pub tree_count: usize,
    pub total_keys: u64,
    pub storage_size: u64,
}

/// KV 存储组件
#[derive(Debug, Clone)]
pub struct KvStore {
    base_path: PathBuf,
    db: Db,
    #[cfg(test)]
    fail_flush: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl KvStore {
    /// 打开 `{base_path}/kv` 下的 sled 数据库
    pub async fn open(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path).await
            .map_err(|e| FragmentsSDKError::Storage(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个实例可能刚释放文件锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 50;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => {
                    tracing::debug!("sled 数据库已打开: {}", kv_path.display());
                    return Ok(Self {
                        base_path,
                        db,
                        #[cfg(test)]
                        fail_flush: Default::default(),
                    });
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tracing::warn!("sled 数据库被占用，{}ms 后重试 ({}/{})", delay_ms, attempt + 1, MAX_OPEN_RETRIES);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }

        Err(FragmentsSDKError::Storage(
            last_err
                .map(|e| format!("打开 sled 数据库失败: {}", e))
                .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
        ))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 打开（或创建）一张逻辑表
    pub fn tree(&self, name: &str) -> Result<Tree> {
        self.db.open_tree(name)
            .map_err(|e| FragmentsSDKError::Storage(format!("打开 Tree {} 失败: {}", name, e)))
    }

    /// 单调递增 ID，进程重启后依然递增
    pub fn generate_id(&self) -> Result<u64> {
        self.db.generate_id()
            .map_err(|e| FragmentsSDKError::Storage(format!("生成 ID 失败: {}", e)))
    }

    /// 把所有脏数据刷到磁盘
    pub async fn flush(&self) -> Result<()> {
        #[cfg(test)]
        if self.fail_flush.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(FragmentsSDKError::Storage("刷盘失败: injected".to_string()));
        }
        self.db.flush_async().await
            .map_err(|e| FragmentsSDKError::Storage(format!("刷盘失败: {}", e)))?;
        Ok(())
    }

    /// 让之后的 flush 返回错误
    #[cfg(test)]
    pub(crate) fn fail_flushes(&self, fail: bool) {
        self.fail_flush.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// 获取统计信息
    pub fn stats(&self) -> Result<KvStats> {
        let mut stats = KvStats::default();
        for name in self.db.tree_names() {
            let tree = self.db.open_tree(&name)?;
            stats.tree_count += 1;
            stats.total_keys += tree.len() as u64;
        }
        stats.storage_size = self.db.size_on_disk()?;
        Ok(stats)
    }
}

/// JSON 编码写入
pub fn set_json<K, V>(tree: &Tree, key: K, value: &V) -> Result<()>
where
    K: AsRef<[u8]>,
    V: Serialize,
{
    let bytes = serde_json::to_vec(value)
        .map_err(|e| FragmentsSDKError::Serialization(format!("序列化值失败: {}", e)))?;
    tree.insert(key, bytes)
        .map_err(|e| FragmentsSDKError::Storage(format!("设置键值对失败: {}", e)))?;
    Ok(())
}

/// JSON 编码读取
pub fn get_json<K, V>(tree: &Tree, key: K) -> Result<Option<V>>
where
    K: AsRef<[u8]>,
    V: for<'de> Deserialize<'de>,
{
    match tree.get(key).map_err(|e| FragmentsSDKError::Storage(format!("获取键值对失败: {}", e)))? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| FragmentsSDKError::Serialization(format!("反序列化值失败: {}", e)))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// 按 key 顺序遍历整张表并 JSON 解码
pub fn scan_json<V>(tree: &Tree) -> Result<Vec<(Vec<u8>, V)>>
where
    V: for<'de> Deserialize<'de>,
{
    let mut results = Vec::with_capacity(tree.len());
    for item in tree.iter() {
        let (key, bytes) = item
            .map_err(|e| FragmentsSDKError::Storage(format!("遍历 Tree 失败: {}", e)))?;
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| FragmentsSDKError::Serialization(format!("反序列化值失败: {}", e)))?;
        results.push((key.to_vec(), value));
    }
    Ok(results)
}

/// bincode 编码写入（二进制负载用，避免 JSON 把字节数组展开成数字列表）
pub fn set_bin<K, V>(tree: &Tree, key: K, value: &V) -> Result<()>
where
    K: AsRef<[u8]>,
    V: Serialize,
{
    let bytes = bincode::serialize(value)?;
    tree.insert(key, bytes)?;
    Ok(())
}

pub fn get_bin<K, V>(tree: &Tree, key: K) -> Result<Option<V>>
where
    K: AsRef<[u8]>,
    V: for<'de> Deserialize<'de>,
{
    match tree.get(key)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub fn scan_bin<V>(tree: &Tree) -> Result<Vec<(Vec<u8>, V)>>
where
    V: for<'de> Deserialize<'de>,
{
    let mut results = Vec::with_capacity(tree.len());
    for item in tree.iter() {
        let (key, bytes) = item?;
        results.push((key.to_vec(), bincode::deserialize(&bytes)?));
    }
    Ok(results)
}

/// 逻辑表名常量
pub mod trees {
    /// Fragment 元数据（按 id）
    pub const FRAGMENTS: &str = "fragments";
    /// Fragment 内容（按 id）
    pub const FRAGMENT_DATA: &str = "fragment_data";
    /// 离线变更队列（按 sequence_id 大端序）
    pub const OFFLINE_QUEUE: &str = "offline_queue";
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use serde_json::json;

    #[tokio::test]
    async fn test_kv_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::open(temp_dir.path()).await.unwrap();
        let tree = store.tree("test").unwrap();

        let test_data = json!({ "name": "test", "value": 123 });
        set_json(&tree, "test_key", &test_data).unwrap();
        let retrieved: serde_json::Value = get_json(&tree, "test_key").unwrap().unwrap();
        assert_eq!(retrieved, test_data);

        let missing: Option<serde_json::Value> = get_json(&tree, "missing").unwrap();
        assert!(missing.is_none());

        set_bin(&tree, "bin_key", &vec![1u8, 2, 3]).unwrap();
        let bytes: Vec<u8> = get_bin(&tree, "bin_key").unwrap().unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_generate_id_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let first = {
            let store = KvStore::open(temp_dir.path()).await.unwrap();
            let a = store.generate_id().unwrap();
            let b = store.generate_id().unwrap();
            assert!(b > a);
            store.flush().await.unwrap();
            b
        };

        let store = KvStore::open(temp_dir.path()).await.unwrap();
        assert!(store.generate_id().unwrap() > first);
    }

    #[tokio::test]
    async fn test_scan_is_key_ordered() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::open(temp_dir.path()).await.unwrap();
        let tree = store.tree("ordered").unwrap();

        for n in [3u64, 1, 2] {
            set_json(&tree, n.to_be_bytes(), &n).unwrap();
        }
        let values: Vec<u64> = scan_json::<u64>(&tree).unwrap().into_iter().map(|(_, v)| v).collect();
        assert_eq!(values, vec![1, 2, 3]);

        let stats = store.stats().unwrap();
        assert!(stats.total_keys >= 3);
    }
}
