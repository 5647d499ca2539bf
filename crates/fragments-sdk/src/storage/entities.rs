//! 存储实体定义
//!
//! 远端接口、本地缓存和离线队列共用的数据结构。

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 离线创建时临时 ID 的前缀
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Fragment 元数据（服务器为权威源，本地只保存缓存副本）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentMetadata {
    /// 服务器分配的唯一 ID（离线创建时为 `local-` 开头的临时 ID）
    pub id: String,
    #[serde(default)]
    pub owner_id: String,
    /// MIME 类型
    #[serde(rename = "type")]
    pub content_type: String,
    /// 字节数
    pub size: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl FragmentMetadata {
    /// 构造一个尚未同步到服务器的本地条目
    pub fn local(id: String, owner_id: String, content_type: String, size: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id,
            content_type,
            size,
            created: now,
            updated: now,
        }
    }

    /// 是否是离线创建、尚未拿到服务器 ID 的条目
    pub fn is_local(&self) -> bool {
        is_local_id(&self.id)
    }
}

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// 生成离线创建用的临时 ID
pub fn new_local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4())
}

/// Fragment 内容（原始字节 + 返回时的 Content-Type）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentData {
    pub content_type: String,
    pub bytes: Bytes,
}

impl FragmentData {
    pub fn new(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn text(content_type: impl Into<String>, text: &str) -> Self {
        Self::new(content_type, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// 文本类内容（text/*、JSON、YAML）按 UTF-8 解码
    pub fn as_text(&self) -> Option<&str> {
        if is_textual(&self.content_type) {
            std::str::from_utf8(&self.bytes).ok()
        } else {
            None
        }
    }
}

/// 判断 MIME 类型是否是文本
pub fn is_textual(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("text/")
        || essence == "application/json"
        || essence == "application/yaml"
        || essence == "application/x-yaml"
}

/// 本地缓存的内容记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedContent {
    pub content_type: String,
    pub data: Vec<u8>,
    /// 缓存时间（UTC 毫秒时间戳）
    pub cached_at: i64,
}

impl CachedContent {
    pub fn from_data(data: &FragmentData) -> Self {
        Self {
            content_type: data.content_type.clone(),
            data: data.bytes.to_vec(),
            cached_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn into_data(self) -> FragmentData {
        FragmentData::new(self.content_type, self.data)
    }
}

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Create => write!(f, "create"),
            MutationKind::Update => write!(f, "update"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

/// 离线期间记录的变更（带各自的负载）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationAction {
    Create {
        /// 乐观写入本地缓存时使用的临时 ID
        local_id: String,
        content_type: String,
        content: Vec<u8>,
    },
    Update {
        fragment_id: String,
        content: Vec<u8>,
        target_type: String,
    },
    Delete {
        fragment_id: String,
    },
}

impl MutationAction {
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationAction::Create { .. } => MutationKind::Create,
            MutationAction::Update { .. } => MutationKind::Update,
            MutationAction::Delete { .. } => MutationKind::Delete,
        }
    }

    /// 变更针对的 fragment（Create 返回临时 ID）
    pub fn fragment_id(&self) -> &str {
        match self {
            MutationAction::Create { local_id, .. } => local_id,
            MutationAction::Update { fragment_id, .. } => fragment_id,
            MutationAction::Delete { fragment_id } => fragment_id,
        }
    }

    /// 把 Update/Delete 的目标从 `old_id` 改成 `new_id`，返回是否发生了修改
    pub fn retarget(&mut self, old_id: &str, new_id: &str) -> bool {
        match self {
            MutationAction::Update { fragment_id, .. } | MutationAction::Delete { fragment_id }
                if fragment_id == old_id =>
            {
                *fragment_id = new_id.to_string();
                true
            }
            _ => false,
        }
    }
}

/// 离线队列中的待回放变更
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// 入队时分配，严格递增
    pub sequence_id: u64,
    pub action: MutationAction,
    pub enqueued_at: DateTime<Utc>,
    /// 回放失败次数
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl PendingMutation {
    pub fn new(sequence_id: u64, action: MutationAction) -> Self {
        Self {
            sequence_id,
            action,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }

    pub fn kind(&self) -> MutationKind {
        self.action.kind()
    }
}

/// 本地缓存的完整快照（备份/恢复用）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub fragments: Vec<FragmentMetadata>,
    pub fragment_data: Vec<(String, CachedContent)>,
    pub offline_queue: Vec<PendingMutation>,
}
