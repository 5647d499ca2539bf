/// 离线同步模块
///
/// 职责：
/// - 维护 Online / Offline / Syncing 状态机
/// - 在线时直接调用远端，离线时写入队列并乐观更新本地缓存
/// - 恢复连接后按顺序回放离线队列，再用服务器列表刷新缓存

pub mod replay;
pub mod sync_engine;

pub use replay::{classify, ReplayOutcome};
pub use sync_engine::SyncEngine;

use serde::{Deserialize, Serialize};

/// 同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// 在线，读写直达服务器
    Online,
    /// 离线，写操作入队
    Offline,
    /// 正在回放离线队列
    Syncing,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Online => write!(f, "在线"),
            SyncState::Offline => write!(f, "离线"),
            SyncState::Syncing => write!(f, "同步中"),
        }
    }
}

/// 一次队列回放的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// 成功回放并移出队列的条目数
    pub replayed: usize,
    /// 多次永久失败后被丢弃的条目数
    pub discarded: usize,
    /// 回放结束后队列中剩余的条目数
    pub remaining: usize,
    /// 回放后的列表刷新是否成功
    pub refreshed: bool,
    /// 使回放停止的错误
    pub error: Option<String>,
}

impl SyncReport {
    /// 队列已清空且没有错误
    pub fn is_complete(&self) -> bool {
        self.remaining == 0 && self.error.is_none()
    }

    /// 合并紧接着的下一轮回放，计数累加，其余取后一轮
    pub(crate) fn merge(&mut self, next: SyncReport) {
        self.replayed += next.replayed;
        self.discarded += next.discarded;
        self.remaining = next.remaining;
        self.refreshed = next.refreshed;
        self.error = next.error;
    }
}
