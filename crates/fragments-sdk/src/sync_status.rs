//! 同步状态管理
//!
//! 记录同步状态机的当前状态和累计统计，用于诊断和日志输出。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::sync::{SyncReport, SyncState};
use crate::version::SDK_VERSION;

/// 累计统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// 离线期间入队的变更数
    pub queued: u64,
    /// 成功回放的变更数
    pub replayed: u64,
    /// 回放失败次数
    pub failed: u64,
    /// 被丢弃的变更数
    pub discarded: u64,
    /// 完成的回放轮数
    pub sync_runs: u64,
}

/// 同步状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    /// 最近一次回放结束的时间
    pub last_sync_at: Option<DateTime<Utc>>,
    /// 最近一次回放的结果
    pub last_report: Option<SyncReport>,
    /// 最近一次错误
    pub last_error: Option<String>,
    pub stats: SyncStats,
    pub sdk_version: String,
}

impl SyncStatus {
    pub fn new(state: SyncState) -> Self {
        Self {
            state,
            last_sync_at: None,
            last_report: None,
            last_error: None,
            stats: SyncStats::default(),
            sdk_version: SDK_VERSION.to_string(),
        }
    }

    /// 距离上次回放的秒数
    pub fn seconds_since_last_sync(&self) -> Option<i64> {
        self.last_sync_at.map(|at| (Utc::now() - at).num_seconds())
    }

    /// 生成人类可读的状态摘要
    pub fn summary(&self) -> String {
        let last_sync = match self.seconds_since_last_sync() {
            Some(secs) => format!("{}秒前", secs),
            None => "从未".to_string(),
        };

        format!(
            "【同步状态】\n\
             状态: {}\n\
             上次同步: {}\n\
             统计: 入队{}条/回放{}条/失败{}次/丢弃{}条\n\
             最近错误: {}\n\
             SDK版本: {}",
            self.state,
            last_sync,
            self.stats.queued,
            self.stats.replayed,
            self.stats.failed,
            self.stats.discarded,
            self.last_error.as_deref().unwrap_or("无"),
            self.sdk_version
        )
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// 同步状态管理器（线程安全）
#[derive(Debug, Clone)]
pub struct SyncStatusManager {
    status: Arc<RwLock<SyncStatus>>,
}

impl SyncStatusManager {
    pub fn new(initial: SyncState) -> Self {
        Self {
            status: Arc::new(RwLock::new(SyncStatus::new(initial))),
        }
    }

    pub async fn set_state(&self, state: SyncState) {
        self.status.write().await.state = state;
    }

    pub async fn record_queued(&self) {
        self.status.write().await.stats.queued += 1;
    }

    pub async fn record_replayed(&self) {
        self.status.write().await.stats.replayed += 1;
    }

    pub async fn record_failure(&self, error: &str) {
        let mut status = self.status.write().await;
        status.stats.failed += 1;
        status.last_error = Some(error.to_string());
    }

    pub async fn record_discarded(&self) {
        self.status.write().await.stats.discarded += 1;
    }

    /// 记录一轮回放结束
    pub async fn record_report(&self, report: &SyncReport) {
        let mut status = self.status.write().await;
        status.stats.sync_runs += 1;
        status.last_sync_at = Some(Utc::now());
        if let Some(error) = &report.error {
            status.last_error = Some(error.clone());
        }
        status.last_report = Some(report.clone());
    }

    pub async fn get_status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    pub async fn get_summary(&self) -> String {
        self.status.read().await.summary()
    }

    /// 打印状态到日志
    pub async fn log_status(&self) {
        let summary = self.get_summary().await;
        tracing::info!("\n{}", summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sync_status_manager() {
        let manager = SyncStatusManager::new(SyncState::Online);
        manager.set_state(SyncState::Offline).await;
        manager.record_queued().await;
        manager.record_queued().await;
        manager.set_state(SyncState::Syncing).await;
        manager.record_replayed().await;
        manager.record_failure("Network error: timeout").await;

        let report = SyncReport {
            replayed: 1,
            remaining: 1,
            error: Some("Network error: timeout".to_string()),
            ..Default::default()
        };
        manager.record_report(&report).await;
        manager.set_state(SyncState::Online).await;

        let status = manager.get_status().await;
        assert_eq!(status.state, SyncState::Online);
        assert_eq!(status.stats.queued, 2);
        assert_eq!(status.stats.replayed, 1);
        assert_eq!(status.stats.failed, 1);
        assert_eq!(status.stats.sync_runs, 1);
        assert_eq!(status.last_report, Some(report));
        assert!(status.seconds_since_last_sync().unwrap() >= 0);

        let summary = manager.get_summary().await;
        assert!(summary.contains("在线"));
        assert!(summary.contains("入队2条"));
        assert!(summary.contains("timeout"));
        assert!(status.to_json_pretty().unwrap().contains("\"Online\""));
    }
}
