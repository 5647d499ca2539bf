//! 事件系统模块 - 向展示层广播 SDK 内部发生的事情
//!
//! 功能包括：
//! - 网络连通性变化
//! - 同步状态机的状态变化
//! - 离线变更的入队、回放、丢弃
//! - 同步完成/失败

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::network::NetworkStatus;
use crate::storage::entities::MutationKind;
use crate::sync::{SyncReport, SyncState};

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// SDK 事件类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SDKEvent {
    /// 网络连通性变化
    ConnectivityChanged {
        old_status: NetworkStatus,
        new_status: NetworkStatus,
        timestamp: i64,
    },
    /// 同步状态变化
    SyncStateChanged {
        old_state: SyncState,
        new_state: SyncState,
        timestamp: i64,
    },
    /// 开始回放离线队列
    SyncStarted { pending: usize, timestamp: i64 },
    /// 离线时记录了一条变更
    MutationQueued {
        sequence_id: u64,
        kind: MutationKind,
        fragment_id: String,
        timestamp: i64,
    },
    /// 一条离线变更已成功应用到服务器
    MutationReplayed {
        sequence_id: u64,
        kind: MutationKind,
        /// 服务器上的 fragment id（离线创建的条目为服务器新分配的 id）
        fragment_id: String,
        timestamp: i64,
    },
    /// 一条离线变更多次永久失败后被丢弃
    MutationDiscarded {
        sequence_id: u64,
        kind: MutationKind,
        fragment_id: String,
        error: String,
        timestamp: i64,
    },
    /// 一次回放结束（可能中途停止，见 report.error）
    SyncCompleted { report: SyncReport, timestamp: i64 },
    /// 回放被错误打断，队列中仍有条目
    SyncFailed {
        error: String,
        remaining: usize,
        timestamp: i64,
    },
}

impl SDKEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SDKEvent::ConnectivityChanged { .. } => "connectivity_changed",
            SDKEvent::SyncStateChanged { .. } => "sync_state_changed",
            SDKEvent::SyncStarted { .. } => "sync_started",
            SDKEvent::MutationQueued { .. } => "mutation_queued",
            SDKEvent::MutationReplayed { .. } => "mutation_replayed",
            SDKEvent::MutationDiscarded { .. } => "mutation_discarded",
            SDKEvent::SyncCompleted { .. } => "sync_completed",
            SDKEvent::SyncFailed { .. } => "sync_failed",
        }
    }

    /// 获取事件关联的 fragment id
    pub fn fragment_id(&self) -> Option<&str> {
        match self {
            SDKEvent::MutationQueued { fragment_id, .. }
            | SDKEvent::MutationReplayed { fragment_id, .. }
            | SDKEvent::MutationDiscarded { fragment_id, .. } => Some(fragment_id),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SDKEvent::ConnectivityChanged { timestamp, .. }
            | SDKEvent::SyncStateChanged { timestamp, .. }
            | SDKEvent::SyncStarted { timestamp, .. }
            | SDKEvent::MutationQueued { timestamp, .. }
            | SDKEvent::MutationReplayed { timestamp, .. }
            | SDKEvent::MutationDiscarded { timestamp, .. }
            | SDKEvent::SyncCompleted { timestamp, .. }
            | SDKEvent::SyncFailed { timestamp, .. } => *timestamp,
        }
    }

    pub fn connectivity_changed(old_status: NetworkStatus, new_status: NetworkStatus) -> Self {
        SDKEvent::ConnectivityChanged {
            old_status,
            new_status,
            timestamp: now_millis(),
        }
    }

    pub fn sync_state_changed(old_state: SyncState, new_state: SyncState) -> Self {
        SDKEvent::SyncStateChanged {
            old_state,
            new_state,
            timestamp: now_millis(),
        }
    }

    pub fn sync_started(pending: usize) -> Self {
        SDKEvent::SyncStarted {
            pending,
            timestamp: now_millis(),
        }
    }

    pub fn mutation_queued(sequence_id: u64, kind: MutationKind, fragment_id: &str) -> Self {
        SDKEvent::MutationQueued {
            sequence_id,
            kind,
            fragment_id: fragment_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn mutation_replayed(sequence_id: u64, kind: MutationKind, fragment_id: &str) -> Self {
        SDKEvent::MutationReplayed {
            sequence_id,
            kind,
            fragment_id: fragment_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn mutation_discarded(sequence_id: u64, kind: MutationKind, fragment_id: &str, error: &str) -> Self {
        SDKEvent::MutationDiscarded {
            sequence_id,
            kind,
            fragment_id: fragment_id.to_string(),
            error: error.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn sync_completed(report: SyncReport) -> Self {
        SDKEvent::SyncCompleted {
            report,
            timestamp: now_millis(),
        }
    }

    pub fn sync_failed(error: &str, remaining: usize) -> Self {
        SDKEvent::SyncFailed {
            error: error.to_string(),
            remaining,
            timestamp: now_millis(),
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// fragment id 过滤器
    pub fragment_ids: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_fragment_ids(mut self, fragment_ids: Vec<String>) -> Self {
        self.fragment_ids = Some(fragment_ids);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SDKEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref ids) = self.fragment_ids {
            match event.fragment_id() {
                Some(id) if ids.iter().any(|wanted| wanted == id) => {}
                // 事件没有 fragment id 但过滤器要求有
                _ => return false,
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SDKEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SDKEvent>,
    /// 按事件类型注册的监听器，`*` 表示接收全部
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SDKEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 没有订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        for key in [event.event_type(), "*"] {
            if let Some(event_listeners) = listeners.get(key) {
                for listener in event_listeners {
                    listener(&event);
                }
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SDKEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SDKEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners.entry(event_type.to_string()).or_default().push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        self.listeners.write().await.clear();
        self.stats.write().await.listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SDKEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SDKEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SDKEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SDKEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_event_manager_basic_functionality() {
        let manager = EventManager::new(100);
        let mut receiver = manager.subscribe();

        manager
            .emit(SDKEvent::mutation_queued(1, MutationKind::Create, "local-1"))
            .await;

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "mutation_queued");
        assert_eq!(received.fragment_id(), Some("local-1"));
        assert!(received.timestamp() > 0);

        let stats = manager.get_stats().await;
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.events_by_type.get("mutation_queued"), Some(&1));
    }

    #[tokio::test]
    async fn test_event_filter() {
        let manager = EventManager::new(100);
        let filter = EventFilter::new()
            .with_event_types(vec!["mutation_replayed".to_string()])
            .with_fragment_ids(vec!["a".to_string()]);
        let mut filtered = manager.subscribe_filtered(filter);

        manager.emit(SDKEvent::sync_started(2)).await;
        manager
            .emit(SDKEvent::mutation_replayed(1, MutationKind::Update, "b"))
            .await;
        manager
            .emit(SDKEvent::mutation_replayed(2, MutationKind::Delete, "a"))
            .await;

        match filtered.recv().await.unwrap() {
            SDKEvent::MutationReplayed { sequence_id, kind, .. } => {
                assert_eq!(sequence_id, 2);
                assert_eq!(kind, MutationKind::Delete);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(filtered.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_event_listeners() {
        let manager = EventManager::new(100);
        let typed = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let typed_clone = typed.clone();
        manager
            .add_listener("sync_failed", move |_event| {
                typed_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        let all_clone = all.clone();
        manager
            .add_listener("*", move |_event| {
                all_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(manager.get_stats().await.listener_count, 2);

        manager.emit(SDKEvent::sync_failed("timeout", 3)).await;
        manager
            .emit(SDKEvent::sync_state_changed(SyncState::Offline, SyncState::Syncing))
            .await;

        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);

        manager.clear_listeners().await;
        manager.emit(SDKEvent::sync_failed("timeout", 3)).await;
        assert_eq!(typed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let manager = EventManager::new(100);
        let mut receiver1 = manager.subscribe();
        let mut receiver2 = manager.subscribe();
        assert_eq!(manager.subscriber_count(), 2);

        manager
            .emit(SDKEvent::connectivity_changed(NetworkStatus::Online, NetworkStatus::Offline))
            .await;

        assert_eq!(receiver1.recv().await.unwrap().event_type(), "connectivity_changed");
        assert_eq!(receiver2.recv().await.unwrap().event_type(), "connectivity_changed");
    }
}
