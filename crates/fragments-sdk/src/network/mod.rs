use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::RemoteFragmentClient;
use crate::error::Result;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
}

impl NetworkStatus {
    pub fn is_online(self) -> bool {
        self == NetworkStatus::Online
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    /// UTC 毫秒时间戳
    pub timestamp: i64,
}

impl NetworkStatusEvent {
    pub fn new(old_status: NetworkStatus, new_status: NetworkStatus) -> Self {
        Self {
            old_status,
            new_status,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 网络状态监听器trait（由平台层实现，或使用内置的 [`PollingNetworkListener`]）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
///
/// 把监听器上报的状态去重后广播出去，同步引擎通过 `subscribe()` 消费。
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<RwLock<NetworkStatus>>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>, buffer_size: usize) -> Self {
        let (status_sender, _) = broadcast::channel(buffer_size.max(1));

        Self {
            listener,
            status_sender,
            current_status: Arc::new(RwLock::new(NetworkStatus::Online)),
            forward_task: Mutex::new(None),
        }
    }

    /// 启动网络监控
    ///
    /// 先用监听器的当前状态作为初始值，之后转发监听器的变化事件。
    pub async fn start(&self) -> Result<()> {
        let initial = self.listener.get_current_status().await;
        self.set_status(initial).await;

        let mut receiver = self.listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        // 启动监听任务
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let old_status = {
                            let mut status = current_status.write().await;
                            std::mem::replace(&mut *status, event.new_status)
                        };
                        if old_status != event.new_status {
                            let _ = status_sender.send(NetworkStatusEvent::new(old_status, event.new_status));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("网络状态事件积压，跳过 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.forward_task.lock().replace(handle) {
            previous.abort();
        }
        info!("✅ 网络监控已启动，初始状态: {:?}", initial);
        Ok(())
    }

    /// 停止监控
    pub async fn stop(&self) {
        self.listener.stop_monitoring().await;
        if let Some(handle) = self.forward_task.lock().take() {
            handle.abort();
        }
    }

    /// 获取当前网络状态
    pub async fn get_status(&self) -> NetworkStatus {
        *self.current_status.read().await
    }

    /// 手动设置网络状态，状态没变时不广播
    pub async fn set_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut status = self.current_status.write().await;
            std::mem::replace(&mut *status, new_status)
        };

        if old_status != new_status {
            info!("网络状态变化: {:?} -> {:?}", old_status, new_status);
            let _ = self.status_sender.send(NetworkStatusEvent::new(old_status, new_status));
        }
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    pub async fn check_connection(&self) -> bool {
        self.get_status().await.is_online()
    }
}

/// 轮询式监听器：定期调用 `ping()` 探测服务器是否可达
///
/// 适合没有系统网络事件的宿主环境。
#[derive(Debug)]
pub struct PollingNetworkListener {
    client: Arc<dyn RemoteFragmentClient>,
    interval: Duration,
    last_status: Arc<RwLock<NetworkStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingNetworkListener {
    pub fn new(client: Arc<dyn RemoteFragmentClient>, interval: Duration) -> Self {
        Self {
            client,
            interval,
            last_status: Arc::new(RwLock::new(NetworkStatus::Online)),
            task: Mutex::new(None),
        }
    }

    async fn probe(client: &dyn RemoteFragmentClient) -> NetworkStatus {
        if client.ping().await {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        }
    }
}

#[async_trait]
impl NetworkStatusListener for PollingNetworkListener {
    async fn get_current_status(&self) -> NetworkStatus {
        let status = Self::probe(self.client.as_ref()).await;
        *self.last_status.write().await = status;
        status
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
        let (sender, receiver) = broadcast::channel(16);
        let client = self.client.clone();
        let last_status = self.last_status.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval 的第一次 tick 立即返回，初始状态已经由 get_current_status 探测过
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let new_status = Self::probe(client.as_ref()).await;
                let old_status = std::mem::replace(&mut *last_status.write().await, new_status);
                if old_status != new_status {
                    debug!("探测到网络状态变化: {:?} -> {:?}", old_status, new_status);
                    if sender.send(NetworkStatusEvent::new(old_status, new_status)).is_err() {
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        Ok(receiver)
    }

    async fn stop_monitoring(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

/// 由宿主手动推送状态的监听器（平台回调、测试）
#[derive(Debug)]
pub struct ManualNetworkListener {
    status: RwLock<NetworkStatus>,
    sender: broadcast::Sender<NetworkStatusEvent>,
}

impl ManualNetworkListener {
    pub fn new(initial: NetworkStatus) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            status: RwLock::new(initial),
            sender,
        }
    }

    /// 平台层上报新的网络状态
    pub async fn report(&self, new_status: NetworkStatus) {
        let old_status = std::mem::replace(&mut *self.status.write().await, new_status);
        let _ = self.sender.send(NetworkStatusEvent::new(old_status, new_status));
    }
}

impl Default for ManualNetworkListener {
    fn default() -> Self {
        Self::new(NetworkStatus::Online)
    }
}

#[async_trait]
impl NetworkStatusListener for ManualNetworkListener {
    async fn get_current_status(&self) -> NetworkStatus {
        *self.status.read().await
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
        Ok(self.sender.subscribe())
    }

    async fn stop_monitoring(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FragmentList;
    use crate::storage::entities::{FragmentData, FragmentMetadata};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::timeout;

    /// 只实现 ping 的假客户端
    #[derive(Debug, Default)]
    struct PingOnly {
        reachable: AtomicBool,
    }

    #[async_trait]
    impl RemoteFragmentClient for PingOnly {
        async fn list(&self, _expand: bool) -> Result<FragmentList> {
            unimplemented!()
        }
        async fn get_content(&self, _id: &str) -> Result<FragmentData> {
            unimplemented!()
        }
        async fn get_metadata(&self, _id: &str) -> Result<FragmentMetadata> {
            unimplemented!()
        }
        async fn create(&self, _content_type: &str, _content: Bytes) -> Result<FragmentMetadata> {
            unimplemented!()
        }
        async fn update(&self, _id: &str, _content: Bytes, _target_type: &str) -> Result<FragmentMetadata> {
            unimplemented!()
        }
        async fn delete(&self, _id: &str) -> Result<()> {
            unimplemented!()
        }
        async fn convert(&self, _id: &str, _extension: &str) -> Result<FragmentData> {
            unimplemented!()
        }
        async fn ping(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_monitor_forwards_listener_changes() {
        let listener = Arc::new(ManualNetworkListener::default());
        let monitor = NetworkMonitor::new(listener.clone(), 16);
        monitor.start().await.unwrap();
        let mut events = monitor.subscribe();

        listener.report(NetworkStatus::Offline).await;
        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
        assert_eq!(event.old_status, NetworkStatus::Online);
        assert_eq!(event.new_status, NetworkStatus::Offline);

        // 重复上报同一状态不会产生事件
        listener.report(NetworkStatus::Offline).await;
        listener.report(NetworkStatus::Online).await;
        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
        assert_eq!(event.new_status, NetworkStatus::Online);
        assert!(monitor.check_connection().await);

        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_set_status_deduplicates() {
        let monitor = NetworkMonitor::new(Arc::new(ManualNetworkListener::default()), 16);
        let mut events = monitor.subscribe();
        monitor.set_status(NetworkStatus::Online).await;
        monitor.set_status(NetworkStatus::Offline).await;
        assert_eq!(events.recv().await.unwrap().new_status, NetworkStatus::Offline);
        assert!(events.try_recv().is_err());
        assert_eq!(monitor.get_status().await, NetworkStatus::Offline);
    }

    #[tokio::test]
    async fn test_polling_listener_reports_probe_changes() {
        let client = Arc::new(PingOnly::default());
        let listener = PollingNetworkListener::new(client.clone(), Duration::from_millis(10));
        assert_eq!(listener.get_current_status().await, NetworkStatus::Offline);

        let mut events = listener.start_monitoring().await.unwrap();
        client.reachable.store(true, Ordering::SeqCst);
        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert_eq!(event.old_status, NetworkStatus::Offline);
        assert_eq!(event.new_status, NetworkStatus::Online);
        listener.stop_monitoring().await;
    }
}
