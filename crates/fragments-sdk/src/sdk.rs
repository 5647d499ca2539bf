//! 统一 SDK 接口 - FragmentsSDK 主入口
//!
//! 分层架构：
//! ```text
//! FragmentsSDK (门面)
//!   ├── SyncEngine (同步引擎：读写路由、离线队列回放)
//!   ├── HttpFragmentClient (远端 REST 接口)
//!   ├── StorageManager (本地缓存 + 离线队列)
//!   ├── EventManager (事件系统)
//!   └── NetworkMonitor (网络监控，可选)
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client::Credentials;
use crate::error::{FragmentsSDKError, Result};
use crate::events::{EventManager, SDKEvent};
use crate::http_client::HttpFragmentClient;
use crate::network::{NetworkMonitor, NetworkStatus, NetworkStatusListener, PollingNetworkListener};
use crate::storage::entities::{CacheSnapshot, FragmentData, FragmentMetadata, PendingMutation};
use crate::storage::{CacheStats, StorageManager};
use crate::sync::{SyncEngine, SyncReport, SyncState};
use crate::sync_status::SyncStatus;

/// 未配置环境变量时使用的 API 地址
pub const DEFAULT_API_URL: &str = "http://localhost:8080";

/// 指定 API 地址的环境变量
pub const API_URL_ENV: &str = "FRAGMENTS_API_URL";

/// HTTP 客户端配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒），超时按网络错误处理
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

/// 同步配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 一条变更永久失败多少次后丢弃
    pub max_replay_attempts: u32,
    /// 内容缓存保留天数
    pub content_retention_days: u64,
    /// 轮询式网络探测的间隔（秒）
    pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_replay_attempts: 3,
            content_retention_days: 30,
            probe_interval_secs: 15,
        }
    }
}

/// 事件配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConfig {
    /// 事件缓冲区大小
    pub buffer_size: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 256 }
    }
}

/// Fragments SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentsConfig {
    /// 服务器地址
    pub api_url: String,
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 只在内存中缓存，不落盘
    pub in_memory: bool,
    /// 认证令牌，`user:password` 按 Basic 认证处理，其余按 Bearer
    pub token: Option<String>,
    /// 当前用户的 owner id，用于离线创建的条目
    pub owner_id: String,
    pub http_client_config: HttpClientConfig,
    pub sync_config: SyncConfig,
    pub event_config: EventConfig,
}

impl Default for FragmentsConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            data_dir: get_default_data_dir(),
            in_memory: false,
            token: None,
            owner_id: String::new(),
            http_client_config: HttpClientConfig::default(),
            sync_config: SyncConfig::default(),
            event_config: EventConfig::default(),
        }
    }
}

/// 读取 `FRAGMENTS_API_URL`，没有设置时回退到本地地址
fn default_api_url() -> String {
    std::env::var(API_URL_ENV)
        .ok()
        .filter(|url| !url.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string())
}

/// 获取默认数据目录 ~/.fragments/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".fragments")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows 支持
        home_dir.join(".fragments")
    } else {
        PathBuf::from("./fragments_data")
    }
}

/// Fragments SDK 配置构建器
#[derive(Debug, Default)]
pub struct FragmentsConfigBuilder {
    config: FragmentsConfig,
}

impl FragmentsConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn api_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_url = url.into();
        self
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn in_memory(mut self, enabled: bool) -> Self {
        self.config.in_memory = enabled;
        self
    }

    pub fn token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.token = Some(token.into());
        self
    }

    pub fn owner_id<S: Into<String>>(mut self, owner_id: S) -> Self {
        self.config.owner_id = owner_id.into();
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http_client_config = config;
        self
    }

    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.config.sync_config = config;
        self
    }

    pub fn max_replay_attempts(mut self, attempts: u32) -> Self {
        self.config.sync_config.max_replay_attempts = attempts;
        self
    }

    pub fn event_config(mut self, config: EventConfig) -> Self {
        self.config.event_config = config;
        self
    }

    pub fn build(self) -> FragmentsConfig {
        self.config
    }
}

impl FragmentsConfig {
    pub fn builder() -> FragmentsConfigBuilder {
        FragmentsConfigBuilder::new()
    }
}

/// 统一 SDK 主接口
///
/// 读写操作都委托给 [`SyncEngine`]，门面只负责组装各层和缓存维护。
#[derive(Debug)]
pub struct FragmentsSDK {
    config: FragmentsConfig,

    /// 存储管理器
    storage: StorageManager,

    /// 远端客户端
    client: Arc<HttpFragmentClient>,

    /// 同步引擎
    engine: Arc<SyncEngine>,

    /// 事件管理器
    event_manager: Arc<EventManager>,

    /// 网络监控（调用 start_network_monitor 后才有）
    network: Mutex<Option<Arc<NetworkMonitor>>>,

    /// 消费网络状态事件的任务
    connectivity_task: Mutex<Option<JoinHandle<()>>>,
}

impl FragmentsSDK {
    /// 异步初始化 SDK
    ///
    /// 分层初始化顺序：
    /// 1. 存储层 → 2. 远端客户端 → 3. 事件层 → 4. 同步引擎
    pub async fn initialize(config: FragmentsConfig) -> Result<Arc<Self>> {
        info!("正在初始化 FragmentsSDK...");

        // 验证配置
        Self::validate_config(&config)?;

        // === 第1层：存储管理器 ===
        let storage = if config.in_memory {
            info!("使用内存缓存，进程退出后数据丢失");
            StorageManager::in_memory()
        } else {
            StorageManager::open(&config.data_dir).await?
        };

        // === 第2层：远端客户端 ===
        let credentials = config.token.as_deref().map(Credentials::from_token);
        let client = Arc::new(HttpFragmentClient::new(
            &config.http_client_config,
            &config.api_url,
            credentials,
        )?);

        // === 第3层：事件管理器 ===
        let event_manager = Arc::new(EventManager::new(config.event_config.buffer_size));

        // === 第4层：同步引擎 ===
        let engine = Arc::new(SyncEngine::new(
            storage.fragments(),
            storage.queue(),
            client.clone(),
            event_manager.clone(),
            &config.sync_config,
            config.owner_id.clone(),
        ));

        let pending = storage.queue().count().await?;
        if pending > 0 {
            info!("上次会话留下 {} 条离线变更，恢复连接或调用 sync_now 后回放", pending);
        }

        info!("✅ FragmentsSDK 初始化完成 (api_url: {})", config.api_url);
        Ok(Arc::new(Self {
            config,
            storage,
            client,
            engine,
            event_manager,
            network: Mutex::new(None),
            connectivity_task: Mutex::new(None),
        }))
    }

    /// 验证配置
    fn validate_config(config: &FragmentsConfig) -> Result<()> {
        if config.api_url.trim().is_empty() {
            return Err(FragmentsSDKError::Config("API 地址不能为空".to_string()));
        }

        if !config.api_url.starts_with("http://") && !config.api_url.starts_with("https://") {
            return Err(FragmentsSDKError::Config(format!(
                "API 地址必须以 http:// 或 https:// 开头: {}",
                config.api_url
            )));
        }

        if !config.in_memory && config.data_dir.as_os_str().is_empty() {
            return Err(FragmentsSDKError::Config("数据目录不能为空".to_string()));
        }

        let http = &config.http_client_config;
        if http.connect_timeout_secs == Some(0) || http.request_timeout_secs == Some(0) {
            return Err(FragmentsSDKError::Config("HTTP 超时不能为0".to_string()));
        }

        if config.sync_config.max_replay_attempts == 0 {
            return Err(FragmentsSDKError::Config("max_replay_attempts 不能为0".to_string()));
        }

        if config.sync_config.probe_interval_secs == 0 {
            return Err(FragmentsSDKError::Config("网络探测间隔不能为0".to_string()));
        }

        Ok(())
    }

    pub fn config(&self) -> &FragmentsConfig {
        &self.config
    }

    pub fn engine(&self) -> Arc<SyncEngine> {
        self.engine.clone()
    }

    pub fn event_manager(&self) -> Arc<EventManager> {
        self.event_manager.clone()
    }

    /// 订阅 SDK 事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<SDKEvent> {
        self.event_manager.subscribe()
    }

    /// 登录/登出后替换凭证，`None` 表示不带认证头
    pub fn set_credentials(&self, token: Option<&str>) {
        self.client.set_credentials(token.map(Credentials::from_token));
    }

    // ========== Fragment 操作 ==========

    pub async fn load_fragments(&self) -> Result<Vec<FragmentMetadata>> {
        self.engine.load_fragments().await
    }

    pub async fn create_fragment(&self, content_type: &str, content: impl Into<Bytes>) -> Result<FragmentMetadata> {
        self.engine.create_fragment(content_type, content.into()).await
    }

    pub async fn update_fragment(
        &self,
        id: &str,
        content: impl Into<Bytes>,
        target_type: &str,
    ) -> Result<FragmentMetadata> {
        self.engine.update_fragment(id, content.into(), target_type).await
    }

    pub async fn delete_fragment(&self, id: &str) -> Result<()> {
        self.engine.delete_fragment(id).await
    }

    pub async fn get_fragment_content(&self, id: &str) -> Result<FragmentData> {
        self.engine.get_fragment_content(id).await
    }

    pub async fn get_fragment_info(&self, id: &str) -> Result<FragmentMetadata> {
        self.engine.get_fragment_info(id).await
    }

    pub async fn convert_fragment(&self, id: &str, extension: &str) -> Result<FragmentData> {
        self.engine.convert_fragment(id, extension).await
    }

    // ========== 同步 ==========

    pub fn sync_state(&self) -> SyncState {
        self.engine.state()
    }

    pub async fn sync_status(&self) -> SyncStatus {
        self.engine.status().get_status().await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.engine.pending_count().await
    }

    pub async fn pending_mutations(&self) -> Result<Vec<PendingMutation>> {
        self.engine.pending_mutations().await
    }

    /// 在线时手动回放离线队列
    pub async fn sync_now(&self) -> Result<Option<SyncReport>> {
        self.engine.sync_now().await
    }

    /// 宿主直接上报网络状态（不经过 NetworkMonitor）
    ///
    /// 恢复在线时同步执行回放，返回回放结果。
    pub async fn set_network_status(&self, status: NetworkStatus) -> Option<SyncReport> {
        match status {
            NetworkStatus::Offline => {
                self.engine.on_connectivity_lost().await;
                None
            }
            NetworkStatus::Online => self.engine.on_connectivity_restored().await,
        }
    }

    /// 启动网络监控
    ///
    /// 不传监听器时使用轮询探测服务器的 [`PollingNetworkListener`]。
    pub async fn start_network_monitor(
        &self,
        listener: Option<Arc<dyn NetworkStatusListener>>,
    ) -> Result<Arc<NetworkMonitor>> {
        self.stop_network_monitor().await;

        let listener: Arc<dyn NetworkStatusListener> = match listener {
            Some(listener) => listener,
            None => {
                let interval = Duration::from_secs(self.config.sync_config.probe_interval_secs);
                Arc::new(PollingNetworkListener::new(self.client.clone(), interval))
            }
        };
        let monitor = Arc::new(NetworkMonitor::new(listener, self.config.event_config.buffer_size));

        // 先订阅再启动，初始状态的变化也能收到
        let receiver = monitor.subscribe();
        monitor.start().await?;
        let task = tokio::spawn(self.engine.clone().run_connectivity_loop(receiver));

        *self.network.lock() = Some(monitor.clone());
        *self.connectivity_task.lock() = Some(task);
        info!("✅ 网络监控已接入同步引擎");
        Ok(monitor)
    }

    pub async fn stop_network_monitor(&self) {
        let monitor = self.network.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        if let Some(task) = self.connectivity_task.lock().take() {
            task.abort();
        }
    }

    // ========== 缓存维护 ==========

    /// 导出缓存和离线队列
    pub async fn export_cache(&self) -> Result<CacheSnapshot> {
        self.storage.export_snapshot().await
    }

    pub async fn export_cache_json(&self) -> Result<String> {
        let snapshot = self.export_cache().await?;
        Ok(serde_json::to_string(&snapshot)?)
    }

    /// 导入快照，替换当前缓存和离线队列
    pub async fn import_cache(&self, snapshot: &CacheSnapshot) -> Result<()> {
        if self.engine.state() == SyncState::Syncing {
            return Err(FragmentsSDKError::InvalidArgument("回放进行中，不能导入缓存".to_string()));
        }
        self.storage.import_snapshot(snapshot).await
    }

    pub async fn import_cache_json(&self, json: &str) -> Result<()> {
        let snapshot: CacheSnapshot = serde_json::from_str(json)?;
        self.import_cache(&snapshot).await
    }

    /// 清空缓存和离线队列
    pub async fn clear_all_cache(&self) -> Result<()> {
        if self.engine.state() == SyncState::Syncing {
            return Err(FragmentsSDKError::InvalidArgument("回放进行中，不能清空缓存".to_string()));
        }
        let pending = self.storage.queue().count().await?;
        if pending > 0 {
            warn!("清空缓存会丢弃 {} 条尚未回放的离线变更", pending);
        }
        self.storage.clear_all().await
    }

    /// 按保留天数清理过期内容缓存
    pub async fn prune_cache(&self) -> Result<usize> {
        let days = self.config.sync_config.content_retention_days;
        self.storage.prune(Duration::from_secs(days.saturating_mul(24 * 60 * 60))).await
    }

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        self.storage.stats().await
    }

    /// 停止后台任务
    pub async fn shutdown(&self) {
        self.stop_network_monitor().await;
        self.engine.status().log_status().await;
        info!("FragmentsSDK 已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ManualNetworkListener;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use serde_json::json;
    use tempfile::TempDir;

    fn fragment_json(id: &str, content_type: &str, size: u64) -> serde_json::Value {
        json!({
            "id": id,
            "ownerId": "owner-hash",
            "type": content_type,
            "size": size,
            "created": "2021-11-02T15:09:50.403Z",
            "updated": "2021-11-02T15:09:50.403Z"
        })
    }

    fn test_config(server: &MockServer) -> FragmentsConfig {
        FragmentsConfig::builder()
            .api_url(server.base_url())
            .in_memory(true)
            .token("user:pass")
            .owner_id("owner-hash")
            .http_client_config(HttpClientConfig {
                connect_timeout_secs: Some(2),
                request_timeout_secs: Some(5),
            })
            .build()
    }

    async fn wait_for_state(sdk: &FragmentsSDK, expected: SyncState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while sdk.sync_state() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = FragmentsConfig::builder()
            .api_url("https://fragments.example.com")
            .data_dir("/tmp/fragments")
            .max_replay_attempts(5)
            .build();
        assert_eq!(config.api_url, "https://fragments.example.com");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/fragments"));
        assert_eq!(config.sync_config.max_replay_attempts, 5);
        assert_eq!(config.sync_config.content_retention_days, 30);
        assert!(config.token.is_none());
        assert!(FragmentsSDK::validate_config(&config).is_ok());

        let json = serde_json::to_string(&config).unwrap();
        let back: FragmentsConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sync_config, config.sync_config);
    }

    #[test]
    fn test_validate_config_rejects_bad_values() {
        let base = FragmentsConfig::builder().api_url("http://localhost:8080").in_memory(true);

        let mut config = base.build();
        config.api_url = String::new();
        assert!(matches!(
            FragmentsSDK::validate_config(&config),
            Err(FragmentsSDKError::Config(_))
        ));

        config.api_url = "localhost:8080".to_string();
        assert!(FragmentsSDK::validate_config(&config).is_err());

        config.api_url = "http://localhost:8080".to_string();
        config.http_client_config.request_timeout_secs = Some(0);
        assert!(FragmentsSDK::validate_config(&config).is_err());

        config.http_client_config = HttpClientConfig::default();
        config.sync_config.max_replay_attempts = 0;
        assert!(FragmentsSDK::validate_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_online_create_and_load() {
        let server = MockServer::start_async().await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/fragments")
                    .header("content-type", "text/plain")
                    .header("authorization", "Basic dXNlcjpwYXNz")
                    .body("hello");
                then.status(201)
                    .json_body(json!({ "status": "ok", "fragment": fragment_json("f1", "text/plain", 5) }));
            })
            .await;
        let list = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/fragments").query_param("expand", "1");
                then.status(200).json_body(json!({
                    "status": "ok",
                    "fragments": [fragment_json("f1", "text/plain", 5)]
                }));
            })
            .await;

        let sdk = FragmentsSDK::initialize(test_config(&server)).await.unwrap();
        let created = sdk.create_fragment("text/plain", "hello").await.unwrap();
        assert_eq!(created.id, "f1");
        create.assert_async().await;

        let fragments = sdk.load_fragments().await.unwrap();
        assert_eq!(fragments.len(), 1);
        list.assert_async().await;

        // 写入时已缓存内容
        let stats = sdk.cache_stats().await.unwrap();
        assert_eq!(stats.fragment_count, 1);
        assert_eq!(stats.content_count, 1);
        assert_eq!(stats.pending_mutations, 0);
    }

    #[tokio::test]
    async fn test_offline_create_replayed_on_reconnect() {
        let server = MockServer::start_async().await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/fragments").body("offline note");
                then.status(201)
                    .json_body(json!({ "status": "ok", "fragment": fragment_json("srv-1", "text/plain", 12) }));
            })
            .await;
        let list = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/fragments").query_param("expand", "1");
                then.status(200).json_body(json!({
                    "status": "ok",
                    "fragments": [fragment_json("srv-1", "text/plain", 12)]
                }));
            })
            .await;

        let sdk = FragmentsSDK::initialize(test_config(&server)).await.unwrap();
        assert!(sdk.set_network_status(NetworkStatus::Offline).await.is_none());
        let local = sdk.create_fragment("text/plain", "offline note").await.unwrap();
        assert!(local.is_local());
        assert_eq!(local.owner_id, "owner-hash");
        assert_eq!(sdk.pending_count().await.unwrap(), 1);
        assert_eq!(create.hits_async().await, 0);

        let report = sdk.set_network_status(NetworkStatus::Online).await.unwrap();
        assert_eq!(report.replayed, 1);
        assert!(report.is_complete());
        create.assert_async().await;
        list.assert_async().await;

        assert_eq!(sdk.pending_count().await.unwrap(), 0);
        sdk.set_network_status(NetworkStatus::Offline).await;
        assert_eq!(
            sdk.get_fragment_content("srv-1").await.unwrap().as_text(),
            Some("offline note")
        );
        let status = sdk.sync_status().await;
        assert_eq!(status.stats.queued, 1);
        assert_eq!(status.stats.replayed, 1);
    }

    #[tokio::test]
    async fn test_prune_cache_with_unbounded_retention_keeps_content() {
        let server = MockServer::start_async().await;
        let mut config = test_config(&server);
        config.sync_config.content_retention_days = u64::MAX;
        let sdk = FragmentsSDK::initialize(config).await.unwrap();
        sdk.set_network_status(NetworkStatus::Offline).await;
        sdk.create_fragment("text/plain", "keep me").await.unwrap();

        assert_eq!(sdk.prune_cache().await.unwrap(), 0);
        assert_eq!(sdk.cache_stats().await.unwrap().content_count, 1);
    }

    #[tokio::test]
    async fn test_export_import_cache() {
        let server = MockServer::start_async().await;
        let source = FragmentsSDK::initialize(test_config(&server)).await.unwrap();
        source.set_network_status(NetworkStatus::Offline).await;
        source.create_fragment("application/json", "{\"a\":1}").await.unwrap();
        source.create_fragment("text/plain", "two").await.unwrap();
        let json = source.export_cache_json().await.unwrap();

        let target = FragmentsSDK::initialize(test_config(&server)).await.unwrap();
        target.set_network_status(NetworkStatus::Offline).await;
        target.create_fragment("text/plain", "discarded by import").await.unwrap();
        target.import_cache_json(&json).await.unwrap();

        let stats = target.cache_stats().await.unwrap();
        assert_eq!(stats.fragment_count, 2);
        assert_eq!(stats.content_count, 2);
        assert_eq!(stats.pending_mutations, 2);
        assert_eq!(target.export_cache().await.unwrap(), source.export_cache().await.unwrap());

        target.clear_all_cache().await.unwrap();
        assert_eq!(target.cache_stats().await.unwrap(), CacheStats::default());
        assert!(target.import_cache_json("not json").await.is_err());
    }

    #[tokio::test]
    async fn test_pending_mutations_persist_across_sessions() {
        let server = MockServer::start_async().await;
        let dir = TempDir::new().unwrap();
        let config = FragmentsConfig {
            in_memory: false,
            data_dir: dir.path().to_path_buf(),
            ..test_config(&server)
        };

        {
            let sdk = FragmentsSDK::initialize(config.clone()).await.unwrap();
            sdk.set_network_status(NetworkStatus::Offline).await;
            sdk.create_fragment("text/markdown", "# kept").await.unwrap();
            sdk.delete_fragment("old-id").await.unwrap();
        }

        let sdk = FragmentsSDK::initialize(config).await.unwrap();
        let pending = sdk.pending_mutations().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].sequence_id < pending[1].sequence_id);
        sdk.set_network_status(NetworkStatus::Offline).await;
        let cached = sdk.load_fragments().await.unwrap();
        assert_eq!(cached.len(), 1);
        assert!(cached[0].is_local());
    }

    #[tokio::test]
    async fn test_network_monitor_drives_engine() {
        let server = MockServer::start_async().await;
        let list = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/fragments");
                then.status(200).json_body(json!({ "status": "ok", "fragments": [] }));
            })
            .await;

        let sdk = FragmentsSDK::initialize(test_config(&server)).await.unwrap();
        let listener = Arc::new(ManualNetworkListener::new(NetworkStatus::Offline));
        let monitor = sdk.start_network_monitor(Some(listener.clone())).await.unwrap();
        assert_eq!(monitor.get_status().await, NetworkStatus::Offline);
        wait_for_state(&sdk, SyncState::Offline).await;

        sdk.create_fragment("text/plain", "queued").await.unwrap();
        assert_eq!(sdk.pending_count().await.unwrap(), 1);

        // 服务器 POST 没有 mock，回放会失败但仍会回到在线状态
        listener.report(NetworkStatus::Online).await;
        wait_for_state(&sdk, SyncState::Online).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while list.hits_async().await == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sdk.pending_count().await.unwrap(), 1);

        sdk.shutdown().await;
    }
}
