//! Fragments SDK - 支持离线使用的 Fragments 内容服务客户端
//!
//! 本 SDK 提供：
//! - 📡 Fragments REST API 的类型化访问（列表、内容、元数据、转换）
//! - 💾 基于 sled 的本地缓存，离线时照常读取
//! - 📥 离线变更队列，断网期间的创建/更新/删除按顺序记录
//! - 🔄 恢复连接后按顺序回放队列，再用服务器列表刷新缓存
//! - ⚙️ 事件系统：连通性、同步进度、变更回放结果
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use fragments_sdk::{FragmentsConfig, FragmentsSDK};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FragmentsConfig::builder()
//!         .api_url("http://localhost:8080")
//!         .data_dir("/path/to/data")
//!         .token("user1@email.com:password1")
//!         .build();
//!
//!     let sdk = FragmentsSDK::initialize(config).await?;
//!
//!     // 探测服务器可达性，断网时写操作自动进入离线队列
//!     sdk.start_network_monitor(None).await?;
//!
//!     let fragment = sdk.create_fragment("text/markdown", "# Hello").await?;
//!     println!("创建成功: {}", fragment.id);
//!
//!     for fragment in sdk.load_fragments().await? {
//!         println!("{} {} {}B", fragment.id, fragment.content_type, fragment.size);
//!     }
//!
//!     sdk.shutdown().await;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod version;
pub mod client;
pub mod http_client;
pub mod storage;
pub mod network;
pub mod events;
pub mod sync;
pub mod sync_status;
pub mod sdk;

// 重新导出核心类型，方便使用
pub use error::{FragmentsSDKError, Result};
pub use client::{Credentials, FragmentList, RemoteFragmentClient};
pub use http_client::HttpFragmentClient;
pub use sdk::{EventConfig, FragmentsConfig, FragmentsConfigBuilder, FragmentsSDK, HttpClientConfig, SyncConfig};
pub use storage::{
    CacheSnapshot, CacheStats, FragmentData, FragmentMetadata, LocalFragmentStore, MemoryFragmentStore,
    MemoryMutationQueue, MutationAction, MutationKind, OfflineQueue, PendingMutation, PersistentFragmentStore,
    PersistentMutationQueue, StorageManager,
};
pub use network::{ManualNetworkListener, NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener, PollingNetworkListener};
pub use events::{EventFilter, EventManager, SDKEvent};
pub use sync::{SyncEngine, SyncReport, SyncState};
pub use sync_status::{SyncStats, SyncStatus, SyncStatusManager};
pub use version::SDK_VERSION;
