/// 同步引擎
///
/// 职责：
/// - 按 Online / Offline / Syncing 状态路由读写
/// - 离线写入队列并乐观更新本地缓存
/// - 恢复连接后按 sequence_id 顺序逐条回放，之后刷新一次列表
///
/// 同一时刻最多只有一轮回放，重复的恢复信号直接忽略。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::client::RemoteFragmentClient;
use crate::error::{FragmentsSDKError, Result};
use crate::events::{EventManager, SDKEvent};
use crate::network::{NetworkStatus, NetworkStatusEvent};
use crate::sdk::SyncConfig;
use crate::storage::entities::{
    is_local_id, new_local_id, FragmentData, FragmentMetadata, MutationAction, MutationKind, PendingMutation,
};
use crate::storage::{LocalFragmentStore, OfflineQueue};
use crate::sync::replay::{self, classify, Applied, ReplayOutcome};
use crate::sync::{SyncReport, SyncState};
use crate::sync_status::SyncStatusManager;

/// 同步引擎
#[derive(Debug)]
pub struct SyncEngine {
    store: Arc<dyn LocalFragmentStore>,
    queue: Arc<dyn OfflineQueue>,
    client: Arc<dyn RemoteFragmentClient>,
    events: Arc<EventManager>,
    status: SyncStatusManager,
    max_replay_attempts: u32,
    /// 离线创建条目使用的 owner id
    owner_id: String,

    state: RwLock<SyncState>,
    /// 最近一次收到的连通性信号；回放结束时据此决定进入 Online 还是 Offline
    connected: AtomicBool,
    /// 回放锁，持有期间状态为 Syncing
    drain_lock: Mutex<()>,
}

impl SyncEngine {
    /// 创建同步引擎，初始状态为 Online
    pub fn new(
        store: Arc<dyn LocalFragmentStore>,
        queue: Arc<dyn OfflineQueue>,
        client: Arc<dyn RemoteFragmentClient>,
        events: Arc<EventManager>,
        config: &SyncConfig,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            client,
            events,
            status: SyncStatusManager::new(SyncState::Online),
            max_replay_attempts: config.max_replay_attempts.max(1),
            owner_id: owner_id.into(),
            state: RwLock::new(SyncState::Online),
            connected: AtomicBool::new(true),
            drain_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> &SyncStatusManager {
        &self.status
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.queue.count().await
    }

    /// 队列中尚未回放的变更，按 sequence_id 升序
    pub async fn pending_mutations(&self) -> Result<Vec<PendingMutation>> {
        self.queue.drain().await
    }

    // ========== 读 ==========

    /// 加载 fragment 列表
    ///
    /// Online 时从服务器拉取并刷新缓存；Offline 只读缓存；
    /// Syncing 时也只读缓存，回放结束后会自己刷新一次。
    pub async fn load_fragments(&self) -> Result<Vec<FragmentMetadata>> {
        match self.state() {
            SyncState::Online => self.refresh().await,
            SyncState::Offline | SyncState::Syncing => self.store.list(None).await,
        }
    }

    /// 获取 fragment 内容
    pub async fn get_fragment_content(&self, id: &str) -> Result<FragmentData> {
        if self.state() == SyncState::Offline || is_local_id(id) {
            return self
                .store
                .get_content(id)
                .await?
                .ok_or_else(|| FragmentsSDKError::NotFound(format!("本地缓存中没有 fragment {} 的内容", id)));
        }

        let data = self.client.get_content(id).await?;
        if let Err(e) = self.store.put_content(id, &data).await {
            warn!("写入内容缓存失败: id={}, error={}", id, e);
        }
        Ok(data)
    }

    /// 获取 fragment 元数据
    pub async fn get_fragment_info(&self, id: &str) -> Result<FragmentMetadata> {
        if self.state() == SyncState::Offline || is_local_id(id) {
            return self
                .store
                .get(id)
                .await?
                .ok_or_else(|| FragmentsSDKError::NotFound(format!("本地缓存中没有 fragment {}", id)));
        }

        let fragment = self.client.get_metadata(id).await?;
        if let Err(e) = self.store.put(&fragment).await {
            warn!("写入元数据缓存失败: id={}, error={}", id, e);
        }
        Ok(fragment)
    }

    /// 按扩展名获取转换后的内容，只能在线使用
    pub async fn convert_fragment(&self, id: &str, extension: &str) -> Result<FragmentData> {
        if self.state() == SyncState::Offline {
            return Err(FragmentsSDKError::Network("当前处于离线状态，无法转换".to_string()));
        }
        self.client.convert(id, extension).await
    }

    // ========== 写 ==========

    /// 非 Online 状态写入队列；针对尚未回放的离线条目的写操作也排在队列里，保证顺序
    fn should_queue(&self, fragment_id: Option<&str>) -> bool {
        self.state() != SyncState::Online || fragment_id.map_or(false, is_local_id)
    }

    /// 创建 fragment
    ///
    /// 离线时返回的元数据使用 `local-` 开头的临时 id，回放成功后缓存中换成服务器 id。
    pub async fn create_fragment(&self, content_type: &str, content: Bytes) -> Result<FragmentMetadata> {
        if content_type.trim().is_empty() {
            return Err(FragmentsSDKError::InvalidArgument("content type 不能为空".to_string()));
        }
        let data = FragmentData::new(content_type, content.clone());

        if !self.should_queue(None) {
            let fragment = self.client.create(content_type, content).await?;
            self.cache(&fragment, Some(&data)).await;
            return Ok(fragment);
        }

        let local_id = new_local_id();
        let sequence_id = self
            .queue
            .enqueue(MutationAction::Create {
                local_id: local_id.clone(),
                content_type: content_type.to_string(),
                content: content.to_vec(),
            })
            .await?;
        let fragment = FragmentMetadata::local(
            local_id,
            self.owner_id.clone(),
            content_type.to_string(),
            content.len() as u64,
        );
        self.cache(&fragment, Some(&data)).await;
        self.after_enqueue(sequence_id, MutationKind::Create, &fragment.id).await;
        Ok(fragment)
    }

    /// 更新 fragment 内容，`target_type` 与原类型不同时由服务器转换
    pub async fn update_fragment(&self, id: &str, content: Bytes, target_type: &str) -> Result<FragmentMetadata> {
        if id.is_empty() || target_type.trim().is_empty() {
            return Err(FragmentsSDKError::InvalidArgument("fragment id 和 content type 不能为空".to_string()));
        }
        let data = FragmentData::new(target_type, content.clone());

        if !self.should_queue(Some(id)) {
            let fragment = self.client.update(id, content, target_type).await?;
            self.cache(&fragment, Some(&data)).await;
            return Ok(fragment);
        }

        let sequence_id = self
            .queue
            .enqueue(MutationAction::Update {
                fragment_id: id.to_string(),
                content: content.to_vec(),
                target_type: target_type.to_string(),
            })
            .await?;

        let size = content.len() as u64;
        let fragment = match self.store.get(id).await {
            Ok(Some(mut cached)) => {
                cached.content_type = target_type.to_string();
                cached.size = size;
                cached.updated = Utc::now();
                cached
            }
            _ => FragmentMetadata::local(id.to_string(), self.owner_id.clone(), target_type.to_string(), size),
        };
        self.cache(&fragment, Some(&data)).await;
        self.after_enqueue(sequence_id, MutationKind::Update, id).await;
        Ok(fragment)
    }

    /// 删除 fragment
    pub async fn delete_fragment(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(FragmentsSDKError::InvalidArgument("fragment id 不能为空".to_string()));
        }

        if !self.should_queue(Some(id)) {
            self.client.delete(id).await?;
            self.uncache(id).await;
            return Ok(());
        }

        let sequence_id = self
            .queue
            .enqueue(MutationAction::Delete {
                fragment_id: id.to_string(),
            })
            .await?;
        self.uncache(id).await;
        self.after_enqueue(sequence_id, MutationKind::Delete, id).await;
        Ok(())
    }

    async fn after_enqueue(&self, sequence_id: u64, kind: MutationKind, fragment_id: &str) {
        info!("📥 离线变更已记录: seq={}, action={}, fragment={}", sequence_id, kind, fragment_id);
        self.status.record_queued().await;
        self.events
            .emit(SDKEvent::mutation_queued(sequence_id, kind, fragment_id))
            .await;

        // 在线时入队的条目（离线条目的后续写操作，或回放刚好结束）不会等到下次恢复信号
        if self.state() == SyncState::Online {
            match self.sync_now().await {
                Ok(Some(report)) => debug!("入队后立即回放: 回放 {} 条, 剩余 {} 条", report.replayed, report.remaining),
                Ok(None) => {}
                Err(e) => debug!("入队后未能立即回放: {}", e),
            }
        }
    }

    /// 缓存只是副本，写失败只记日志
    async fn cache(&self, fragment: &FragmentMetadata, data: Option<&FragmentData>) {
        let result = match data {
            Some(data) => match self.store.put(fragment).await {
                Ok(()) => self.store.put_content(&fragment.id, data).await,
                Err(e) => Err(e),
            },
            None => self.store.put(fragment).await,
        };
        if let Err(e) = result {
            warn!("写入本地缓存失败: id={}, error={}", fragment.id, e);
        }
    }

    async fn uncache(&self, id: &str) {
        if let Err(e) = self.store.remove(id).await {
            warn!("删除本地缓存失败: id={}, error={}", id, e);
        }
    }

    // ========== 连通性 ==========

    async fn set_connected(&self, online: bool) {
        if self.connected.swap(online, Ordering::SeqCst) != online {
            let (old, new) = if online {
                (NetworkStatus::Offline, NetworkStatus::Online)
            } else {
                (NetworkStatus::Online, NetworkStatus::Offline)
            };
            self.events.emit(SDKEvent::connectivity_changed(old, new)).await;
        }
    }

    /// 在状态锁内完成一次状态迁移，返回实际发生的变化
    fn transition<F>(&self, decide: F) -> Option<(SyncState, SyncState)>
    where
        F: FnOnce(SyncState) -> Option<SyncState>,
    {
        let mut state = self.state.write();
        let next = decide(*state)?;
        let old = std::mem::replace(&mut *state, next);
        (old != next).then_some((old, next))
    }

    async fn announce(&self, change: Option<(SyncState, SyncState)>) {
        if let Some((old, new)) = change {
            info!("同步状态变化: {} -> {}", old, new);
            self.status.set_state(new).await;
            self.events.emit(SDKEvent::sync_state_changed(old, new)).await;
        }
    }

    /// 网络断开
    ///
    /// 回放进行中不打断，回放结束后再进入 Offline。
    pub async fn on_connectivity_lost(&self) {
        self.set_connected(false).await;
        let change = self.transition(|state| match state {
            SyncState::Syncing => None,
            _ => Some(SyncState::Offline),
        });
        if self.state() == SyncState::Syncing {
            info!("回放进行中收到断网信号，回放结束后进入离线状态");
        }
        self.announce(change).await;
    }

    /// 网络恢复，回放离线队列
    ///
    /// 已经在回放或本来就在线时返回 `None`。
    pub async fn on_connectivity_restored(&self) -> Option<SyncReport> {
        self.set_connected(true).await;
        self.resume().await
    }

    async fn resume(&self) -> Option<SyncReport> {
        let mut last_report = None;
        loop {
            let Ok(_guard) = self.drain_lock.try_lock() else {
                debug!("回放正在进行，忽略重复的恢复信号");
                break;
            };
            let change = self.transition(|state| {
                (state == SyncState::Offline && self.is_connected()).then_some(SyncState::Syncing)
            });
            if change.is_none() {
                break;
            }
            self.announce(change).await;
            last_report = Some(self.drain().await);
            drop(_guard);

            // 回放期间网络断开后又恢复，恢复信号被上面的锁挡掉了，这里补一轮
            if !(self.state() == SyncState::Offline && self.is_connected()) {
                break;
            }
            debug!("回放期间网络状态有变化，重新回放");
        }
        match last_report {
            Some(report) => Some(self.drain_leftovers(report).await),
            None => None,
        }
    }

    /// 回放锁释放后仍在线且队列里还有新条目时继续回放
    ///
    /// 回放本身出错时不重试，剩下的条目等下一次触发。
    async fn drain_leftovers(&self, mut report: SyncReport) -> SyncReport {
        while report.error.is_none()
            && self.state() == SyncState::Online
            && self.queue.count().await.map_or(false, |count| count > 0)
        {
            debug!("回放结束后队列中又有新条目，继续回放");
            match self.drain_online().await {
                Some(next) => report.merge(next),
                None => break,
            }
        }
        report
    }

    /// 在线状态下拿到回放锁后回放一轮，已有回放进行时返回 `None`
    async fn drain_online(&self) -> Option<SyncReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            return None;
        };
        let change = self.transition(|state| (state == SyncState::Online).then_some(SyncState::Syncing));
        if change.is_none() {
            return None;
        }
        self.announce(change).await;
        Some(self.drain().await)
    }

    /// 在线时手动触发一次回放，例如上次回放中断后的重试
    pub async fn sync_now(&self) -> Result<Option<SyncReport>> {
        if self.state() == SyncState::Offline {
            return Err(FragmentsSDKError::Network("当前处于离线状态，无法同步".to_string()));
        }
        match self.drain_online().await {
            Some(report) => Ok(Some(self.drain_leftovers(report).await)),
            None => Ok(None),
        }
    }

    /// 消费网络状态事件，直到通道关闭
    pub async fn run_connectivity_loop(self: Arc<Self>, mut receiver: broadcast::Receiver<NetworkStatusEvent>) {
        info!("同步引擎开始监听网络状态");
        loop {
            match receiver.recv().await {
                Ok(event) => match event.new_status {
                    NetworkStatus::Offline => self.on_connectivity_lost().await,
                    NetworkStatus::Online => {
                        // 先同步记下连通性，后续的断网事件才能正确覆盖它
                        self.set_connected(true).await;
                        let engine = self.clone();
                        tokio::spawn(async move {
                            engine.resume().await;
                        });
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("网络状态事件积压，跳过 {} 条", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("网络状态通道已关闭，停止监听");
                    break;
                }
            }
        }
    }

    // ========== 回放 ==========

    /// 调用方持有回放锁且状态已切到 Syncing
    async fn drain(&self) -> SyncReport {
        let pending = self.queue.count().await.unwrap_or_default();
        info!("🔄 开始回放离线队列: {} 条待回放", pending);
        self.events.emit(SDKEvent::sync_started(pending)).await;

        let mut report = SyncReport::default();
        loop {
            if let Err(e) = self.replay_queue(&mut report).await {
                warn!("离线队列回放中断: {}", e);
                report.error = Some(e.to_string());
            }

            // 不管回放是否完整，都刷新一次列表
            match self.refresh().await {
                Ok(fragments) => {
                    report.refreshed = true;
                    debug!("回放后刷新列表: {} 条", fragments.len());
                }
                Err(e) => {
                    report.refreshed = false;
                    warn!("回放后刷新列表失败: {}", e);
                }
            }

            // 刷新期间仍处于 Syncing，这时的写操作进了队列
            let arrived = self.queue.count().await.map_or(false, |count| count > 0);
            if report.error.is_some() || !arrived || !self.is_connected() {
                break;
            }
            debug!("刷新期间有新的离线变更入队，继续回放");
        }

        report.remaining = match self.queue.count().await {
            Ok(count) => count,
            Err(e) => {
                warn!("读取队列长度失败: {}", e);
                pending.saturating_sub(report.replayed + report.discarded)
            }
        };

        let change = self.transition(|_| {
            Some(if self.is_connected() {
                SyncState::Online
            } else {
                SyncState::Offline
            })
        });
        self.announce(change).await;
        self.status.record_report(&report).await;

        if let Some(error) = &report.error {
            self.events.emit(SDKEvent::sync_failed(error, report.remaining)).await;
        }
        info!(
            "✅ 离线队列回放结束: 回放 {} 条, 丢弃 {} 条, 剩余 {} 条",
            report.replayed, report.discarded, report.remaining
        );
        self.events.emit(SDKEvent::sync_completed(report.clone())).await;
        report
    }

    /// 逐条回放直到队列为空或遇到需要停下的错误
    ///
    /// 回放期间新入队的条目也会在本轮处理。
    async fn replay_queue(&self, report: &mut SyncReport) -> Result<()> {
        'reload: loop {
            let batch = self.queue.drain().await?;
            if batch.is_empty() {
                return Ok(());
            }
            for entry in batch {
                let is_create = entry.kind() == MutationKind::Create;
                self.replay_one(entry, report).await?;
                // create 之后的条目可能已被改写为服务器 id，重新读取队列
                if is_create {
                    continue 'reload;
                }
            }
        }
    }

    async fn replay_one(&self, entry: PendingMutation, report: &mut SyncReport) -> Result<()> {
        let sequence_id = entry.sequence_id;
        let kind = entry.kind();
        debug!(
            "回放离线变更: seq={}, action={}, fragment={}",
            sequence_id,
            kind,
            entry.action.fragment_id()
        );

        match replay::dispatch(self.client.as_ref(), &entry.action).await {
            Ok(applied) => {
                let fragment_id = self.apply_replayed(&entry, applied).await?;
                report.replayed += 1;
                self.status.record_replayed().await;
                self.events
                    .emit(SDKEvent::mutation_replayed(sequence_id, kind, &fragment_id))
                    .await;
                Ok(())
            }
            Err(error) => {
                let message = error.to_string();
                let attempts = self.queue.record_failure(sequence_id, &message).await?;
                self.status.record_failure(&message).await;

                if classify(&error) == ReplayOutcome::Permanent && attempts >= self.max_replay_attempts {
                    warn!(
                        "离线变更多次失败，已丢弃: seq={}, action={}, attempts={}, error={}",
                        sequence_id, kind, attempts, message
                    );
                    self.queue.remove(sequence_id).await?;
                    self.discarded(&entry, &message, report).await;
                    if let MutationAction::Create { local_id, .. } = &entry.action {
                        self.uncache(local_id).await;
                        self.discard_dependents(local_id, report).await?;
                    }
                    return Ok(());
                }
                Err(error)
            }
        }
    }

    async fn discarded(&self, entry: &PendingMutation, reason: &str, report: &mut SyncReport) {
        report.discarded += 1;
        self.status.record_discarded().await;
        self.events
            .emit(SDKEvent::mutation_discarded(
                entry.sequence_id,
                entry.kind(),
                entry.action.fragment_id(),
                reason,
            ))
            .await;
    }

    /// 离线创建被丢弃后，指向它临时 id 的后续变更永远无法成功，一并丢弃
    async fn discard_dependents(&self, local_id: &str, report: &mut SyncReport) -> Result<()> {
        let reason = format!("依赖的离线创建已被丢弃: {}", local_id);
        for entry in self.queue.drain().await? {
            if entry.kind() == MutationKind::Create || entry.action.fragment_id() != local_id {
                continue;
            }
            warn!(
                "丢弃依赖的离线变更: seq={}, action={}, fragment={}",
                entry.sequence_id,
                entry.kind(),
                local_id
            );
            self.queue.remove(entry.sequence_id).await?;
            self.discarded(&entry, &reason, report).await;
        }
        Ok(())
    }

    /// 回放成功后推进队列并更新缓存，返回服务器上的 fragment id
    async fn apply_replayed(&self, entry: &PendingMutation, applied: Applied) -> Result<String> {
        let sequence_id = entry.sequence_id;
        match (&entry.action, applied) {
            (
                MutationAction::Create {
                    local_id,
                    content_type,
                    content,
                },
                Applied::Created(fragment),
            ) => {
                // 先改写后续条目的目标 id，再移除本条
                let retargeted = self.queue.retarget(local_id, &fragment.id).await?;
                self.queue.remove(sequence_id).await?;
                if retargeted > 0 {
                    debug!("{} 条后续变更改指向服务器 id: {} -> {}", retargeted, local_id, fragment.id);
                }
                self.uncache(local_id).await;
                let data = FragmentData::new(content_type.clone(), content.clone());
                self.cache(&fragment, Some(&data)).await;
                Ok(fragment.id)
            }
            (
                MutationAction::Update {
                    content, target_type, ..
                },
                Applied::Updated(fragment),
            ) => {
                self.queue.remove(sequence_id).await?;
                let data = FragmentData::new(target_type.clone(), content.clone());
                self.cache(&fragment, Some(&data)).await;
                Ok(fragment.id)
            }
            (action, applied) => {
                if applied == Applied::AlreadyDeleted {
                    debug!("服务器上已不存在 {}，视为删除成功", action.fragment_id());
                }
                self.queue.remove(sequence_id).await?;
                self.uncache(action.fragment_id()).await;
                Ok(action.fragment_id().to_string())
            }
        }
    }

    /// 用服务器列表替换缓存，尚未回放的离线创建条目保留
    async fn refresh(&self) -> Result<Vec<FragmentMetadata>> {
        let mut fragments = self
            .client
            .list(true)
            .await?
            .into_expanded()
            .ok_or_else(|| FragmentsSDKError::Serialization("服务器返回了未展开的列表".to_string()))?;
        let pending_local = self
            .store
            .list(None)
            .await?
            .into_iter()
            .filter(FragmentMetadata::is_local);
        fragments.extend(pending_local);
        self.store.replace_all(&fragments).await?;
        Ok(fragments)
    }
}
