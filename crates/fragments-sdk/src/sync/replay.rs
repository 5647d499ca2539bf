/// 单条离线变更的回放
///
/// 只负责把一条 `MutationAction` 发给服务器并给失败分类，
/// 队列的推进和缓存的更新由 `SyncEngine` 处理。

use bytes::Bytes;

use crate::client::RemoteFragmentClient;
use crate::error::{FragmentsSDKError, Result};
use crate::storage::entities::{FragmentMetadata, MutationAction};

/// 回放成功后服务器返回的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// 服务器新建了 fragment，id 可能和本地临时 id 不同
    Created(FragmentMetadata),
    Updated(FragmentMetadata),
    Deleted,
    /// 删除时服务器已经没有这个 fragment，视为已完成
    AlreadyDeleted,
}

/// 回放失败的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// 暂时性错误：保留条目，停止本次回放，下次再试
    Retry,
    /// 永久性错误：记录失败次数，达到上限后丢弃
    Permanent,
}

/// 给回放错误分类
pub fn classify(error: &FragmentsSDKError) -> ReplayOutcome {
    if error.is_transient() {
        ReplayOutcome::Retry
    } else {
        ReplayOutcome::Permanent
    }
}

/// 把一条变更发给服务器
pub async fn dispatch(client: &dyn RemoteFragmentClient, action: &MutationAction) -> Result<Applied> {
    match action {
        MutationAction::Create {
            content_type, content, ..
        } => client
            .create(content_type, Bytes::copy_from_slice(content))
            .await
            .map(Applied::Created),
        MutationAction::Update {
            fragment_id,
            content,
            target_type,
        } => client
            .update(fragment_id, Bytes::copy_from_slice(content), target_type)
            .await
            .map(Applied::Updated),
        MutationAction::Delete { fragment_id } => match client.delete(fragment_id).await {
            Ok(()) => Ok(Applied::Deleted),
            Err(e) if e.is_not_found() => Ok(Applied::AlreadyDeleted),
            Err(e) => Err(e),
        },
    }
}
