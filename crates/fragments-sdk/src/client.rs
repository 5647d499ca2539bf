//! 远端 Fragment 接口抽象
//!
//! 同步引擎只依赖 [`RemoteFragmentClient`]，真实实现见 `http_client`，
//! 测试里可以换成计数用的假实现。

use std::fmt::Debug;

use bytes::Bytes;

use crate::error::Result;
use crate::storage::entities::{FragmentData, FragmentMetadata};

/// `GET /v1/fragments` 的返回，取决于是否带 `expand=1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentList {
    Ids(Vec<String>),
    Expanded(Vec<FragmentMetadata>),
}

impl FragmentList {
    pub fn len(&self) -> usize {
        match self {
            FragmentList::Ids(ids) => ids.len(),
            FragmentList::Expanded(fragments) => fragments.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 展开形式的元数据；只有 id 时返回 `None`
    pub fn into_expanded(self) -> Option<Vec<FragmentMetadata>> {
        match self {
            FragmentList::Expanded(fragments) => Some(fragments),
            FragmentList::Ids(_) => None,
        }
    }
}

/// 请求凭证
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
}

impl Credentials {
    /// 含 `:` 的 token 视为 `user:password` 形式的 Basic 凭证，否则是 Bearer token
    pub fn from_token(token: &str) -> Self {
        match token.split_once(':') {
            Some((username, password)) => Credentials::Basic {
                username: username.to_string(),
                password: password.to_string(),
            },
            None => Credentials::Bearer(token.to_string()),
        }
    }
}

// 手写 Debug，避免密码和 token 出现在日志里
impl Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Credentials::Bearer(_) => f.debug_tuple("Bearer").field(&"***").finish(),
        }
    }
}

/// 远端 Fragment API
///
/// 每个方法对应一次请求/响应，不做重试；失败按状态码映射到 [`crate::FragmentsSDKError`]。
#[async_trait::async_trait]
pub trait RemoteFragmentClient: Debug + Send + Sync {
    async fn list(&self, expand: bool) -> Result<FragmentList>;
    async fn get_content(&self, id: &str) -> Result<FragmentData>;
    async fn get_metadata(&self, id: &str) -> Result<FragmentMetadata>;
    async fn create(&self, content_type: &str, content: Bytes) -> Result<FragmentMetadata>;
    async fn update(&self, id: &str, content: Bytes, target_type: &str) -> Result<FragmentMetadata>;
    async fn delete(&self, id: &str) -> Result<()>;
    /// 按扩展名取转换后的内容，例如 `md` -> `html`
    async fn convert(&self, id: &str, extension: &str) -> Result<FragmentData>;
    /// 连通性探测，从不返回错误
    async fn ping(&self) -> bool;
}
