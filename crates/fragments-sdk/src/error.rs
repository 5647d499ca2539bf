use thiserror::Error;

/// SDK 统一错误类型
///
/// 同步引擎按错误种类决定队列条目保留、重试还是丢弃。
#[derive(Debug, Error)]
pub enum FragmentsSDKError {
    /// 网络不可达或请求超时
    #[error("Network error: {0}")]
    Network(String),
    /// 凭证被拒绝（401/403）
    #[error("Authentication error: {0}")]
    Auth(String),
    /// 服务器不认识该 fragment id（404）
    #[error("Not found: {0}")]
    NotFound(String),
    /// 不支持的类型转换（415）
    #[error("Unsupported conversion: {0}")]
    UnsupportedConversion(String),
    /// 本地持久化失败
    #[error("Storage error: {0}")]
    Storage(String),
    /// 服务器内部错误（5xx）
    #[error("Server error [{status}]: {message}")]
    Server { status: u16, message: String },
    /// 其它非 2xx 响应
    #[error("Request rejected [{status}]: {message}")]
    Rejected { status: u16, message: String },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Config error: {0}")]
    Config(String),
}

impl FragmentsSDKError {
    pub fn is_network(&self) -> bool {
        matches!(self, FragmentsSDKError::Network(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FragmentsSDKError::NotFound(_))
    }

    /// 暂时性错误：稍后重放可能成功，队列条目应保留
    ///
    /// 认证失败也算暂时性的，重新登录后可以继续回放。
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FragmentsSDKError::Network(_)
                | FragmentsSDKError::Auth(_)
                | FragmentsSDKError::Server { .. }
                | FragmentsSDKError::Storage(_)
        )
    }

    /// 根据 HTTP 状态码构造错误
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => FragmentsSDKError::Auth(message),
            404 => FragmentsSDKError::NotFound(message),
            415 => FragmentsSDKError::UnsupportedConversion(message),
            500..=599 => FragmentsSDKError::Server { status, message },
            _ => FragmentsSDKError::Rejected { status, message },
        }
    }
}

impl From<sled::Error> for FragmentsSDKError {
    fn from(error: sled::Error) -> Self {
        FragmentsSDKError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for FragmentsSDKError {
    fn from(error: serde_json::Error) -> Self {
        FragmentsSDKError::Serialization(error.to_string())
    }
}

impl From<bincode::Error> for FragmentsSDKError {
    fn from(error: bincode::Error) -> Self {
        FragmentsSDKError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for FragmentsSDKError {
    fn from(error: std::io::Error) -> Self {
        FragmentsSDKError::Storage(error.to_string())
    }
}

impl From<reqwest::Error> for FragmentsSDKError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            return FragmentsSDKError::Serialization(error.to_string());
        }
        if let Some(status) = error.status() {
            return FragmentsSDKError::from_status(status.as_u16(), error.to_string());
        }
        // 连接失败、超时、请求体发送失败都按网络错误处理
        FragmentsSDKError::Network(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FragmentsSDKError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            FragmentsSDKError::from_status(401, "x".into()),
            FragmentsSDKError::Auth(_)
        ));
        assert!(matches!(
            FragmentsSDKError::from_status(403, "x".into()),
            FragmentsSDKError::Auth(_)
        ));
        assert!(FragmentsSDKError::from_status(404, "x".into()).is_not_found());
        assert!(matches!(
            FragmentsSDKError::from_status(415, "x".into()),
            FragmentsSDKError::UnsupportedConversion(_)
        ));
        assert!(matches!(
            FragmentsSDKError::from_status(503, "x".into()),
            FragmentsSDKError::Server { status: 503, .. }
        ));
        assert!(matches!(
            FragmentsSDKError::from_status(400, "x".into()),
            FragmentsSDKError::Rejected { status: 400, .. }
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(FragmentsSDKError::Network("timeout".into()).is_transient());
        assert!(FragmentsSDKError::Storage("disk".into()).is_transient());
        assert!(!FragmentsSDKError::NotFound("f1".into()).is_transient());
        assert!(!FragmentsSDKError::UnsupportedConversion("png".into()).is_transient());
    }
}
