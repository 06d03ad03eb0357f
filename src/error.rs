use std::io;

/// 统一错误分类：描述调用方应该如何处理，而不是内部发生了什么。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// 本地存储访问被拒绝，需要用户授权后手动重试。
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// 网络连接或超时，可按退避策略重试。
    #[error("network failure: {0}")]
    NetworkFailure(String),
    /// 磁盘已满或写入失败。
    #[error("storage failure: {0}")]
    StorageFailure(String),
    /// 用户或生命周期主动取消，不向用户提示。
    #[error("cancelled")]
    Cancelled,
    /// 空选择或类型不一致的多选，属于调用方契约错误。
    #[error("illegal selection: {0}")]
    IllegalSelection(String),
    /// 设置值或账户配置不合法。
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("session signed out")]
    SignedOut,
    #[error("remote repository returned HTTP {status}: {message}")]
    Remote { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 将 HTTP 状态码映射到错误分类；context 会作为错误信息的一部分。
    pub fn from_status(status: u16, context: impl Into<String>) -> Self {
        let message = context.into();
        match status {
            401 => Error::SignedOut,
            403 => Error::PermissionDenied(message),
            404 | 410 => Error::NotFound(message),
            413 | 507 => Error::StorageFailure(message),
            408 | 425 | 429 | 500..=599 => Error::NetworkFailure(message),
            _ => Error::Remote { status, message },
        }
    }

    pub fn from_io(err: io::Error, context: impl AsRef<str>) -> Self {
        let message = format!("{}: {err}", context.as_ref());
        match err.kind() {
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(message),
            io::ErrorKind::NotFound => Error::NotFound(message),
            io::ErrorKind::Interrupted => Error::Cancelled,
            _ => Error::StorageFailure(message),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Error::StorageFailure(message.into())
    }

    pub fn illegal_selection(message: impl Into<String>) -> Self {
        Error::IllegalSelection(message.into())
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NetworkFailure(_))
    }

    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Error::Cancelled)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Error::from_status(status.as_u16(), err.to_string());
        }
        Error::NetworkFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(401, Error::SignedOut)]
    #[case(403, Error::PermissionDenied("ctx".into()))]
    #[case(404, Error::NotFound("ctx".into()))]
    #[case(503, Error::NetworkFailure("ctx".into()))]
    #[case(429, Error::NetworkFailure("ctx".into()))]
    #[case(507, Error::StorageFailure("ctx".into()))]
    #[case(409, Error::Remote { status: 409, message: "ctx".into() })]
    fn test_status_mapping(#[case] status: u16, #[case] expected: Error) {
        assert_eq!(Error::from_status(status, "ctx"), expected);
    }

    #[test]
    fn test_io_mapping() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(Error::from_io(denied, "open"), Error::PermissionDenied(_)));
        let full = io::Error::new(io::ErrorKind::Other, "disk full");
        assert!(matches!(Error::from_io(full, "write"), Error::StorageFailure(_)));
    }

    #[test]
    fn test_only_network_failures_retry() {
        assert!(Error::NetworkFailure("timeout".into()).is_retryable());
        assert!(!Error::PermissionDenied("x".into()).is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::Cancelled.is_user_visible());
        assert!(Error::StorageFailure("x".into()).is_user_visible());
    }
}
