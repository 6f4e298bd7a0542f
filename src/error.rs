//! 错误类型

use thiserror::Error;

/// 远端 API 错误
#[derive(Debug, Error)]
pub enum RemoteError {
    /// 变更游标已失效（变更流过期），需要全量枚举
    #[error("delta cursor is no longer valid")]
    CursorInvalid,

    #[error("remote item not found: {0}")]
    NotFound(String),

    /// 网络、限流、服务端 5xx 等可重试错误
    #[error("transient remote error: {0}")]
    Transient(String),

    #[error("remote error: {0}")]
    Permanent(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

impl From<opendal::Error> for RemoteError {
    fn from(e: opendal::Error) -> Self {
        match e.kind() {
            opendal::ErrorKind::NotFound => RemoteError::NotFound(e.to_string()),
            opendal::ErrorKind::RateLimited => RemoteError::Transient(e.to_string()),
            _ if e.is_temporary() => RemoteError::Transient(e.to_string()),
            _ => RemoteError::Permanent(e.to_string()),
        }
    }
}

/// 同步过程中的错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 状态库读写失败，对当前轮次是致命的
    #[error("state store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("state store migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("a pass is already running for drive {0}")]
    PassInProgress(String),

    #[error("pass cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    /// 单个传输失败（已重试），条目留待下一轮
    #[error("transfer failed for {path}: {reason}")]
    Transfer { path: String, reason: String },
}

impl SyncError {
    /// 致命错误会中止整轮且不推进游标
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Store(_) | SyncError::Migrate(_) | SyncError::Cancelled
        )
    }

    pub fn transfer(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        SyncError::Transfer {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_fatal() {
        assert!(SyncError::Store(sqlx::Error::RowNotFound).is_fatal());
        assert!(!SyncError::transfer("a.txt", "timeout").is_fatal());
        assert!(!SyncError::Remote(RemoteError::CursorInvalid).is_fatal());
    }

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Transient("503".into()).is_transient());
        assert!(!RemoteError::NotFound("x".into()).is_transient());
    }
}
