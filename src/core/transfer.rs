//! 传输执行
//!
//! 字节搬运和重试都在这里；对调用方只报告成功或失败。

use crate::config::SyncSettings;
use crate::core::fingerprint::fingerprint_bytes;
use crate::error::{RemoteError, Result, SyncError};
use crate::remote::{RemoteDrive, RemoteItem};
use crate::storage::{LocalFs, LocalMeta};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// 单次操作超时
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            timeout: settings.transfer_timeout(),
        }
    }

    /// 不重试，用于测试
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            timeout: Duration::from_secs(30),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

/// 带指数退避的重试，只重试临时错误
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    cancel: &CancellationToken,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let outcome = match tokio::time::timeout(policy.timeout, f()).await {
            Ok(r) => r,
            Err(_) => Err(RemoteError::Transient(format!(
                "{} timed out after {:?}",
                operation, policy.timeout
            ))),
        };

        match outcome {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation, attempt, "重试后成功");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.base_delay * 2u32.pow(attempt);
                warn!(
                    "{} 失败，{:?} 后重试 ({}/{}): {}",
                    operation,
                    delay,
                    attempt + 1,
                    policy.max_retries,
                    e
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// 上传结果
#[derive(Debug, Clone)]
pub struct Uploaded {
    pub item: RemoteItem,
    pub fingerprint: String,
    pub local: LocalMeta,
}

/// 传输接口
#[async_trait]
pub trait Transfer: Send + Sync {
    /// 读取本地文件并上传到 `parent_id/name`
    async fn upload(
        &self,
        rel_path: &str,
        parent_id: &str,
        name: &str,
        existing_id: Option<&str>,
    ) -> Result<Uploaded>;

    /// 下载远端内容到内存，由调用方校验并写入
    async fn fetch(&self, remote_id: &str, rel_path: &str) -> Result<Vec<u8>>;
}

/// 基于远端驱动器和本地文件系统的传输实现
pub struct DriveTransfer {
    remote: Arc<dyn RemoteDrive>,
    local: Arc<LocalFs>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl DriveTransfer {
    pub fn new(
        remote: Arc<dyn RemoteDrive>,
        local: Arc<LocalFs>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            remote,
            local,
            policy,
            cancel,
        }
    }
}

#[async_trait]
impl Transfer for DriveTransfer {
    async fn upload(
        &self,
        rel_path: &str,
        parent_id: &str,
        name: &str,
        existing_id: Option<&str>,
    ) -> Result<Uploaded> {
        let local = self
            .local
            .stat(rel_path)
            .await?
            .ok_or_else(|| SyncError::transfer(rel_path, "local file disappeared"))?;
        let data = self.local.read(rel_path).await?;

        // 读取期间文件被改写时放弃，下一轮重新评估
        if data.len() as u64 != local.size {
            return Err(SyncError::transfer(rel_path, "local file changed while reading"));
        }
        let fingerprint = {
            let data = data.clone();
            tokio::task::spawn_blocking(move || fingerprint_bytes(&data))
                .await
                .map_err(|e| SyncError::transfer(rel_path, e))?
        };

        let item = with_retry(&self.policy, "upload", &self.cancel, || {
            self.remote.upload(parent_id, name, data.clone(), existing_id)
        })
        .await?;

        Ok(Uploaded {
            item,
            fingerprint,
            local,
        })
    }

    async fn fetch(&self, remote_id: &str, rel_path: &str) -> Result<Vec<u8>> {
        with_retry(&self.policy, "download", &self.cancel, || {
            self.remote.download(remote_id)
        })
        .await
        .map_err(|e| match e {
            SyncError::Remote(inner) => SyncError::transfer(rel_path, inner),
            other => other,
        })
    }
}
