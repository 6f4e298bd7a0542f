pub mod memory;
pub mod object;

use crate::config::{RemoteConfig, RemoteType};
use crate::error::RemoteError;
use async_trait::async_trait;
use std::sync::Arc;

pub use memory::MemoryDrive;
pub use object::ObjectDrive;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 远端条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    pub id: String,
    /// 根目录下的条目为根目录 ID
    pub parent_id: Option<String>,
    pub name: String,
    /// 后端能直接给出完整路径时填写（ID 即路径的后端）
    pub path: Option<String>,
    pub is_folder: bool,
    pub deleted: bool,
    pub size: u64,
    pub mtime: i64,
    /// 与本地指纹同一算法的内容哈希，远端不提供时为 None
    pub content_hash: Option<String>,
    /// 内容版本标记（eTag 等），移动不改变它
    pub version: Option<String>,
}

/// 变更流的一页
#[derive(Debug, Clone, Default)]
pub struct DeltaPage {
    pub items: Vec<RemoteItem>,
    /// 还有下一页时的页标记
    pub next_page: Option<String>,
    /// 最后一页携带的新游标
    pub cursor: Option<String>,
}

/// 远端驱动器接口
#[async_trait]
pub trait RemoteDrive: Send + Sync {
    /// 显示名称
    fn name(&self) -> &str;

    fn root_id(&self) -> &str;

    /// 不支持增量变更流的后端每轮都做全量枚举
    fn supports_delta(&self) -> bool {
        true
    }

    /// 从游标位置读取变更，游标过期时返回 `RemoteError::CursorInvalid`
    async fn delta(&self, cursor: &str, page: Option<&str>) -> Result<DeltaPage, RemoteError>;

    /// 全量枚举当前所有条目（不含根目录）
    async fn list_all(&self, page: Option<&str>) -> Result<DeltaPage, RemoteError>;

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<RemoteItem, RemoteError>;

    /// 上传内容；`existing_id` 为已有条目时覆盖其内容
    async fn upload(
        &self,
        parent_id: &str,
        name: &str,
        data: Vec<u8>,
        existing_id: Option<&str>,
    ) -> Result<RemoteItem, RemoteError>;

    async fn download(&self, id: &str) -> Result<Vec<u8>, RemoteError>;

    async fn delete(&self, id: &str) -> Result<(), RemoteError>;

    async fn move_item(
        &self,
        id: &str,
        new_parent_id: &str,
        new_name: &str,
    ) -> Result<RemoteItem, RemoteError>;
}

/// 根据配置创建远端
pub async fn create_remote(config: &RemoteConfig) -> anyhow::Result<Arc<dyn RemoteDrive>> {
    match config.typ {
        RemoteType::Memory => Ok(Arc::new(MemoryDrive::new("memory"))),
        RemoteType::Fs => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("fs 远端缺少 path"))?;
            Ok(Arc::new(ObjectDrive::fs(path)?))
        }
        RemoteType::S3 => {
            let bucket = config
                .bucket
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("S3 缺少 bucket"))?;
            let region = config.region.as_deref().unwrap_or("us-east-1");
            let access_key = config
                .access_key
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("S3 缺少 accessKey"))?;
            let secret_key = config
                .secret_key
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("S3 缺少 secretKey"))?;
            Ok(Arc::new(ObjectDrive::s3(
                bucket,
                region,
                access_key,
                secret_key,
                config.endpoint.clone(),
                config.prefix.clone(),
            )?))
        }
        RemoteType::WebDav => {
            let endpoint = config
                .webdav_endpoint
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV 缺少 endpoint"))?;
            let username = config.username.as_deref().unwrap_or("");
            let password = config.password.as_deref().unwrap_or("");
            Ok(Arc::new(
                ObjectDrive::webdav(endpoint, username, password, config.root.clone()).await?,
            ))
        }
    }
}
