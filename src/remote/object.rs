//! 对象存储后端（S3 / WebDAV / 本地目录）
//!
//! 这些后端没有稳定的条目 ID，也没有变更流：ID 就是路径（目录以 `/` 结尾），
//! 每轮全量枚举。

use super::{DeltaPage, RemoteDrive, RemoteItem, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use crate::core::path;
use crate::error::RemoteError;
use async_trait::async_trait;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Metadata, Metakey, Operator};
use std::time::Duration;
use tracing::debug;

const ROOT_ID: &str = "";

pub struct ObjectDrive {
    operator: Operator,
    name: String,
}

fn parent_id_of(id: &str) -> String {
    let trimmed = id.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => trimmed[..=pos].to_string(),
        None => ROOT_ID.to_string(),
    }
}

fn child_id(parent_id: &str, name: &str, is_folder: bool) -> String {
    let suffix = if is_folder { "/" } else { "" };
    format!("{}{}{}", parent_id, name, suffix)
}

fn to_item(id: &str, meta: &Metadata) -> RemoteItem {
    let is_folder = id.ends_with('/') || meta.is_dir();
    let mtime = meta.last_modified().map_or(0, |t| t.timestamp());
    let size = if is_folder { 0 } else { meta.content_length() };
    let version = meta
        .etag()
        .map(|s| s.trim_matches('"').to_string())
        .unwrap_or_else(|| format!("{}-{}", size, mtime));

    RemoteItem {
        id: id.to_string(),
        parent_id: Some(parent_id_of(id)),
        name: path::normalize_name(path::file_name(id.trim_end_matches('/'))),
        path: Some(path::normalize_path(id)),
        is_folder,
        deleted: false,
        size,
        mtime,
        content_hash: None,
        version: (!is_folder).then_some(version),
    }
}

impl ObjectDrive {
    fn with_timeouts(operator: Operator) -> Operator {
        operator
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
    }

    pub fn s3(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<String>,
        prefix: Option<String>,
    ) -> Result<Self, RemoteError> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        if let Some(ref p) = prefix {
            builder = builder.root(p);
        }

        let operator = Self::with_timeouts(Operator::new(builder)?.finish());

        let name = format!(
            "s3://{}{}",
            bucket,
            prefix
                .as_deref()
                .map(|p| format!("/{}", p))
                .unwrap_or_default()
        );

        Ok(Self { operator, name })
    }

    pub async fn webdav(
        endpoint: &str,
        username: &str,
        password: &str,
        root: Option<String>,
    ) -> Result<Self, RemoteError> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default()
            .endpoint(endpoint)
            .username(username)
            .password(password);

        if let Some(ref r) = root {
            builder = builder.root(r);
        }

        let operator = Self::with_timeouts(Operator::new(builder)?.finish());

        let name = format!(
            "webdav://{}{}",
            endpoint.trim_end_matches('/'),
            root.as_deref()
                .map(|r| format!("/{}", r.trim_start_matches('/')))
                .unwrap_or_default()
        );

        // 某些 WebDAV 服务器需要先创建根目录，已存在时忽略错误
        let _ = operator.create_dir("/").await;

        Ok(Self { operator, name })
    }

    pub fn fs(root: &str) -> Result<Self, RemoteError> {
        use opendal::services::Fs;

        std::fs::create_dir_all(root).map_err(|e| RemoteError::Permanent(e.to_string()))?;
        let operator = Operator::new(Fs::default().root(root))?.finish();
        Ok(Self {
            operator,
            name: format!("fs://{}", root),
        })
    }

    async fn stat_item(&self, id: &str) -> Result<RemoteItem, RemoteError> {
        let meta = self.operator.stat(id).await?;
        Ok(to_item(id, &meta))
    }

    /// 不支持 rename 的后端：逐个复制再删除
    async fn copy_tree(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.operator.create_dir(to).await?;
        let mut lister = self
            .operator
            .lister_with(from)
            .recursive(true)
            .metakey(Metakey::Mode)
            .await?;

        while let Some(entry) = lister.try_next().await? {
            let src = entry.path();
            if src == from {
                continue;
            }
            let Some(suffix) = src.strip_prefix(from) else {
                continue;
            };
            let dst = format!("{}{}", to, suffix);
            if entry.metadata().is_dir() {
                self.operator.create_dir(&dst).await?;
            } else {
                self.operator.copy(src, &dst).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteDrive for ObjectDrive {
    fn name(&self) -> &str {
        &self.name
    }

    fn root_id(&self) -> &str {
        ROOT_ID
    }

    fn supports_delta(&self) -> bool {
        false
    }

    async fn delta(&self, _cursor: &str, _page: Option<&str>) -> Result<DeltaPage, RemoteError> {
        Err(RemoteError::CursorInvalid)
    }

    async fn list_all(&self, _page: Option<&str>) -> Result<DeltaPage, RemoteError> {
        let mut items = Vec::new();

        let mut lister = self
            .operator
            .lister_with("")
            .recursive(true)
            .metakey(
                Metakey::ContentLength | Metakey::LastModified | Metakey::Mode | Metakey::Etag,
            )
            .await?;

        while let Some(entry) = lister.try_next().await? {
            let id = entry.path().trim_start_matches('/');

            // 跳过根目录
            if id.is_empty() {
                continue;
            }

            items.push(to_item(id, entry.metadata()));
        }

        debug!("{} 全量枚举 {} 个条目", self.name, items.len());

        Ok(DeltaPage {
            items,
            next_page: None,
            cursor: Some(chrono::Utc::now().timestamp().to_string()),
        })
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<RemoteItem, RemoteError> {
        let id = child_id(parent_id, name, true);
        self.operator.create_dir(&id).await?;
        Ok(self
            .stat_item(&id)
            .await
            .unwrap_or_else(|_| RemoteItem {
                id: id.clone(),
                parent_id: Some(parent_id.to_string()),
                name: name.to_string(),
                path: Some(path::normalize_path(&id)),
                is_folder: true,
                deleted: false,
                size: 0,
                mtime: 0,
                content_hash: None,
                version: None,
            }))
    }

    async fn upload(
        &self,
        parent_id: &str,
        name: &str,
        data: Vec<u8>,
        existing_id: Option<&str>,
    ) -> Result<RemoteItem, RemoteError> {
        let id = existing_id
            .map(str::to_string)
            .unwrap_or_else(|| child_id(parent_id, name, false));
        self.operator.write(&id, data).await?;
        self.stat_item(&id).await
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, RemoteError> {
        let data = self.operator.read(id).await?;
        Ok(data.to_vec())
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        if id.ends_with('/') {
            self.operator.remove_all(id).await?;
        } else {
            self.operator.delete(id).await?;
        }
        Ok(())
    }

    async fn move_item(
        &self,
        id: &str,
        new_parent_id: &str,
        new_name: &str,
    ) -> Result<RemoteItem, RemoteError> {
        let is_folder = id.ends_with('/');
        let new_id = child_id(new_parent_id, new_name, is_folder);
        let can_rename = self.operator.info().full_capability().rename;

        if is_folder {
            self.copy_tree(id, &new_id).await?;
            self.operator.remove_all(id).await?;
        } else if can_rename {
            self.operator.rename(id, &new_id).await?;
        } else {
            self.operator.copy(id, &new_id).await?;
            self.operator.delete(id).await?;
        }

        self.stat_item(&new_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_ids() {
        assert_eq!(parent_id_of("a/b/c.txt"), "a/b/");
        assert_eq!(parent_id_of("a/b/"), "a/");
        assert_eq!(parent_id_of("top.txt"), "");
        assert_eq!(child_id("a/", "b", true), "a/b/");
        assert_eq!(child_id("", "x.txt", false), "x.txt");
    }

    #[tokio::test]
    async fn test_fs_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let drive = ObjectDrive::fs(dir.path().to_str().unwrap()).unwrap();

        let folder = drive.create_folder("", "docs").await.unwrap();
        assert_eq!(folder.id, "docs/");
        let file = drive
            .upload(&folder.id, "a.txt", b"hello".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(file.id, "docs/a.txt");
        assert_eq!(file.parent_id.as_deref(), Some("docs/"));

        let listing = drive.list_all(None).await.unwrap();
        let ids: Vec<_> = listing.items.iter().map(|i| i.id.as_str()).collect();
        assert!(ids.contains(&"docs/a.txt"));
        assert!(listing.cursor.is_some());

        let moved = drive.move_item(&file.id, "", "b.txt").await.unwrap();
        assert_eq!(moved.id, "b.txt");
        assert_eq!(drive.download("b.txt").await.unwrap(), b"hello");

        drive.delete("docs/").await.unwrap();
        assert!(!dir.path().join("docs").exists());
    }
}
