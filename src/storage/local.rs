use crate::core::filter::FilterRules;
use crate::core::path;
use crate::core::scanner::mtime_nanos;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 本地条目的元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMeta {
    pub size: u64,
    /// 纳秒
    pub mtime: i64,
    pub is_dir: bool,
}

/// 同步根目录下的文件操作
///
/// 所有路径都是规范相对路径；写入先落到同目录的临时文件再原子改名。
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, rel_path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for seg in rel_path.split('/').filter(|s| !s.is_empty()) {
            full.push(seg);
        }
        full
    }

    pub async fn stat(&self, rel_path: &str) -> io::Result<Option<LocalMeta>> {
        match fs::metadata(self.resolve(rel_path)).await {
            Ok(meta) => Ok(Some(LocalMeta {
                size: if meta.is_dir() { 0 } else { meta.len() },
                mtime: mtime_nanos(&meta),
                is_dir: meta.is_dir(),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn read(&self, rel_path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(rel_path)).await
    }

    /// 原子写入，返回写入后的元数据
    pub async fn write_atomic(&self, rel_path: &str, data: &[u8]) -> io::Result<LocalMeta> {
        let full_path = self.resolve(rel_path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 临时文件名以 .partial 结尾，默认过滤规则会忽略它
        let temp_name = format!(
            ".{}.{}.partial",
            path::file_name(rel_path),
            uuid::Uuid::new_v4().simple()
        );
        let temp_path = full_path.with_file_name(temp_name);

        // 失败时清理临时文件
        let guard = scopeguard::guard(temp_path.clone(), |p| {
            let _ = std::fs::remove_file(p);
        });
        fs::write(&temp_path, data).await?;
        fs::rename(&temp_path, &full_path).await?;
        scopeguard::ScopeGuard::into_inner(guard);

        let meta = fs::metadata(&full_path).await?;
        Ok(LocalMeta {
            size: meta.len(),
            mtime: mtime_nanos(&meta),
            is_dir: false,
        })
    }

    pub async fn create_dir(&self, rel_path: &str) -> io::Result<LocalMeta> {
        let full_path = self.resolve(rel_path);
        fs::create_dir_all(&full_path).await?;
        let meta = fs::metadata(&full_path).await?;
        Ok(LocalMeta {
            size: 0,
            mtime: mtime_nanos(&meta),
            is_dir: true,
        })
    }

    /// 删除文件，不存在时视为成功
    pub async fn remove_file(&self, rel_path: &str) -> io::Result<()> {
        match fs::remove_file(self.resolve(rel_path)).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// 删除目录
    ///
    /// 只有目录为空，或剩下的都是被过滤规则排除的文件时才删除；
    /// 否则返回错误，避免删掉扫描之后新出现的内容。
    pub async fn remove_dir(&self, rel_path: &str, rules: &FilterRules) -> io::Result<()> {
        let full_path = self.resolve(rel_path);
        if !full_path.exists() {
            return Ok(());
        }

        let mut leftovers = Vec::new();
        let mut entries = fs::read_dir(&full_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let child = path::join(rel_path, &path::normalize_name(&name.to_string_lossy()));
            let ft = entry.file_type().await?;
            if ft.is_dir() || !rules.excludes_file(&child, None) {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("folder not empty: {}", rel_path),
                ));
            }
            leftovers.push(entry.path());
        }

        for leftover in leftovers {
            fs::remove_file(leftover).await?;
        }
        fs::remove_dir(&full_path).await
    }

    /// 改名；目标已存在时报错
    pub async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let src = self.resolve(from);
        let dst = self.resolve(to);
        if src == dst {
            return Ok(());
        }
        if fs::symlink_metadata(&dst).await.is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("target exists: {}", to),
            ));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&src, &dst).await
    }

    /// 根目录所在文件系统的可用空间
    pub fn available_space(&self) -> io::Result<u64> {
        fs2::available_space(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;

    #[tokio::test]
    async fn test_write_atomic_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalFs::new(dir.path());
        let meta = local.write_atomic("a/b/c.txt", b"data").await.unwrap();
        assert_eq!(meta.size, 4);
        assert_eq!(local.read("a/b/c.txt").await.unwrap(), b"data");

        // 没有遗留临时文件
        let names: Vec<_> = std::fs::read_dir(dir.path().join("a/b"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_rename_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalFs::new(dir.path());
        local.write_atomic("a.txt", b"a").await.unwrap();
        local.write_atomic("b.txt", b"b").await.unwrap();
        assert!(local.rename("a.txt", "b.txt").await.is_err());
        local.rename("a.txt", "sub/c.txt").await.unwrap();
        assert_eq!(local.read("sub/c.txt").await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_remove_dir_keeps_unexpected_content() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalFs::new(dir.path());
        let rules = FilterRules::from_config(&FilterConfig::default()).unwrap();

        local.write_atomic("junk/Thumbs.db", b"x").await.unwrap();
        local.remove_dir("junk", &rules).await.unwrap();
        assert!(local.stat("junk").await.unwrap().is_none());

        local.write_atomic("keep/new.txt", b"x").await.unwrap();
        assert!(local.remove_dir("keep", &rules).await.is_err());
        assert!(local.stat("keep/new.txt").await.unwrap().is_some());
    }
}
