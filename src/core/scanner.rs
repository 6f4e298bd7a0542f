//! 本地扫描器
//!
//! 遍历同步根目录，先应用过滤规则再计算指纹；大小和修改时间都与上次同步快照
//! 一致的文件直接沿用快照中的指纹。

use crate::core::filter::FilterRules;
use crate::core::fingerprint::fingerprint_file;
use crate::core::path;
use crate::core::state::{ItemRecord, Tombstone};
use crate::error::{Result, SyncError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 目录的三种状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderState {
    /// 状态库中没有记录
    New,
    /// 曾被删除（有墓碑）后又出现
    Resurrected,
    /// 已跟踪
    Known,
}

/// 本地扫描条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub path: String,
    pub size: u64,
    /// 纳秒
    pub mtime: i64,
    /// 目录为 None
    pub fingerprint: Option<String>,
    pub is_folder: bool,
    pub folder_state: Option<FolderState>,
}

/// 上次同步存在、本次扫描不见了的条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingItem {
    pub key: String,
    pub path: String,
    pub is_folder: bool,
}

/// 扫描结果
#[derive(Debug, Clone, Default)]
pub struct LocalScan {
    pub entries: BTreeMap<String, LocalEntry>,
    pub missing: Vec<MissingItem>,
    /// 被过滤规则或标记文件排除的条目数
    pub excluded: usize,
    /// 实际计算了指纹的文件数
    pub hashed: usize,
    /// 读取失败的路径，它们及其子孙不会被当作已删除
    pub unreadable: Vec<(String, String)>,
    /// 因符号链接、标记文件或过滤规则被整体跳过的目录
    pub pruned: Vec<String>,
}

impl LocalScan {
    pub fn get(&self, rel_path: &str) -> Option<&LocalEntry> {
        self.entries.get(rel_path)
    }

    /// 路径位于本轮没有看到内容的子树中（被跳过或读取失败）
    pub fn is_shielded(&self, rel_path: &str) -> bool {
        self.pruned
            .iter()
            .map(String::as_str)
            .chain(self.unreadable.iter().map(|(p, _)| p.as_str()))
            .any(|p| rel_path == p || path::is_within(rel_path, p))
    }
}

/// 遍历得到的原始条目
struct RawEntry {
    path: String,
    fs_path: PathBuf,
    size: u64,
    mtime: i64,
    is_folder: bool,
}

#[derive(Default)]
struct WalkOutput {
    entries: Vec<RawEntry>,
    excluded: usize,
    excluded_dirs: Vec<String>,
    unreadable: Vec<(String, String)>,
}

pub(crate) fn mtime_nanos(meta: &Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// 阻塞遍历
fn walk(root: &Path, rules: &FilterRules) -> WalkOutput {
    let mut out = WalkOutput::default();
    let mut seen = HashSet::new();
    // filter_entry 的闭包不能可变借用 out，被剪枝的目录先收集到这里
    let pruned = std::cell::RefCell::new(Vec::<String>::new());

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let Some(rel) = entry
                .path()
                .strip_prefix(root)
                .ok()
                .and_then(path::from_relative)
            else {
                return false;
            };

            let ft = entry.file_type();
            if ft.is_symlink() && rules.skip_symlinks() {
                pruned.borrow_mut().push(rel);
                return false;
            }
            if ft.is_dir() {
                let marked = rules
                    .ignore_marker()
                    .is_some_and(|m| entry.path().join(m).exists());
                if marked || rules.excludes_dir(&rel) {
                    pruned.borrow_mut().push(rel);
                    return false;
                }
            }
            true
        });

    for item in walker {
        let entry = match item {
            Ok(e) => e,
            Err(e) => {
                let rel = e
                    .path()
                    .and_then(|p| p.strip_prefix(root).ok())
                    .and_then(path::from_relative)
                    .unwrap_or_default();
                warn!("无法读取 {:?}: {}", rel, e);
                out.unreadable.push((rel, e.to_string()));
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }

        let Some(rel) = entry.path().strip_prefix(root).ok().and_then(path::from_relative) else {
            warn!("跳过非 UTF-8 文件名: {:?}", entry.path());
            out.excluded += 1;
            continue;
        };

        // 跟随符号链接取目标的元数据；指向目录的链接不进入
        let meta = if entry.file_type().is_symlink() {
            match std::fs::metadata(entry.path()) {
                Ok(m) if m.is_file() => m,
                Ok(_) => {
                    debug!("不跟随指向目录的符号链接: {}", rel);
                    out.excluded += 1;
                    continue;
                }
                Err(e) => {
                    debug!("失效的符号链接 {}: {}", rel, e);
                    out.excluded += 1;
                    continue;
                }
            }
        } else {
            match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    out.unreadable.push((rel, e.to_string()));
                    continue;
                }
            }
        };

        let is_folder = meta.is_dir();
        if !is_folder && rules.excludes_file(&rel, Some(meta.len())) {
            out.excluded += 1;
            continue;
        }

        // NFC 与 NFD 两个变体同时存在时只保留先遇到的一个
        if !seen.insert(rel.clone()) {
            warn!("规范化后路径重复，忽略: {:?}", entry.path());
            out.excluded += 1;
            continue;
        }

        out.entries.push(RawEntry {
            path: rel,
            fs_path: entry.path().to_path_buf(),
            size: if is_folder { 0 } else { meta.len() },
            mtime: mtime_nanos(&meta),
            is_folder,
        });
    }

    out.excluded_dirs = pruned.into_inner();
    out.excluded += out.excluded_dirs.len();
    out
}

/// 本地扫描器
pub struct LocalScanner {
    rules: Arc<FilterRules>,
    hash_workers: usize,
    cancel: CancellationToken,
}

impl LocalScanner {
    pub fn new(rules: Arc<FilterRules>, hash_workers: usize) -> Self {
        Self {
            rules,
            hash_workers: hash_workers.max(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 扫描根目录
    ///
    /// `records` 和 `tombstones` 是本轮开始时的状态库快照，只读。
    pub async fn scan(
        &self,
        root: &Path,
        records: &[ItemRecord],
        tombstones: &[Tombstone],
    ) -> Result<LocalScan> {
        if !root.is_dir() {
            // 根目录不存在时不能把所有记录当作已删除
            return Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("sync root not found: {}", root.display()),
            )));
        }

        info!("开始扫描本地目录: {}", root.display());

        let rules = self.rules.clone();
        let root_buf = root.to_path_buf();
        let walked = tokio::task::spawn_blocking(move || walk(&root_buf, &rules))
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;

        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let synced: HashMap<&str, &ItemRecord> = records
            .iter()
            .filter(|r| r.synced.is_some())
            .map(|r| (r.path.as_str(), r))
            .collect();
        let tracked_folders: HashSet<&str> = records
            .iter()
            .filter(|r| r.is_folder)
            .map(|r| r.path.as_str())
            .collect();
        let buried_folders: HashSet<&str> = tombstones
            .iter()
            .filter(|t| t.is_folder)
            .map(|t| t.path.as_str())
            .collect();

        let mut scan = LocalScan {
            excluded: walked.excluded,
            unreadable: walked.unreadable,
            ..Default::default()
        };

        let semaphore = Arc::new(Semaphore::new(self.hash_workers));
        let mut handles = Vec::new();

        for raw in walked.entries {
            if raw.is_folder {
                let state = if tracked_folders.contains(raw.path.as_str()) {
                    FolderState::Known
                } else if buried_folders.contains(raw.path.as_str()) {
                    FolderState::Resurrected
                } else {
                    FolderState::New
                };
                scan.entries.insert(
                    raw.path.clone(),
                    LocalEntry {
                        path: raw.path,
                        size: 0,
                        mtime: raw.mtime,
                        fingerprint: None,
                        is_folder: true,
                        folder_state: Some(state),
                    },
                );
                continue;
            }

            // 快速检查：大小和修改时间都没变就沿用快照指纹
            let reused = synced.get(raw.path.as_str()).and_then(|r| {
                let snap = r.synced.as_ref()?;
                (!r.is_folder && snap.size == raw.size && snap.local_mtime == raw.mtime)
                    .then(|| snap.fingerprint.clone())
                    .flatten()
            });

            if let Some(fingerprint) = reused {
                scan.entries.insert(
                    raw.path.clone(),
                    LocalEntry {
                        path: raw.path,
                        size: raw.size,
                        mtime: raw.mtime,
                        fingerprint: Some(fingerprint),
                        is_folder: false,
                        folder_state: None,
                    },
                );
                continue;
            }

            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| SyncError::Cancelled)?;
            handles.push(tokio::spawn(async move {
                let fs_path = raw.fs_path.clone();
                let hashed = tokio::task::spawn_blocking(move || fingerprint_file(&fs_path)).await;
                drop(permit);
                (raw, hashed)
            }));
        }

        for handle in handles {
            let (raw, hashed) = handle
                .await
                .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;
            match hashed {
                Ok(Ok(fingerprint)) => {
                    scan.hashed += 1;
                    scan.entries.insert(
                        raw.path.clone(),
                        LocalEntry {
                            path: raw.path,
                            size: raw.size,
                            mtime: raw.mtime,
                            fingerprint: Some(fingerprint),
                            is_folder: false,
                            folder_state: None,
                        },
                    );
                }
                Ok(Err(e)) => {
                    warn!("计算指纹失败 {}: {}", raw.path, e);
                    scan.unreadable.push((raw.path, e.to_string()));
                }
                Err(e) => {
                    scan.unreadable.push((raw.path, e.to_string()));
                }
            }
        }

        // 被排除或读取失败的路径不算删除
        scan.pruned = walked.excluded_dirs;
        let mut missing = Vec::new();
        for record in records.iter().filter(|r| r.synced.is_some()) {
            if scan.entries.contains_key(&record.path) {
                continue;
            }
            if scan.is_shielded(&record.path)
                || self.rules.excludes_path(&record.path, record.is_folder)
            {
                continue;
            }
            missing.push(MissingItem {
                key: record.key.clone(),
                path: record.path.clone(),
                is_folder: record.is_folder,
            });
        }
        scan.missing = missing;

        info!(
            "本地扫描完成: {} 个条目, {} 个需删除候选, 计算指纹 {} 个, 排除 {} 个",
            scan.entries.len(),
            scan.missing.len(),
            scan.hashed,
            scan.excluded
        );

        Ok(scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::core::fingerprint::fingerprint_bytes;
    use crate::core::state::SyncedSnapshot;

    fn scanner(config: FilterConfig) -> LocalScanner {
        LocalScanner::new(Arc::new(FilterRules::from_config(&config).unwrap()), 2)
    }

    fn tracked(key: &str, rel: &str, fp: &str, size: u64, mtime: i64) -> ItemRecord {
        ItemRecord {
            key: key.into(),
            path: rel.into(),
            remote_id: Some(key.into()),
            parent_remote_id: None,
            is_folder: false,
            size,
            local_fingerprint: Some(fp.into()),
            remote_fingerprint: Some(fp.into()),
            remote_version: None,
            local_mtime: mtime,
            remote_mtime: 0,
            synced: Some(SyncedSnapshot {
                fingerprint: Some(fp.into()),
                size,
                local_mtime: mtime,
                remote_version: None,
            }),
            synced_at: Some(0),
            last_error: None,
            failed_at: None,
        }
    }

    #[tokio::test]
    async fn test_scan_hashes_and_classifies_folders() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs/sub")).unwrap();
        std::fs::write(dir.path().join("docs/a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("docs/b.tmp"), b"scratch").unwrap();

        let scan = scanner(FilterConfig::default())
            .scan(dir.path(), &[], &[])
            .await
            .unwrap();

        let a = scan.get("docs/a.txt").unwrap();
        assert_eq!(a.fingerprint.as_deref(), Some(fingerprint_bytes(b"hello").as_str()));
        assert_eq!(scan.get("docs").unwrap().folder_state, Some(FolderState::New));
        assert!(scan.get("docs/sub").unwrap().is_folder);
        assert!(scan.get("docs/b.tmp").is_none());
        assert_eq!(scan.hashed, 1);
    }

    #[tokio::test]
    async fn test_cheap_check_reuses_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let mtime = mtime_nanos(&std::fs::metadata(&file).unwrap());

        // 快照中故意写一个假指纹：大小和时间一致时不会重新计算
        let records = vec![tracked("id1", "a.txt", "stale", 5, mtime)];
        let scan = scanner(FilterConfig::default())
            .scan(dir.path(), &records, &[])
            .await
            .unwrap();
        assert_eq!(scan.get("a.txt").unwrap().fingerprint.as_deref(), Some("stale"));
        assert_eq!(scan.hashed, 0);

        // 时间不同则重新计算
        let records = vec![tracked("id1", "a.txt", "stale", 5, mtime - 1)];
        let scan = scanner(FilterConfig::default())
            .scan(dir.path(), &records, &[])
            .await
            .unwrap();
        assert_eq!(
            scan.get("a.txt").unwrap().fingerprint.as_deref(),
            Some(fingerprint_bytes(b"hello").as_str())
        );
    }

    #[tokio::test]
    async fn test_missing_excludes_filtered_and_marked() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("private")).unwrap();
        std::fs::write(dir.path().join("private/.nosync"), b"").unwrap();

        let records = vec![
            tracked("id1", "gone.txt", "x", 1, 0),
            tracked("id2", "private/secret.txt", "y", 1, 0),
            tracked("id3", "cache.tmp", "z", 1, 0),
        ];
        let scan = scanner(FilterConfig::default())
            .scan(dir.path(), &records, &[])
            .await
            .unwrap();

        let missing: Vec<_> = scan.missing.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(missing, vec!["gone.txt"]);
        assert!(scan.get("private").is_none());
        assert!(scan.is_shielded("private/new.txt"));
        assert!(!scan.is_shielded("privately.txt"));
    }

    #[tokio::test]
    async fn test_nfd_names_are_normalized() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cafe\u{301}.txt"), b"x").unwrap();

        let scan = scanner(FilterConfig::default())
            .scan(dir.path(), &[], &[])
            .await
            .unwrap();
        assert!(scan.get("caf\u{e9}.txt").is_some());
    }

    #[tokio::test]
    async fn test_resurrected_folder() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("back")).unwrap();
        let stone = Tombstone {
            key: "f1".into(),
            remote_id: Some("f1".into()),
            path: "back".into(),
            is_folder: true,
            deleted_at: 0,
            retain_until: i64::MAX,
        };
        let scan = scanner(FilterConfig::default())
            .scan(dir.path(), &[], &[stone])
            .await
            .unwrap();
        assert_eq!(
            scan.get("back").unwrap().folder_state,
            Some(FolderState::Resurrected)
        );
    }

    #[tokio::test]
    async fn test_missing_root_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = scanner(FilterConfig::default())
            .scan(&dir.path().join("nope"), &[], &[])
            .await;
        assert!(result.is_err());
    }
}
