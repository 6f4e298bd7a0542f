//! 远端变更处理
//!
//! 从游标位置翻页读取变更流，把父目录 ID + 名称解析成规范路径。
//! 游标失效时回退到全量枚举，并由全量结果推导出删除。

use crate::core::filter::FilterRules;
use crate::core::path;
use crate::core::state::ItemRecord;
use crate::core::transfer::{with_retry, RetryPolicy};
use crate::error::{RemoteError, Result, SyncError};
use crate::remote::{RemoteDrive, RemoteItem};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 已解析路径的远端变更
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub path: String,
    pub is_folder: bool,
    pub deleted: bool,
    pub size: u64,
    pub mtime: i64,
    pub content_hash: Option<String>,
    pub version: Option<String>,
}

impl RemoteEntry {
    fn from_item(item: RemoteItem, rel_path: String) -> Self {
        Self {
            id: item.id,
            parent_id: item.parent_id,
            name: path::normalize_name(&item.name),
            path: rel_path,
            is_folder: item.is_folder,
            deleted: item.deleted,
            size: item.size,
            mtime: item.mtime,
            content_hash: item.content_hash,
            version: item.version,
        }
    }
}

/// 一轮的远端变更集
#[derive(Debug, Clone, Default)]
pub struct RemoteChanges {
    /// 按路径排序，每个 ID 至多一条
    pub entries: Vec<RemoteEntry>,
    /// 变更全部处理完后才可提交的新游标
    pub new_cursor: Option<String>,
    /// 是否代表了远端的完整状态（全量枚举）
    pub is_complete: bool,
    /// 游标失效后回退到了全量枚举
    pub fell_back: bool,
    /// 无法解析路径而被丢弃的条目数，非零时不能推进游标
    pub unresolved: usize,
    pub excluded: usize,
    pub pages: usize,
}

impl RemoteChanges {
    pub fn get(&self, id: &str) -> Option<&RemoteEntry> {
        self.entries.iter().find(|e| e.id == id)
    }
}

/// 变更处理器
pub struct DeltaProcessor {
    remote: Arc<dyn RemoteDrive>,
    rules: Arc<FilterRules>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl DeltaProcessor {
    pub fn new(remote: Arc<dyn RemoteDrive>, rules: Arc<FilterRules>, policy: RetryPolicy) -> Self {
        Self {
            remote,
            rules,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 拉取远端变更
    ///
    /// `cursor` 为 None 时做全量枚举。`records` 是本轮开始时的状态库快照，
    /// 用来解析未出现在本批变更中的父目录路径。
    pub async fn pull(&self, cursor: Option<&str>, records: &[ItemRecord]) -> Result<RemoteChanges> {
        let (items, new_cursor, is_complete, fell_back, pages) =
            match cursor.filter(|_| self.remote.supports_delta()) {
                Some(token) => match self.read_delta(token).await {
                    Ok((items, cursor, pages)) => (items, cursor, false, false, pages),
                    Err(SyncError::Remote(RemoteError::CursorInvalid)) => {
                        warn!("[{}] 变更游标已失效，回退到全量枚举", self.remote.name());
                        let (items, cursor, pages) = self.read_full().await?;
                        (items, cursor, true, true, pages)
                    }
                    Err(e) => return Err(e),
                },
                None => {
                    let (items, cursor, pages) = self.read_full().await?;
                    (items, cursor, true, false, pages)
                }
            };

        let mut changes = self.resolve(items, records, is_complete);
        changes.new_cursor = new_cursor;
        changes.is_complete = is_complete;
        changes.fell_back = fell_back;
        changes.pages = pages;

        info!(
            "[{}] 远端变更: {} 条, {} 页, 全量={}, 未解析={}",
            self.remote.name(),
            changes.entries.len(),
            changes.pages,
            changes.is_complete,
            changes.unresolved
        );
        Ok(changes)
    }

    async fn read_delta(&self, cursor: &str) -> Result<(Vec<RemoteItem>, Option<String>, usize)> {
        let mut items = Vec::new();
        let mut page: Option<String> = None;
        let mut pages = 0;

        loop {
            let current = page.clone();
            let result = with_retry(&self.policy, "delta", &self.cancel, || {
                self.remote.delta(cursor, current.as_deref())
            })
            .await?;
            pages += 1;
            items.extend(result.items);

            match result.next_page {
                Some(next) => page = Some(next),
                None => return Ok((items, result.cursor, pages)),
            }
        }
    }

    async fn read_full(&self) -> Result<(Vec<RemoteItem>, Option<String>, usize)> {
        let mut items = Vec::new();
        let mut page: Option<String> = None;
        let mut pages = 0;

        loop {
            let current = page.clone();
            let result = with_retry(&self.policy, "list_all", &self.cancel, || {
                self.remote.list_all(current.as_deref())
            })
            .await?;
            pages += 1;
            items.extend(result.items);

            match result.next_page {
                Some(next) => page = Some(next),
                None => return Ok((items, result.cursor, pages)),
            }
        }
    }

    /// 去重并解析路径
    fn resolve(&self, items: Vec<RemoteItem>, records: &[ItemRecord], is_complete: bool) -> RemoteChanges {
        let root_id = self.remote.root_id().to_string();

        // 同一 ID 多次出现时以最后一条为准
        let mut latest: HashMap<String, RemoteItem> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for item in items {
            if item.id == root_id {
                continue;
            }
            if !latest.contains_key(&item.id) {
                order.push(item.id.clone());
            }
            latest.insert(item.id.clone(), item);
        }

        let by_id: HashMap<&str, &ItemRecord> = records
            .iter()
            .filter_map(|r| r.remote_id.as_deref().map(|id| (id, r)))
            .collect();

        let mut folder_paths: HashMap<String, String> = records
            .iter()
            .filter(|r| r.is_folder)
            .filter_map(|r| r.remote_id.clone().map(|id| (id, r.path.clone())))
            .collect();
        // 本批中出现的目录必须用新路径，先移除旧值
        for id in latest.keys() {
            folder_paths.remove(id);
        }
        folder_paths.insert(root_id.clone(), String::new());

        let mut changes = RemoteChanges::default();
        let mut resolved: Vec<RemoteEntry> = Vec::new();
        let mut pending: Vec<RemoteItem> = Vec::new();

        for id in order {
            let Some(item) = latest.remove(&id) else {
                continue;
            };
            if item.deleted {
                // 删除只对已跟踪的条目有意义，路径取自记录
                match by_id.get(item.id.as_str()) {
                    Some(record) => {
                        let rel = record.path.clone();
                        resolved.push(RemoteEntry::from_item(item, rel));
                    }
                    None => debug!("忽略未跟踪条目的删除: {}", item.id),
                }
                continue;
            }
            if let Some(p) = item.path.as_deref() {
                let rel = path::normalize_path(p);
                if item.is_folder {
                    folder_paths.insert(item.id.clone(), rel.clone());
                }
                resolved.push(RemoteEntry::from_item(item, rel));
                continue;
            }
            pending.push(item);
        }

        // 父目录可能在本批中排在子条目之后，反复解析直到没有进展
        loop {
            let before = pending.len();
            let mut still_pending = Vec::new();
            for item in pending {
                let parent = item.parent_id.clone().unwrap_or_else(|| root_id.clone());
                match folder_paths.get(&parent) {
                    Some(parent_path) => {
                        let rel = path::join(parent_path, &path::normalize_name(&item.name));
                        if item.is_folder {
                            folder_paths.insert(item.id.clone(), rel.clone());
                        }
                        resolved.push(RemoteEntry::from_item(item, rel));
                    }
                    None => still_pending.push(item),
                }
            }
            pending = still_pending;
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }

        for item in &pending {
            warn!(
                "无法解析远端条目的路径: id={} name={} parent={:?}",
                item.id, item.name, item.parent_id
            );
        }
        changes.unresolved = pending.len();

        // 过滤规则
        resolved.retain(|e| {
            let excluded = self.rules.excludes_path(&e.path, e.is_folder)
                || (!e.is_folder && !e.deleted && self.rules.excludes_file(&e.path, Some(e.size)));
            if excluded {
                changes.excluded += 1;
            }
            !excluded
        });

        // 全量枚举：已跟踪但没出现的条目视为已删除
        if is_complete && changes.unresolved == 0 {
            let seen: HashSet<&str> = resolved.iter().map(|e| e.id.as_str()).collect();
            let live_paths: Vec<&str> = resolved
                .iter()
                .filter(|e| !e.deleted)
                .map(|e| e.path.as_str())
                .collect();
            let mut synthesized = Vec::new();
            for record in records.iter().filter(|r| r.synced.is_some()) {
                let Some(id) = record.remote_id.as_deref() else {
                    continue;
                };
                if seen.contains(id) || self.rules.excludes_path(&record.path, record.is_folder) {
                    continue;
                }
                // 对象存储的目录可能是隐式的，仍有内容时不算删除
                if record.is_folder && live_paths.iter().any(|p| path::is_within(p, &record.path)) {
                    continue;
                }
                synthesized.push(RemoteEntry {
                    id: id.to_string(),
                    parent_id: record.parent_remote_id.clone(),
                    name: path::file_name(&record.path).to_string(),
                    path: record.path.clone(),
                    is_folder: record.is_folder,
                    deleted: true,
                    size: record.size,
                    mtime: record.remote_mtime,
                    content_hash: None,
                    version: None,
                });
            }
            resolved.extend(synthesized);
        }

        resolved.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.id.cmp(&b.id)));
        changes.entries = resolved;
        changes
    }
}
