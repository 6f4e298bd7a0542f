//! 进程内驱动器
//!
//! 维护一份变更日志，提供真实的增量变更流：游标是日志序号，
//! `compact()` 之后更早的游标失效。用于演练和测试。

use super::{DeltaPage, RemoteDrive, RemoteItem};
use crate::core::fingerprint::fingerprint_bytes;
use crate::core::path;
use crate::error::RemoteError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

const ROOT_ID: &str = "root";
const DEFAULT_PAGE_SIZE: usize = 200;

#[derive(Debug, Clone)]
struct Node {
    id: String,
    parent_id: String,
    name: String,
    is_folder: bool,
    data: Vec<u8>,
    mtime: i64,
    version: u64,
    deleted: bool,
}

impl Node {
    fn to_item(&self) -> RemoteItem {
        RemoteItem {
            id: self.id.clone(),
            parent_id: Some(self.parent_id.clone()),
            name: self.name.clone(),
            path: None,
            is_folder: self.is_folder,
            deleted: self.deleted,
            size: self.data.len() as u64,
            mtime: self.mtime,
            content_hash: (!self.is_folder).then(|| fingerprint_bytes(&self.data)),
            version: Some(format!("v{}", self.version)),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    nodes: HashMap<String, Node>,
    journal: Vec<(u64, String)>,
    seq: u64,
    /// 早于它的游标已失效
    floor: u64,
    next_id: u64,
    failing: HashSet<String>,
}

impl Inner {
    fn touch(&mut self, id: &str) {
        self.seq += 1;
        self.journal.push((self.seq, id.to_string()));
    }

    fn live(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id).filter(|n| !n.deleted)
    }

    fn check_failure(&self, name: &str) -> Result<(), RemoteError> {
        if self.failing.contains(name) {
            return Err(RemoteError::Transient(format!("injected failure for {}", name)));
        }
        Ok(())
    }

    fn path_of(&self, id: &str) -> Option<String> {
        let mut parts = Vec::new();
        let mut current = id;
        while current != ROOT_ID {
            let node = self.live(current)?;
            parts.push(node.name.as_str());
            current = &node.parent_id;
        }
        parts.reverse();
        Some(parts.join("/"))
    }

    fn child(&self, parent_id: &str, name: &str) -> Option<&Node> {
        self.nodes
            .values()
            .find(|n| !n.deleted && n.parent_id == parent_id && n.name == name)
    }

    fn resolve(&self, rel_path: &str) -> Option<String> {
        let mut current = ROOT_ID.to_string();
        for seg in rel_path.split('/').filter(|s| !s.is_empty()) {
            current = self.child(&current, seg)?.id.clone();
        }
        Some(current)
    }

    fn ensure_folder(&self, parent_id: &str) -> Result<(), RemoteError> {
        if parent_id == ROOT_ID {
            return Ok(());
        }
        match self.live(parent_id) {
            Some(n) if n.is_folder => Ok(()),
            Some(_) => Err(RemoteError::Permanent(format!("{} is not a folder", parent_id))),
            None => Err(RemoteError::NotFound(parent_id.to_string())),
        }
    }

    fn insert(&mut self, parent_id: &str, name: &str, is_folder: bool, data: Vec<u8>) -> String {
        self.next_id += 1;
        let id = format!("item-{}", self.next_id);
        self.nodes.insert(
            id.clone(),
            Node {
                id: id.clone(),
                parent_id: parent_id.to_string(),
                name: path::normalize_name(name),
                is_folder,
                data,
                mtime: chrono::Utc::now().timestamp(),
                version: 1,
                deleted: false,
            },
        );
        self.touch(&id);
        id
    }

    fn descendants(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            for node in self.nodes.values() {
                if !node.deleted && node.parent_id == current {
                    out.push(node.id.clone());
                    stack.push(node.id.clone());
                }
            }
        }
        out
    }

    fn remove(&mut self, id: &str) {
        // 子孙先记入日志，与真实变更流一致
        let mut ids = self.descendants(id);
        ids.reverse();
        ids.push(id.to_string());
        for victim in ids {
            if let Some(node) = self.nodes.get_mut(&victim) {
                node.deleted = true;
                self.touch(&victim);
            }
        }
    }

    fn page(&self, items: Vec<RemoteItem>, hi: u64, offset: usize, page_size: usize) -> DeltaPage {
        let end = (offset + page_size).min(items.len());
        let page_items = items[offset.min(end)..end].to_vec();
        if end < items.len() {
            DeltaPage {
                items: page_items,
                next_page: Some(format!("{}:{}", hi, end)),
                cursor: None,
            }
        } else {
            DeltaPage {
                items: page_items,
                next_page: None,
                cursor: Some(hi.to_string()),
            }
        }
    }
}

fn parse_page(page: Option<&str>, current: u64) -> Result<(u64, usize), RemoteError> {
    match page {
        None => Ok((current, 0)),
        Some(token) => {
            let (hi, offset) = token
                .split_once(':')
                .ok_or_else(|| RemoteError::Permanent(format!("bad page token {}", token)))?;
            let hi = hi
                .parse()
                .map_err(|_| RemoteError::Permanent(format!("bad page token {}", token)))?;
            let offset = offset
                .parse()
                .map_err(|_| RemoteError::Permanent(format!("bad page token {}", token)))?;
            Ok((hi, offset))
        }
    }
}

/// 进程内驱动器
pub struct MemoryDrive {
    name: String,
    page_size: usize,
    inner: Mutex<Inner>,
}

impl MemoryDrive {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // 锁内不会 panic，中毒时直接沿用数据
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 按路径创建目录（含父目录），返回 ID
    pub fn mkdir(&self, rel_path: &str) -> String {
        let mut inner = self.lock();
        let mut current = ROOT_ID.to_string();
        for seg in path::normalize_path(rel_path).split('/').filter(|s| !s.is_empty()) {
            current = match inner.child(&current, seg) {
                Some(n) => n.id.clone(),
                None => inner.insert(&current, seg, true, Vec::new()),
            };
        }
        current
    }

    /// 按路径写入文件（自动创建父目录），返回 ID
    pub fn put(&self, rel_path: &str, data: &[u8]) -> String {
        let rel_path = path::normalize_path(rel_path);
        let parent_id = self.mkdir(path::parent(&rel_path));
        let mut inner = self.lock();
        let name = path::file_name(&rel_path).to_string();
        let existing = inner.child(&parent_id, &name).map(|n| n.id.clone());
        match existing {
            Some(id) => {
                if let Some(node) = inner.nodes.get_mut(&id) {
                    node.data = data.to_vec();
                    node.version += 1;
                    node.mtime = chrono::Utc::now().timestamp();
                }
                inner.touch(&id);
                id
            }
            None => inner.insert(&parent_id, &name, false, data.to_vec()),
        }
    }

    /// 按路径删除（目录连同子孙）
    pub fn remove(&self, rel_path: &str) -> bool {
        let mut inner = self.lock();
        match inner.resolve(&path::normalize_path(rel_path)) {
            Some(id) if id != ROOT_ID => {
                inner.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// 按路径移动/改名
    pub fn rename(&self, from: &str, to: &str) -> bool {
        let to = path::normalize_path(to);
        let new_parent = self.mkdir(path::parent(&to));
        let mut inner = self.lock();
        let Some(id) = inner.resolve(&path::normalize_path(from)) else {
            return false;
        };
        if id == ROOT_ID {
            return false;
        }
        if let Some(node) = inner.nodes.get_mut(&id) {
            node.parent_id = new_parent;
            node.name = path::file_name(&to).to_string();
        }
        inner.touch(&id);
        true
    }

    pub fn read(&self, rel_path: &str) -> Option<Vec<u8>> {
        let inner = self.lock();
        let id = inner.resolve(&path::normalize_path(rel_path))?;
        inner.live(&id).filter(|n| !n.is_folder).map(|n| n.data.clone())
    }

    pub fn id_of(&self, rel_path: &str) -> Option<String> {
        let inner = self.lock();
        inner
            .resolve(&path::normalize_path(rel_path))
            .filter(|id| id != ROOT_ID)
    }

    /// 所有存活条目的路径（目录带 `/` 后缀）
    pub fn list_paths(&self) -> Vec<String> {
        let inner = self.lock();
        let mut paths: Vec<String> = inner
            .nodes
            .values()
            .filter(|n| !n.deleted)
            .filter_map(|n| {
                let p = inner.path_of(&n.id)?;
                Some(if n.is_folder { format!("{}/", p) } else { p })
            })
            .collect();
        paths.sort();
        paths
    }

    /// 丢弃变更日志，此前的游标全部失效
    pub fn compact(&self) {
        let mut inner = self.lock();
        inner.floor = inner.seq;
        inner.journal.clear();
    }

    /// 名称为 `name` 的条目上的操作返回临时错误
    pub fn fail_on(&self, name: &str) {
        self.lock().failing.insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    pub fn current_cursor(&self) -> String {
        self.lock().seq.to_string()
    }
}

#[async_trait]
impl RemoteDrive for MemoryDrive {
    fn name(&self) -> &str {
        &self.name
    }

    fn root_id(&self) -> &str {
        ROOT_ID
    }

    async fn delta(&self, cursor: &str, page: Option<&str>) -> Result<DeltaPage, RemoteError> {
        let inner = self.lock();
        let from: u64 = cursor.parse().map_err(|_| RemoteError::CursorInvalid)?;
        if from < inner.floor || from > inner.seq {
            return Err(RemoteError::CursorInvalid);
        }

        let (hi, offset) = parse_page(page, inner.seq)?;

        // 同一条目多次变更只返回一次，位置取最后一次
        let mut last_pos: HashMap<&str, usize> = HashMap::new();
        let changes: Vec<&(u64, String)> = inner
            .journal
            .iter()
            .filter(|(seq, _)| *seq > from && *seq <= hi)
            .collect();
        for (pos, (_, id)) in changes.iter().enumerate() {
            last_pos.insert(id.as_str(), pos);
        }
        let mut ordered: Vec<(&str, usize)> = last_pos.into_iter().collect();
        ordered.sort_by_key(|(_, pos)| *pos);

        let items: Vec<RemoteItem> = ordered
            .into_iter()
            .filter_map(|(id, _)| inner.nodes.get(id).map(Node::to_item))
            .collect();

        Ok(inner.page(items, hi, offset, self.page_size))
    }

    async fn list_all(&self, page: Option<&str>) -> Result<DeltaPage, RemoteError> {
        let inner = self.lock();
        let (hi, offset) = parse_page(page, inner.seq)?;

        let mut items: Vec<RemoteItem> = inner
            .nodes
            .values()
            .filter(|n| !n.deleted)
            .map(Node::to_item)
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(inner.page(items, hi, offset, self.page_size))
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<RemoteItem, RemoteError> {
        let mut inner = self.lock();
        inner.check_failure(name)?;
        inner.ensure_folder(parent_id)?;
        if let Some(existing) = inner.child(parent_id, &path::normalize_name(name)) {
            if existing.is_folder {
                return Ok(existing.to_item());
            }
            return Err(RemoteError::Permanent(format!("{} already exists", name)));
        }
        let id = inner.insert(parent_id, name, true, Vec::new());
        inner
            .live(&id)
            .map(Node::to_item)
            .ok_or(RemoteError::NotFound(id))
    }

    async fn upload(
        &self,
        parent_id: &str,
        name: &str,
        data: Vec<u8>,
        existing_id: Option<&str>,
    ) -> Result<RemoteItem, RemoteError> {
        let mut inner = self.lock();
        inner.check_failure(name)?;
        inner.ensure_folder(parent_id)?;

        let id = match existing_id {
            Some(id) => {
                let node = inner
                    .nodes
                    .get_mut(id)
                    .filter(|n| !n.deleted)
                    .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
                node.data = data;
                node.version += 1;
                node.mtime = chrono::Utc::now().timestamp();
                let id = id.to_string();
                inner.touch(&id);
                id
            }
            None => {
                if inner.child(parent_id, &path::normalize_name(name)).is_some() {
                    return Err(RemoteError::Permanent(format!("{} already exists", name)));
                }
                inner.insert(parent_id, name, false, data)
            }
        };

        inner
            .live(&id)
            .map(Node::to_item)
            .ok_or(RemoteError::NotFound(id))
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, RemoteError> {
        let inner = self.lock();
        let node = inner
            .live(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        inner.check_failure(&node.name)?;
        Ok(node.data.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        let name = inner
            .live(id)
            .map(|n| n.name.clone())
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        inner.check_failure(&name)?;
        inner.remove(id);
        Ok(())
    }

    async fn move_item(
        &self,
        id: &str,
        new_parent_id: &str,
        new_name: &str,
    ) -> Result<RemoteItem, RemoteError> {
        let mut inner = self.lock();
        let name = inner
            .live(id)
            .map(|n| n.name.clone())
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        inner.check_failure(&name)?;
        inner.ensure_folder(new_parent_id)?;

        let new_name = path::normalize_name(new_name);
        if let Some(other) = inner.child(new_parent_id, &new_name) {
            if other.id != id {
                return Err(RemoteError::Permanent(format!("{} already exists", new_name)));
            }
        }
        // 不能移到自己的子孙下
        if inner.descendants(id).iter().any(|d| d == new_parent_id) || new_parent_id == id {
            return Err(RemoteError::Permanent("cannot move folder into itself".into()));
        }

        if let Some(node) = inner.nodes.get_mut(id) {
            node.parent_id = new_parent_id.to_string();
            node.name = new_name;
        }
        inner.touch(id);
        inner
            .live(id)
            .map(Node::to_item)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }
}
